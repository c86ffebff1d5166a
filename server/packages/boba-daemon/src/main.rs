fn main() {
    if let Err(err) = boba_daemon::cli::run() {
        tracing::error!(error = %err, "boba-daemon failed");
        std::process::exit(1);
    }
}
