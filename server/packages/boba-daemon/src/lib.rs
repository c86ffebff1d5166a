use std::future::IntoFuture;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use app::{build_hook_router, build_relay_router, AppState};
use permission::PermissionPolicy;
use process::AgentLauncher;

pub mod app;
pub mod cli;
pub mod demux;
pub mod hooks;
pub mod mock;
pub mod permission;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod relay;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Relay bind host. The hook listener always binds to loopback.
    pub host: String,
    /// Relay (operator) port.
    pub port: u16,
    /// Permission callback port.
    pub hook_port: u16,
    pub launcher: AgentLauncher,
    pub permissions: PermissionPolicy,
    pub cors: Option<CorsLayer>,
}

/// Permission callbacks come from agents on this machine, which the hook
/// forwarder reaches at the loopback address.
pub fn hook_listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

pub async fn run_daemon(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState::new(config.launcher, config.permissions);

    let mut relay_app = build_relay_router(state.clone());
    if let Some(cors) = config.cors {
        relay_app = relay_app.layer(cors);
    }
    let hook_app = build_hook_router(state.clone());

    let relay_addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let hook_addr = hook_listen_addr(config.hook_port);
    let relay_listener = tokio::net::TcpListener::bind(relay_addr).await?;
    let hook_listener = tokio::net::TcpListener::bind(hook_addr).await?;
    tracing::info!(relay_addr = %relay_addr, hook_addr = %hook_addr, "boba-daemon listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_state = state.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        // Settles hook calls and stops agents so both servers can drain.
        signal_state.shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    let relay_server = axum::serve(relay_listener, relay_app)
        .with_graceful_shutdown(wait_for(shutdown_rx.clone()))
        .into_future();
    let hook_server = axum::serve(hook_listener, hook_app)
        .with_graceful_shutdown(wait_for(shutdown_rx))
        .into_future();
    tokio::try_join!(relay_server, hook_server)?;
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Test helper: binds both routers on ephemeral ports and serves them until
/// the returned handle is dropped.
pub async fn serve_ephemeral(state: Arc<AppState>) -> std::io::Result<EphemeralServer> {
    let relay_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let hook_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = relay_listener.local_addr()?;
    let hook_addr = hook_listener.local_addr()?;

    let relay_app = build_relay_router(state.clone());
    let hook_app = build_hook_router(state);
    let relay_task = tokio::spawn(async move {
        let _ = axum::serve(relay_listener, relay_app).await;
    });
    let hook_task = tokio::spawn(async move {
        let _ = axum::serve(hook_listener, hook_app).await;
    });

    Ok(EphemeralServer {
        relay_addr,
        hook_addr,
        tasks: vec![relay_task, hook_task],
    })
}

#[derive(Debug)]
pub struct EphemeralServer {
    pub relay_addr: SocketAddr,
    pub hook_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
