use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand, ValueEnum};
use schemars::schema_for;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::hooks::{self, HookInstall, HookSettings, SESSION_ENV_VAR};
use crate::mock::MockAgent;
use crate::permission::{PermissionPolicy, DEFAULT_READ_ONLY_TOOLS};
use crate::process::{AgentLauncher, CommandLauncher, LaunchSpec, DEFAULT_INITIAL_PROMPT};
use crate::protocol::{ClientCommand, ServerEvent};
use crate::{hook_listen_addr, run_daemon, DaemonConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_HOOK_PORT: u16 = 3002;
const DEFAULT_PERMISSION_TIMEOUT_MS: u64 = 30_000;

#[derive(Parser, Debug)]
#[command(name = "boba-daemon", bin_name = "boba-daemon")]
#[command(about = "Local supervisor for coding-agent sessions", version)]
#[command(arg_required_else_help = true)]
pub struct BobaDaemonCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon: relay socket plus permission callback endpoint.
    Serve(ServeArgs),
    /// Forward one PreToolUse hook call to a running daemon (invoked by the agent).
    Hook(HookArgs),
    /// Print JSON Schemas of the relay protocol.
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentKind {
    Claude,
    Mock,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    /// Relay port for the remote operator.
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Port the agent's permission hook calls back to.
    #[arg(long, default_value_t = DEFAULT_HOOK_PORT)]
    hook_port: u16,

    #[arg(long, value_enum, default_value_t = AgentKind::Claude)]
    agent: AgentKind,

    /// Agent binary; defaults to `claude`.
    #[arg(long)]
    agent_program: Option<PathBuf>,

    /// Extra argument for the agent binary (repeatable).
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Extra environment for the agent, as KEY=VALUE (repeatable).
    #[arg(long = "agent-env")]
    agent_env: Vec<String>,

    /// Working directory for agent processes.
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PERMISSION_TIMEOUT_MS)]
    permission_timeout_ms: u64,

    #[arg(long, default_value_t = 500)]
    spawn_grace_ms: u64,

    #[arg(long, default_value_t = 2_000)]
    kill_grace_ms: u64,

    /// Prompt written right after spawn; empty disables it.
    #[arg(long, default_value = DEFAULT_INITIAL_PROMPT)]
    initial_prompt: String,

    /// Tool auto-approved without asking (repeatable; replaces the defaults).
    #[arg(long = "read-only-tool")]
    read_only_tools: Vec<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct HookArgs {
    #[arg(long, default_value_t = DEFAULT_HOOK_PORT)]
    port: u16,

    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PERMISSION_TIMEOUT_MS)]
    timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid agent env (expected KEY=VALUE): {0}")]
    InvalidAgentEnv(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = BobaDaemonCli::parse();
    init_logging(&cli.command)?;
    run_command(cli.command)
}

pub fn init_logging(command: &Command) -> Result<(), CliError> {
    // Hook output goes to the agent's transcript; keep it quiet by default.
    let default_level = match command {
        Command::Hook(_) => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Serve(args) => run_serve(&args),
        Command::Hook(args) => run_hook(&args),
        Command::Schema => print_schema(),
    }
}

fn run_serve(args: &ServeArgs) -> Result<(), CliError> {
    let permission_timeout = Duration::from_millis(args.permission_timeout_ms);
    let config = DaemonConfig {
        host: args.host.clone(),
        port: args.port,
        hook_port: args.hook_port,
        launcher: build_launcher(args, permission_timeout)?,
        permissions: build_policy(args, permission_timeout),
        cors: Some(build_cors_layer(args)?),
    };
    tracing::info!(
        agent = ?args.agent,
        port = args.port,
        hook_port = args.hook_port,
        permission_timeout_ms = args.permission_timeout_ms,
        "starting boba-daemon"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;
    runtime
        .block_on(run_daemon(config))
        .map_err(|err| CliError::Server(err.to_string()))
}

fn build_launcher(args: &ServeArgs, permission_timeout: Duration) -> Result<AgentLauncher, CliError> {
    let launcher = match args.agent {
        AgentKind::Mock => AgentLauncher::mock(MockAgent::echo()),
        AgentKind::Claude => {
            let mut spec = LaunchSpec::claude();
            if let Some(program) = &args.agent_program {
                spec.program = program.clone();
            }
            spec.args.extend(args.agent_args.iter().cloned());
            spec.env = parse_agent_env(&args.agent_env)?;
            spec.cwd = args.cwd.clone();

            let exe = std::env::current_exe()?;
            let hooks = HookInstall {
                data_dir: hooks::default_data_dir(),
                settings: HookSettings::for_forwarder(&exe, args.hook_port, permission_timeout),
            };
            let launcher = CommandLauncher::new(spec)
                .with_hooks(hooks)
                .with_spawn_grace(Duration::from_millis(args.spawn_grace_ms));
            AgentLauncher::command(launcher).with_initial_prompt(Some(args.initial_prompt.clone()))
        }
    };
    Ok(launcher.with_kill_grace(Duration::from_millis(args.kill_grace_ms)))
}

fn build_policy(args: &ServeArgs, timeout: Duration) -> PermissionPolicy {
    let read_only_tools = if args.read_only_tools.is_empty() {
        DEFAULT_READ_ONLY_TOOLS.iter().map(|tool| tool.to_string()).collect()
    } else {
        args.read_only_tools.iter().cloned().collect()
    };
    PermissionPolicy {
        read_only_tools,
        timeout,
    }
}

fn parse_agent_env(entries: &[String]) -> Result<HashMap<String, String>, CliError> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(CliError::InvalidAgentEnv(entry.clone())),
        })
        .collect()
}

fn build_cors_layer(args: &ServeArgs) -> Result<CorsLayer, CliError> {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }

    let cors = if origins.is_empty() {
        // Local UI development servers only.
        CorsLayer::new().allow_origin(AllowOrigin::predicate(|origin, _| {
            origin.to_str().map(is_local_origin).unwrap_or(false)
        }))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}

fn is_local_origin(origin: &str) -> bool {
    ["http://localhost", "http://127.0.0.1", "http://[::1]"]
        .iter()
        .any(|prefix| {
            origin
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
        })
}

fn run_hook(args: &HookArgs) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let session_id = std::env::var(SESSION_ENV_VAR).ok();
    let base_url = forwarder_base_url(args);
    let body = hooks::forward_hook(
        &input,
        &base_url,
        session_id.as_deref(),
        Duration::from_millis(args.timeout_ms),
    );
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{body}")?;
    stdout.flush()?;
    Ok(())
}

fn forwarder_base_url(args: &HookArgs) -> String {
    format!("http://{}:{}", args.host, args.port)
}

fn print_schema() -> Result<(), CliError> {
    let schemas = json!({
        "clientCommand": schema_for!(ClientCommand),
        "serverEvent": schema_for!(ServerEvent),
    });
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["boba-daemon", "serve"];
        argv.extend_from_slice(extra);
        match BobaDaemonCli::parse_from(argv).command {
            Command::Serve(args) => args,
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn serve_defaults() {
        let args = serve_args(&[]);
        assert_eq!(args.port, 3001);
        assert_eq!(args.hook_port, 3002);
        assert_eq!(args.agent, AgentKind::Claude);
        assert_eq!(args.initial_prompt, DEFAULT_INITIAL_PROMPT);

        let policy = build_policy(&args, Duration::from_millis(args.permission_timeout_ms));
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert!(policy.is_read_only("Read"));
        assert!(!policy.is_read_only("Bash"));
    }

    #[test]
    fn read_only_tools_replace_defaults() {
        let args = serve_args(&["--read-only-tool", "WebFetch", "--agent", "mock"]);
        let policy = build_policy(&args, Duration::from_secs(1));
        assert!(policy.is_read_only("WebFetch"));
        assert!(!policy.is_read_only("Read"));
        assert_eq!(build_launcher(&args, Duration::from_secs(1)).unwrap().kind(), "mock");
    }

    #[test]
    fn agent_env_requires_key_value() {
        let env = parse_agent_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
        assert!(matches!(
            parse_agent_env(&["novalue".to_string()]),
            Err(CliError::InvalidAgentEnv(_))
        ));
    }

    #[test]
    fn local_origins_only_by_default() {
        assert!(is_local_origin("http://localhost:5173"));
        assert!(is_local_origin("http://127.0.0.1"));
        assert!(!is_local_origin("http://localhost.evil.com"));
        assert!(!is_local_origin("https://example.com"));
        assert!(build_cors_layer(&serve_args(&["-O", "not a header\n"])).is_err());
    }

    #[test]
    fn hook_args_parse() {
        let cli = BobaDaemonCli::parse_from(["boba-daemon", "hook", "--port", "4100", "--timeout-ms", "500"]);
        match cli.command {
            Command::Hook(args) => {
                assert_eq!(args.port, 4100);
                assert_eq!(args.timeout_ms, 500);
            }
            other => panic!("expected hook, got {other:?}"),
        }
    }

    #[test]
    fn default_forwarder_reaches_hook_listener_on_any_serve_host() {
        let serve = serve_args(&["--host", "0.0.0.0", "--hook-port", "4100"]);
        let cli = BobaDaemonCli::parse_from(["boba-daemon", "hook", "--port", "4100"]);
        let Command::Hook(hook) = cli.command else {
            panic!("expected hook");
        };
        assert_eq!(
            forwarder_base_url(&hook),
            format!("http://{}", hook_listen_addr(serve.hook_port))
        );
    }
}
