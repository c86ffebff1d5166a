use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use boba_daemon_error::DaemonError;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::hooks::{HookInstall, SESSION_ENV_VAR};
use crate::mock::{MockAgent, MockProcess};
use crate::protocol::AgentInput;

pub const DEFAULT_SPAWN_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_INITIAL_PROMPT: &str = "Hello! I am ready to help.";

const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(25);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK_SIZE: usize = 8192;

/// Notifications from a running agent process, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    /// Always the last event; sent after stdout has drained.
    Exited(ExitOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    /// Terminated by a signal (number when the platform reports one).
    Signal(Option<i32>),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Code(code),
            None => Self::Signal(exit_signal(&status)),
        }
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(code),
            Self::Signal(_) => None,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            Self::Code(_) => None,
            Self::Signal(signal) => signal,
        }
    }

    /// Non-zero exit codes are failures; signals and zero are not.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Code(code) if code != 0)
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// `claude` speaking stream-json on both pipes.
    pub fn claude() -> Self {
        Self {
            program: PathBuf::from("claude"),
            args: [
                "--print",
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Launches real agent binaries.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    pub spec: LaunchSpec,
    pub hooks: Option<HookInstall>,
    pub spawn_grace: Duration,
}

impl CommandLauncher {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            hooks: None,
            spawn_grace: DEFAULT_SPAWN_GRACE,
        }
    }

    pub fn with_hooks(mut self, hooks: HookInstall) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_spawn_grace(mut self, spawn_grace: Duration) -> Self {
        self.spawn_grace = spawn_grace;
        self
    }
}

#[derive(Debug, Clone)]
enum LauncherBackend {
    Command(CommandLauncher),
    Mock(MockAgent),
}

/// Spawns one agent process per call.
#[derive(Debug, Clone)]
pub struct AgentLauncher {
    backend: LauncherBackend,
    initial_prompt: Option<String>,
    kill_grace: Duration,
}

/// A freshly started process and the receiving end of its notifications.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub process: AgentProcess,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl AgentLauncher {
    pub fn command(launcher: CommandLauncher) -> Self {
        Self {
            backend: LauncherBackend::Command(launcher),
            initial_prompt: Some(DEFAULT_INITIAL_PROMPT.to_string()),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Mock launchers start without a priming prompt.
    pub fn mock(agent: MockAgent) -> Self {
        Self {
            backend: LauncherBackend::Mock(agent),
            initial_prompt: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_initial_prompt(mut self, initial_prompt: Option<String>) -> Self {
        self.initial_prompt = initial_prompt.filter(|prompt| !prompt.is_empty());
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    pub fn kind(&self) -> &'static str {
        match &self.backend {
            LauncherBackend::Command(_) => "command",
            LauncherBackend::Mock(_) => "mock",
        }
    }

    pub async fn spawn(&self, session_id: &str) -> Result<SpawnedProcess, DaemonError> {
        let prompt = self.initial_prompt.as_deref();
        match &self.backend {
            LauncherBackend::Command(launcher) => spawn_command(launcher, session_id, prompt).await,
            LauncherBackend::Mock(agent) => {
                let (mock, events) = agent.launch(session_id).await?;
                let process = AgentProcess::for_mock(session_id, mock);
                if let Some(prompt) = prompt {
                    prime(&process, prompt)?;
                }
                Ok(SpawnedProcess { process, events })
            }
        }
    }
}

#[derive(Debug)]
enum ProcessControl {
    Child(Arc<Mutex<Child>>),
    Mock(Arc<MockProcess>),
}

/// Exclusive handle to one agent process.
///
/// Lines written here reach stdin in order through a dedicated writer task.
/// After [`AgentProcess::close`] nothing more reaches stdin, lines already
/// queued included.
#[derive(Debug)]
pub struct AgentProcess {
    session_id: String,
    pid: Option<u32>,
    writer: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    primed: bool,
    control: ProcessControl,
}

impl AgentProcess {
    fn for_mock(session_id: &str, mock: Arc<MockProcess>) -> Self {
        let (writer, mut lines) = mpsc::unbounded_channel::<String>();
        let closed = Arc::new(AtomicBool::new(false));
        let writer_closed = closed.clone();
        let writer_mock = mock.clone();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if writer_closed.load(Ordering::SeqCst) {
                    break;
                }
                writer_mock.receive_line(line).await;
            }
        });

        Self {
            session_id: session_id.to_string(),
            pid: None,
            writer,
            closed,
            primed: false,
            control: ProcessControl::Mock(mock),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether a priming prompt was written at spawn.
    pub fn primed(&self) -> bool {
        self.primed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues one NDJSON line (without newline) for stdin.
    pub fn write(&self, line: String) -> Result<(), DaemonError> {
        if self.is_closed() {
            return Err(DaemonError::StreamError {
                message: format!("stdin of session {} is closed", self.session_id),
            });
        }
        self.writer.send(line).map_err(|_| DaemonError::StreamError {
            message: format!("stdin writer of session {} has stopped", self.session_id),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Closes stdin, sends SIGTERM and escalates to SIGKILL after `grace`.
    pub async fn terminate(self, grace: Duration) {
        self.close();
        let Self {
            session_id,
            control,
            ..
        } = self;
        match control {
            ProcessControl::Child(child) => terminate_child(&session_id, child, grace).await,
            ProcessControl::Mock(mock) => mock.terminate(),
        }
    }
}

fn prime(process: &AgentProcess, prompt: &str) -> Result<(), DaemonError> {
    let line = AgentInput::user(prompt)
        .to_line()
        .map_err(|err| DaemonError::StreamError {
            message: err.to_string(),
        })?;
    process.write(line)
}

async fn spawn_command(
    launcher: &CommandLauncher,
    session_id: &str,
    initial_prompt: Option<&str>,
) -> Result<SpawnedProcess, DaemonError> {
    let spec = &launcher.spec;
    let spawn_start = Instant::now();
    let unavailable = |reason: String, exit_code: Option<i32>| DaemonError::ProcessUnavailable {
        session_id: session_id.to_string(),
        reason,
        exit_code,
    };

    let mut args = spec.args.clone();
    if let Some(hooks) = &launcher.hooks {
        let cwd = match &spec.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()
                .map_err(|err| unavailable(format!("failed to resolve working directory: {err}"), None))?,
        };
        let settings = hooks
            .ensure(&cwd)
            .map_err(|err| unavailable(format!("failed to write hook settings: {err}"), None))?;
        args.push("--settings".to_string());
        args.push(settings.to_string_lossy().into_owned());
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&args)
        .env(SESSION_ENV_VAR, session_id)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let command_line = format_command_for_display(&spec.program, &args);
    tracing::info!(session_id = %session_id, command = %command_line, "spawning agent process");

    let mut child = command.spawn().map_err(|err| {
        tracing::error!(session_id = %session_id, command = %command_line, error = %err, "failed to spawn agent process");
        unavailable(format!("failed to spawn `{command_line}`: {err}"), None)
    })?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| unavailable("failed to capture stdin".to_string(), None))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| unavailable("failed to capture stdout".to_string(), None))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| unavailable("failed to capture stderr".to_string(), None))?;

    let child = Arc::new(Mutex::new(child));
    let (events_tx, events) = mpsc::unbounded_channel();
    let first_stdout = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));

    let stdout_task = spawn_stdout_pump(session_id, stdout, events_tx.clone(), first_stdout.clone());
    spawn_stderr_pump(session_id, stderr);
    let writer = spawn_stdin_writer(session_id, stdin, closed.clone());

    let mut process = AgentProcess {
        session_id: session_id.to_string(),
        pid,
        writer,
        closed,
        primed: false,
        control: ProcessControl::Child(child.clone()),
    };
    if let Some(prompt) = initial_prompt {
        prime(&process, prompt)?;
        process.primed = true;
    }

    // An exit inside the grace window before any output means the agent never started.
    let deadline = spawn_start + launcher.spawn_grace;
    loop {
        let status = child.lock().await.try_wait();
        match status {
            Ok(Some(status)) => {
                tokio::time::sleep(GRACE_POLL_INTERVAL).await;
                if !first_stdout.load(Ordering::SeqCst) {
                    process.close();
                    let outcome = ExitOutcome::from_status(status);
                    tracing::error!(
                        session_id = %session_id,
                        code = ?outcome.code(),
                        signal = ?outcome.signal(),
                        "agent process exited before producing output"
                    );
                    return Err(unavailable(
                        format!("`{command_line}` exited before producing output ({status})"),
                        outcome.code(),
                    ));
                }
                break;
            }
            Ok(None) => {}
            Err(err) => {
                process.close();
                return Err(unavailable(format!("failed to poll agent process: {err}"), None));
            }
        }
        if first_stdout.load(Ordering::SeqCst) || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(GRACE_POLL_INTERVAL).await;
    }

    tracing::info!(
        session_id = %session_id,
        pid = ?pid,
        elapsed_ms = spawn_start.elapsed().as_millis() as u64,
        "agent process started"
    );

    spawn_exit_watcher(session_id, child, stdout_task, events_tx);
    Ok(SpawnedProcess { process, events })
}

fn spawn_stdout_pump(
    session_id: &str,
    mut stdout: ChildStdout,
    events: mpsc::UnboundedSender<ProcessEvent>,
    first_stdout: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut total_bytes: u64 = 0;
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    total_bytes += n as u64;
                    if !first_stdout.swap(true, Ordering::SeqCst) {
                        tracing::debug!(session_id = %session_id, "agent stdout: first chunk received");
                    }
                    if events.send(ProcessEvent::Stdout(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "agent stdout: read failed");
                    break;
                }
            }
        }
        tracing::debug!(session_id = %session_id, total_bytes, "agent stdout: stream ended");
    })
}

fn spawn_stderr_pump(session_id: &str, stderr: ChildStderr) {
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(session_id = %session_id, "agent stderr: {}", line);
        }
    });
}

fn spawn_stdin_writer(
    session_id: &str,
    mut stdin: ChildStdin,
    closed: Arc<AtomicBool>,
) -> mpsc::UnboundedSender<String> {
    let session_id = session_id.to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = write_line(&mut stdin, &line).await {
                tracing::error!(session_id = %session_id, error = %err, "stdin: write failed");
                closed.store(true, Ordering::SeqCst);
                break;
            }
            tracing::debug!(session_id = %session_id, bytes = line.len(), "stdin: line written");
        }
    });
    tx
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

fn spawn_exit_watcher(
    session_id: &str,
    child: Arc<Mutex<Child>>,
    stdout_task: JoinHandle<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let outcome = loop {
            let status = child.lock().await.try_wait();
            match status {
                Ok(Some(status)) => break ExitOutcome::from_status(status),
                Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                Err(err) => {
                    tracing::error!(session_id = %session_id, error = %err, "agent process: failed to get exit status");
                    break ExitOutcome::Signal(None);
                }
            }
        };

        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task).await.is_err() {
            tracing::warn!(session_id = %session_id, "agent stdout did not drain after exit");
        }

        tracing::info!(
            session_id = %session_id,
            code = ?outcome.code(),
            signal = ?outcome.signal(),
            "agent process exited"
        );
        let _ = events.send(ProcessEvent::Exited(outcome));
    });
}

async fn terminate_child(session_id: &str, child: Arc<Mutex<Child>>, grace: Duration) {
    {
        let mut guard = child.lock().await;
        if !matches!(guard.try_wait(), Ok(None)) {
            return;
        }
        send_terminate(&mut guard);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(GRACE_POLL_INTERVAL).await;
        if !matches!(child.lock().await.try_wait(), Ok(None)) {
            tracing::debug!(session_id = %session_id, "agent process stopped after SIGTERM");
            return;
        }
    }

    tracing::warn!(
        session_id = %session_id,
        grace_ms = grace.as_millis() as u64,
        "agent process ignored SIGTERM; sending SIGKILL"
    );
    if let Err(err) = child.lock().await.start_kill() {
        tracing::warn!(session_id = %session_id, error = %err, "failed to kill agent process");
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn format_command_for_display(program: &std::path::Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string_lossy().into_owned());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLauncher {
        CommandLauncher::new(LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            cwd: None,
        })
    }

    async fn collect_until_exit(events: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> (Vec<u8>, ExitOutcome) {
        let mut stdout = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("process event")
                .expect("event channel open");
            match event {
                ProcessEvent::Stdout(chunk) => stdout.extend(chunk),
                ProcessEvent::Exited(outcome) => return (stdout, outcome),
            }
        }
    }

    #[tokio::test]
    async fn missing_binary_is_process_unavailable() {
        let launcher = AgentLauncher::command(CommandLauncher::new(LaunchSpec {
            program: PathBuf::from("/nonexistent/boba-agent"),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }));
        let err = launcher.spawn("s1").await.unwrap_err();
        assert!(matches!(err, DaemonError::ProcessUnavailable { ref session_id, .. } if session_id == "s1"));
    }

    #[tokio::test]
    async fn early_silent_exit_is_process_unavailable() {
        let launcher = AgentLauncher::command(sh("exit 3")).with_initial_prompt(None);
        let err = launcher.spawn("s1").await.unwrap_err();
        match err {
            DaemonError::ProcessUnavailable { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn echoes_written_lines_and_reports_exit_after_output() {
        let launcher = AgentLauncher::command(sh("read line; echo \"$line\"; echo \"$BOBA_SESSION_ID\""))
            .with_initial_prompt(Some("hi".to_string()));
        let SpawnedProcess { process, mut events } = launcher.spawn("s-echo").await.unwrap();
        assert!(process.primed());
        assert!(process.pid().is_some());

        let (stdout, outcome) = collect_until_exit(&mut events).await;
        let stdout = String::from_utf8(stdout).unwrap();
        let mut lines = stdout.lines();
        assert_eq!(
            lines.next(),
            Some(r#"{"type":"user","message":{"role":"user","content":"hi"}}"#)
        );
        assert_eq!(lines.next(), Some("s-echo"));
        assert_eq!(outcome, ExitOutcome::Code(0));
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let launcher = AgentLauncher::command(sh("trap '' TERM; echo up; while true; do sleep 1; done"))
            .with_initial_prompt(None);
        let SpawnedProcess { process, mut events } = launcher.spawn("s1").await.unwrap();
        process.terminate(Duration::from_millis(200)).await;

        let (_, outcome) = collect_until_exit(&mut events).await;
        assert_eq!(outcome, ExitOutcome::Signal(Some(libc::SIGKILL)));
    }

    #[tokio::test]
    async fn closed_handle_rejects_writes() {
        let launcher = AgentLauncher::command(sh("echo up; cat >/dev/null")).with_initial_prompt(None);
        let SpawnedProcess { process, .. } = launcher.spawn("s1").await.unwrap();
        process.close();
        assert!(matches!(
            process.write("{}".to_string()),
            Err(DaemonError::StreamError { .. })
        ));
        process.terminate(Duration::from_millis(200)).await;
    }

    #[test]
    fn exit_outcome_classification() {
        assert!(ExitOutcome::Code(1).is_failure());
        assert!(!ExitOutcome::Code(0).is_failure());
        assert!(!ExitOutcome::Signal(Some(15)).is_failure());
    }
}
