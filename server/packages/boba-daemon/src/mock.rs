//! In-memory agent used by the test suite and `--agent mock`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use boba_daemon_error::DaemonError;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::process::{ExitOutcome, ProcessEvent};

const SIGTERM: i32 = 15;

#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    inner: Arc<MockAgentInner>,
}

#[derive(Debug, Default)]
struct MockAgentInner {
    spawned: Mutex<Vec<Arc<MockProcess>>>,
    fail_spawns: AtomicBool,
    echo: bool,
    next_agent_id: AtomicU64,
}

impl MockAgent {
    /// Silent agent: output and exits are driven by the caller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent that announces `system/init` on spawn and answers every user
    /// line with an echoed assistant text and a `result`.
    pub fn echo() -> Self {
        Self {
            inner: Arc::new(MockAgentInner {
                echo: true,
                ..MockAgentInner::default()
            }),
        }
    }

    pub fn set_fail_spawns(&self, fail: bool) {
        self.inner.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub async fn spawned(&self) -> Vec<Arc<MockProcess>> {
        self.inner.spawned.lock().await.clone()
    }

    pub async fn spawned_for(&self, session_id: &str) -> Vec<Arc<MockProcess>> {
        self.inner
            .spawned
            .lock()
            .await
            .iter()
            .filter(|process| process.session_id == session_id)
            .cloned()
            .collect()
    }

    pub(crate) async fn launch(
        &self,
        session_id: &str,
    ) -> Result<(Arc<MockProcess>, mpsc::UnboundedReceiver<ProcessEvent>), DaemonError> {
        if self.inner.fail_spawns.load(Ordering::SeqCst) {
            tracing::debug!(session_id = %session_id, "mock agent: failing spawn");
            return Err(DaemonError::ProcessUnavailable {
                session_id: session_id.to_string(),
                reason: "mock agent configured to fail".to_string(),
                exit_code: Some(1),
            });
        }

        let (events, rx) = mpsc::unbounded_channel();
        let agent_id = self.inner.next_agent_id.fetch_add(1, Ordering::SeqCst) + 1;
        let process = Arc::new(MockProcess {
            session_id: session_id.to_string(),
            agent_session_id: format!("mock-agent-{agent_id}"),
            echo: self.inner.echo,
            writes: Mutex::new(Vec::new()),
            events,
            exited: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        self.inner.spawned.lock().await.push(process.clone());
        tracing::debug!(session_id = %session_id, "mock agent: spawned");
        if process.echo {
            process.emit_init();
        }
        Ok((process, rx))
    }
}

#[derive(Debug)]
pub struct MockProcess {
    session_id: String,
    agent_session_id: String,
    echo: bool,
    writes: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exited: AtomicBool,
    terminated: AtomicBool,
}

impl MockProcess {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_session_id(&self) -> &str {
        &self.agent_session_id
    }

    /// Lines that reached this process's stdin.
    pub async fn writes(&self) -> Vec<String> {
        self.writes.lock().await.clone()
    }

    /// Injects raw stdout bytes.
    pub fn emit(&self, bytes: impl AsRef<[u8]>) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ProcessEvent::Stdout(bytes.as_ref().to_vec()));
    }

    /// Injects one stdout line.
    pub fn emit_line(&self, value: &Value) {
        self.emit(format!("{value}\n"));
    }

    pub fn emit_init(&self) {
        self.emit_line(&json!({
            "type": "system",
            "subtype": "init",
            "session_id": self.agent_session_id,
        }));
    }

    pub fn exit(&self, outcome: ExitOutcome) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ProcessEvent::Exited(outcome));
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.exit(ExitOutcome::Signal(Some(SIGTERM)));
    }

    pub(crate) async fn receive_line(&self, line: String) {
        let reply = if self.echo { user_content(&line) } else { None };
        self.writes.lock().await.push(line);

        if let Some(content) = reply {
            self.emit_line(&json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": format!("echo: {content}")}]}
            }));
            self.emit_line(&json!({"type": "result", "subtype": "success", "is_error": false}));
        }
    }
}

fn user_content(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}
