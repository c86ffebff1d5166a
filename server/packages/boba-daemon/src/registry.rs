use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use boba_daemon_error::DaemonError;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};

use crate::demux::{DemuxEvent, Demultiplexer};
use crate::process::{AgentLauncher, AgentProcess, ExitOutcome, ProcessEvent, SpawnedProcess};
use crate::protocol::{
    AgentInput, ClaudeMessageBody, ClaudeMessageData, ServerEvent, SessionEndedData, SessionInfo,
    SessionReadyData, SessionRef, SessionStatus, SessionUpdateData, TextMessage, ThinkingData,
};
use crate::relay::EventRelay;

#[derive(Debug)]
struct Session {
    id: String,
    generation: u64,
    process: Option<AgentProcess>,
    agent_session_id: Option<String>,
    status: SessionStatus,
    queue: VecDeque<String>,
    /// User lines written whose `result` has not arrived yet.
    turns_in_flight: usize,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl Session {
    fn starting(id: &str, generation: u64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.to_string(),
            generation,
            process: None,
            agent_session_id: None,
            status: SessionStatus::Starting,
            queue: VecDeque::new(),
            turns_in_flight: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_status(&mut self, status: SessionStatus) -> bool {
        self.updated_at = OffsetDateTime::now_utc();
        if self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            claude_session_id: self.agent_session_id.clone(),
            status: self.status,
            queued_messages: self.queue.len(),
            pid: self.process.as_ref().and_then(AgentProcess::pid),
            created_at: format_timestamp(self.created_at),
            updated_at: format_timestamp(self.updated_at),
        }
    }
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_default()
}

/// Sessions by id, each owning at most one live agent process.
#[derive(Debug)]
pub struct SessionRegistry {
    launcher: AgentLauncher,
    relay: Arc<EventRelay>,
    sessions: Mutex<HashMap<String, Session>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(launcher: AgentLauncher, relay: Arc<EventRelay>) -> Self {
        Self {
            launcher,
            relay,
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.lock().await.get(session_id).map(Session::info)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .lock()
            .await
            .values()
            .map(Session::info)
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Daemon session owning the given agent-internal session id.
    pub async fn find_by_agent_session(&self, agent_session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .await
            .values()
            .find(|session| session.agent_session_id.as_deref() == Some(agent_session_id))
            .map(|session| session.id.clone())
    }

    /// Starts a session, or reports the live one already registered under `session_id`.
    pub async fn create(self: &Arc<Self>, session_id: &str) -> SessionInfo {
        let (info, generation) = {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(session_id) {
                if existing.status.is_live() {
                    let info = existing.info();
                    drop(sessions);
                    tracing::debug!(session_id = %session_id, status = info.status.as_str(), "session already live");
                    if matches!(info.status, SessionStatus::Ready | SessionStatus::Running) {
                        self.relay
                            .emit(ServerEvent::SessionReady(SessionReadyData {
                                session_id: info.session_id.clone(),
                                claude_session_id: info.claude_session_id.clone(),
                            }))
                            .await;
                    }
                    return info;
                }
            }
            let generation = self.next_generation();
            let session = Session::starting(session_id, generation);
            let info = session.info();
            sessions.insert(session_id.to_string(), session);
            (info, generation)
        };

        tracing::info!(session_id = %session_id, generation, "creating session");
        self.emit_status(session_id, SessionStatus::Starting).await;
        self.spawn_launch(session_id, generation);
        info
    }

    /// Kills the session's process and forgets the session.
    pub async fn delete(&self, session_id: &str) -> Result<(), DaemonError> {
        let removed = self.sessions.lock().await.remove(session_id);
        let Some(mut session) = removed else {
            return Err(DaemonError::UnknownSession {
                session_id: session_id.to_string(),
            });
        };

        tracing::info!(session_id = %session_id, status = session.status.as_str(), "deleting session");
        if let Some(process) = session.process.take() {
            self.terminate_in_background(process);
        }
        self.relay
            .emit(ServerEvent::SessionEnded(SessionEndedData {
                session_id: session_id.to_string(),
                code: None,
                signal: None,
            }))
            .await;
        Ok(())
    }

    /// Replaces the session's process with a fresh one, dropping queued messages.
    pub async fn cancel(self: &Arc<Self>, session_id: &str) {
        let (old_process, dropped, generation) = {
            let mut sessions = self.sessions.lock().await;
            let generation = self.next_generation();
            let previous = sessions.insert(session_id.to_string(), Session::starting(session_id, generation));
            match previous {
                Some(mut previous) => {
                    if let Some(process) = &previous.process {
                        // Closed before the lock is released so no send can reach it.
                        process.close();
                    }
                    (previous.process.take(), previous.queue.len(), generation)
                }
                None => (None, 0, generation),
            }
        };

        tracing::info!(
            session_id = %session_id,
            generation,
            dropped_messages = dropped,
            had_process = old_process.is_some(),
            "cancelling session"
        );
        if let Some(process) = old_process {
            self.terminate_in_background(process);
        }
        self.relay
            .emit(ServerEvent::SessionCancelled(SessionRef {
                session_id: session_id.to_string(),
            }))
            .await;
        self.emit_status(session_id, SessionStatus::Starting).await;
        self.spawn_launch(session_id, generation);
    }

    /// Delivers one user message, queueing it while the session is starting.
    pub async fn send(self: &Arc<Self>, session_id: &str, content: &str) -> Result<(), DaemonError> {
        let line = AgentInput::user(content)
            .to_line()
            .map_err(|err| DaemonError::InvalidRequest {
                message: err.to_string(),
            })?;

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            let generation = self.next_generation();
            let mut session = Session::starting(session_id, generation);
            session.queue.push_back(line);
            sessions.insert(session_id.to_string(), session);
            drop(sessions);

            tracing::info!(session_id = %session_id, generation, "auto-creating session for message");
            self.emit_status(session_id, SessionStatus::Starting).await;
            self.spawn_launch(session_id, generation);
            return Ok(());
        };

        match (session.status, session.process.as_ref()) {
            (SessionStatus::Ended | SessionStatus::Error, _) => Err(DaemonError::SessionUnavailable {
                session_id: session_id.to_string(),
                status: session.status.as_str().to_string(),
            }),
            (SessionStatus::Ready | SessionStatus::Running, Some(process)) => {
                process.write(line)?;
                session.turns_in_flight += 1;
                // Emitted under the lock: the turn's `result` cannot be applied before these.
                if session.set_status(SessionStatus::Running) {
                    self.emit_turn_started(session_id).await;
                }
                Ok(())
            }
            _ => {
                session.queue.push_back(line);
                tracing::debug!(
                    session_id = %session_id,
                    queued = session.queue.len(),
                    "queued message until session is ready"
                );
                Ok(())
            }
        }
    }

    /// Records the agent session id and flushes queued messages.
    ///
    /// Only the first init of a process counts; returns whether this call did it.
    pub async fn mark_ready(&self, session_id: &str, generation: u64, agent_session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if session.generation != generation || session.agent_session_id.is_some() {
            return false;
        }
        session.agent_session_id = Some(agent_session_id.to_string());
        session.set_status(SessionStatus::Ready);
        self.emit_status(session_id, SessionStatus::Ready).await;
        self.relay
            .emit(ServerEvent::SessionReady(SessionReadyData {
                session_id: session_id.to_string(),
                claude_session_id: Some(agent_session_id.to_string()),
            }))
            .await;

        let mut flushed = 0;
        if let Some(process) = &session.process {
            while let Some(line) = session.queue.pop_front() {
                if let Err(err) = process.write(line) {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to flush queued message");
                    session.queue.clear();
                    break;
                }
                flushed += 1;
            }
        }
        session.turns_in_flight += flushed;
        if flushed > 0 && session.set_status(SessionStatus::Running) {
            self.emit_turn_started(session_id).await;
        }
        drop(sessions);

        tracing::info!(
            session_id = %session_id,
            agent_session_id = %agent_session_id,
            flushed_messages = flushed,
            "session ready"
        );
        true
    }

    /// Applies a process exit; stale generations are ignored.
    pub async fn mark_ended(&self, session_id: &str, generation: u64, outcome: ExitOutcome) -> bool {
        let was_running = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return false;
            };
            if session.generation != generation || !session.status.is_live() {
                return false;
            }
            let was_running = session.status == SessionStatus::Running;
            session.process = None;
            session.queue.clear();
            session.turns_in_flight = 0;
            session.set_status(if outcome.is_failure() {
                SessionStatus::Error
            } else {
                SessionStatus::Ended
            });
            was_running
        };

        if was_running {
            self.emit_thinking(session_id, false).await;
        }
        if outcome.is_failure() {
            tracing::warn!(session_id = %session_id, code = ?outcome.code(), "agent exited with failure");
            self.emit_status(session_id, SessionStatus::Error).await;
            let error = DaemonError::ProcessUnavailable {
                session_id: session_id.to_string(),
                reason: format!("agent exited with code {}", outcome.code().unwrap_or_default()),
                exit_code: outcome.code(),
            };
            self.relay.emit(ServerEvent::Error(error.to_error_payload())).await;
        } else {
            tracing::info!(session_id = %session_id, code = ?outcome.code(), signal = ?outcome.signal(), "agent exited");
            self.emit_status(session_id, SessionStatus::Ended).await;
        }
        self.relay
            .emit(ServerEvent::SessionEnded(SessionEndedData {
                session_id: session_id.to_string(),
                code: outcome.code(),
                signal: outcome.signal(),
            }))
            .await;
        true
    }

    /// Terminates every process; used on daemon shutdown.
    pub async fn shutdown(&self) {
        let processes: Vec<AgentProcess> = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .drain()
                .filter_map(|(_, mut session)| session.process.take())
                .collect()
        };
        tracing::info!(processes = processes.len(), "terminating agent processes");
        let grace = self.launcher.kill_grace();
        futures::future::join_all(processes.into_iter().map(|process| process.terminate(grace))).await;
    }

    fn spawn_launch(self: &Arc<Self>, session_id: &str, generation: u64) {
        let registry = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            registry.launch(session_id, generation).await;
        });
    }

    async fn launch(self: Arc<Self>, session_id: String, generation: u64) {
        let spawned = match self.launcher.spawn(&session_id).await {
            Ok(spawned) => spawned,
            Err(err) => {
                self.fail_launch(&session_id, generation, err).await;
                return;
            }
        };
        let SpawnedProcess { process, events } = spawned;

        let rejected = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&session_id) {
                Some(session) if session.generation == generation && session.status.is_live() => {
                    if process.primed() {
                        session.turns_in_flight += 1;
                    }
                    session.process = Some(process);
                    session.updated_at = OffsetDateTime::now_utc();
                    None
                }
                _ => Some(process),
            }
        };

        if let Some(process) = rejected {
            tracing::info!(session_id = %session_id, generation, "session replaced while spawning; stopping new process");
            self.terminate_in_background(process);
            return;
        }
        self.pump(session_id, generation, events).await;
    }

    async fn fail_launch(&self, session_id: &str, generation: u64, err: DaemonError) {
        let current = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(session) if session.generation == generation => {
                    session.queue.clear();
                    session.set_status(SessionStatus::Error);
                    true
                }
                _ => false,
            }
        };
        if !current {
            tracing::debug!(session_id = %session_id, generation, error = %err, "ignoring spawn failure of replaced session");
            return;
        }
        tracing::error!(session_id = %session_id, error = %err, "agent process unavailable");
        self.emit_status(session_id, SessionStatus::Error).await;
        self.relay.emit(ServerEvent::Error(err.to_error_payload())).await;
    }

    async fn pump(&self, session_id: String, generation: u64, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        let mut demux = Demultiplexer::new(&session_id);
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => {
                    for item in demux.feed(&chunk) {
                        self.apply(&session_id, generation, item).await;
                    }
                }
                ProcessEvent::Exited(outcome) => {
                    if !self.mark_ended(&session_id, generation, outcome).await {
                        tracing::debug!(session_id = %session_id, generation, "ignoring exit of replaced process");
                    }
                    break;
                }
            }
        }
    }

    async fn apply(&self, session_id: &str, generation: u64, event: DemuxEvent) {
        if !self.is_current(session_id, generation).await {
            tracing::debug!(session_id = %session_id, generation, "dropping output of replaced process");
            return;
        }
        match event {
            DemuxEvent::Init { agent_session_id } => {
                if !self.mark_ready(session_id, generation, &agent_session_id).await {
                    tracing::debug!(session_id = %session_id, "ignoring repeated init");
                }
            }
            DemuxEvent::Text(text) => {
                self.emit_claude_message(session_id, ClaudeMessageBody::Message(TextMessage::assistant(text)))
                    .await;
            }
            DemuxEvent::ToolUse(tool) => {
                self.emit_claude_message(session_id, ClaudeMessageBody::Tool(tool)).await;
            }
            DemuxEvent::TurnCompleted { is_error } => {
                self.complete_turn(session_id, generation, is_error).await;
            }
        }
    }

    async fn complete_turn(&self, session_id: &str, generation: u64, is_error: bool) {
        tracing::debug!(session_id = %session_id, is_error, "agent turn completed");
        let mut sessions = self.sessions.lock().await;
        let finished = match sessions.get_mut(session_id) {
            Some(session) if session.generation == generation => {
                session.turns_in_flight = session.turns_in_flight.saturating_sub(1);
                session.turns_in_flight == 0
                    && session.status == SessionStatus::Running
                    && session.set_status(SessionStatus::Ready)
            }
            _ => false,
        };
        if finished {
            self.emit_thinking(session_id, false).await;
            self.emit_status(session_id, SessionStatus::Ready).await;
        }
    }

    async fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .is_some_and(|session| session.generation == generation)
    }

    fn terminate_in_background(&self, process: AgentProcess) {
        process.close();
        let grace = self.launcher.kill_grace();
        tokio::spawn(process.terminate(grace));
    }

    async fn emit_turn_started(&self, session_id: &str) {
        self.emit_status(session_id, SessionStatus::Running).await;
        self.emit_thinking(session_id, true).await;
    }

    async fn emit_status(&self, session_id: &str, status: SessionStatus) {
        self.relay
            .emit(ServerEvent::SessionUpdate(SessionUpdateData {
                session_id: session_id.to_string(),
                status,
            }))
            .await;
    }

    async fn emit_thinking(&self, session_id: &str, thinking: bool) {
        self.relay
            .emit(ServerEvent::Thinking(ThinkingData {
                session_id: session_id.to_string(),
                thinking,
            }))
            .await;
    }

    async fn emit_claude_message(&self, session_id: &str, body: ClaudeMessageBody) {
        self.relay
            .emit(ServerEvent::ClaudeMessage(ClaudeMessageData {
                session_id: session_id.to_string(),
                body,
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;

    use serde_json::json;

    use crate::mock::{MockAgent, MockProcess};
    use crate::relay::RelayConnection;

    struct Harness {
        agent: MockAgent,
        registry: Arc<SessionRegistry>,
        client: RelayConnection,
    }

    async fn harness() -> Harness {
        harness_with(MockAgent::new()).await
    }

    async fn harness_with(agent: MockAgent) -> Harness {
        let relay = Arc::new(EventRelay::new());
        let client = relay.attach().await;
        let launcher = AgentLauncher::mock(agent.clone()).with_kill_grace(Duration::from_millis(50));
        Harness {
            registry: Arc::new(SessionRegistry::new(launcher, relay)),
            agent,
            client,
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    impl Harness {
        async fn process(&self, session_id: &str, index: usize) -> Arc<MockProcess> {
            let agent = self.agent.clone();
            let session = session_id.to_string();
            eventually(|| {
                let agent = agent.clone();
                let session = session.clone();
                async move { agent.spawned_for(&session).await.len() > index }
            })
            .await;
            self.agent.spawned_for(session_id).await[index].clone()
        }

        async fn wait_status(&self, session_id: &str, status: SessionStatus) {
            let registry = self.registry.clone();
            let session = session_id.to_string();
            eventually(|| {
                let registry = registry.clone();
                let session = session.clone();
                async move { registry.get(&session).await.map(|info| info.status) == Some(status) }
            })
            .await;
        }

        async fn ready_session(&self, session_id: &str) -> Arc<MockProcess> {
            self.registry.create(session_id).await;
            let process = self.process(session_id, 0).await;
            self.wait_attached(session_id).await;
            process.emit_init();
            self.wait_status(session_id, SessionStatus::Ready).await;
            process
        }

        async fn wait_attached(&self, session_id: &str) {
            let registry = self.registry.clone();
            let session = session_id.to_string();
            eventually(|| {
                let registry = registry.clone();
                let session = session.clone();
                async move {
                    let sessions = registry.sessions.lock().await;
                    sessions
                        .get(&session)
                        .is_some_and(|session| session.process.is_some())
                }
            })
            .await;
        }

        /// Discards events emitted so far, after letting in-flight emits land.
        async fn drain(&mut self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.client.drain_events();
        }

        async fn next_event(&mut self) -> ServerEvent {
            tokio::time::timeout(Duration::from_secs(2), self.client.recv_event())
                .await
                .expect("relay event")
                .expect("relay open")
        }
    }

    async fn wait_writes(process: &MockProcess, count: usize) -> Vec<String> {
        eventually(move || async move { process.writes().await.len() >= count }).await;
        process.writes().await
    }

    fn user_line(content: &str) -> String {
        AgentInput::user(content).to_line().unwrap()
    }

    #[tokio::test]
    async fn double_create_spawns_one_process() {
        let h = harness().await;
        h.registry.create("s1").await;
        let second = h.registry.create("s1").await;
        assert_eq!(second.status, SessionStatus::Starting);

        h.process("s1", 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.agent.spawned_for("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn create_on_ready_session_reports_readiness() {
        let mut h = harness().await;
        let process = h.ready_session("s1").await;
        h.drain().await;

        let info = h.registry.create("s1").await;
        assert_eq!(info.status, SessionStatus::Ready);
        assert_eq!(info.claude_session_id.as_deref(), Some(process.agent_session_id()));
        assert_eq!(
            h.next_event().await,
            ServerEvent::SessionReady(SessionReadyData {
                session_id: "s1".to_string(),
                claude_session_id: Some(process.agent_session_id().to_string()),
            })
        );
        assert_eq!(h.agent.spawned_for("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn messages_queue_until_init_then_flush_in_order() {
        let h = harness().await;
        h.registry.create("s1").await;
        h.registry.send("s1", "first").await.unwrap();
        h.registry.send("s1", "second").await.unwrap();
        assert_eq!(h.registry.get("s1").await.unwrap().queued_messages, 2);

        let process = h.process("s1", 0).await;
        h.wait_attached("s1").await;
        assert!(process.writes().await.is_empty());

        process.emit_init();
        let writes = wait_writes(&process, 2).await;
        assert_eq!(writes, vec![user_line("first"), user_line("second")]);
        h.wait_status("s1", SessionStatus::Running).await;
        assert_eq!(h.registry.get("s1").await.unwrap().queued_messages, 0);
    }

    #[tokio::test]
    async fn init_is_processed_once() {
        let h = harness().await;
        h.registry.create("s1").await;
        let process = h.process("s1", 0).await;
        h.wait_attached("s1").await;

        assert!(h.registry.mark_ready("s1", 1, "agent-a").await);
        assert!(!h.registry.mark_ready("s1", 1, "agent-b").await);
        process.emit_line(&json!({"type": "system", "subtype": "init", "session_id": "agent-c"}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = h.registry.get("s1").await.unwrap();
        assert_eq!(info.claude_session_id.as_deref(), Some("agent-a"));
        assert_eq!(h.registry.find_by_agent_session("agent-a").await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn send_runs_turn_and_result_returns_to_ready() {
        let mut h = harness().await;
        let process = h.ready_session("s1").await;
        h.drain().await;

        h.registry.send("s1", "hello").await.unwrap();
        assert_eq!(wait_writes(&process, 1).await, vec![user_line("hello")]);
        assert_eq!(
            h.next_event().await,
            ServerEvent::SessionUpdate(SessionUpdateData {
                session_id: "s1".to_string(),
                status: SessionStatus::Running,
            })
        );
        assert_eq!(
            h.next_event().await,
            ServerEvent::Thinking(ThinkingData {
                session_id: "s1".to_string(),
                thinking: true,
            })
        );

        process.emit_line(&json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Hi"},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "/x"}}
            ]}
        }));
        process.emit_line(&json!({"type": "result", "subtype": "success", "is_error": false}));

        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(h.next_event().await.name());
        }
        assert_eq!(names, vec!["claude_message", "claude_message", "thinking", "session_update"]);
        assert_eq!(h.registry.get("s1").await.unwrap().status, SessionStatus::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fast_turns_report_running_before_ready() {
        let mut h = harness_with(MockAgent::echo()).await;
        h.registry.create("s1").await;
        h.wait_status("s1", SessionStatus::Ready).await;
        h.drain().await;

        for round in 0..50 {
            h.registry.send("s1", &format!("ping {round}")).await.unwrap();
            let mut turn = Vec::new();
            loop {
                let event = h.next_event().await;
                let back_to_ready = matches!(
                    &event,
                    ServerEvent::SessionUpdate(update) if update.status == SessionStatus::Ready
                );
                turn.push(event);
                if back_to_ready {
                    break;
                }
            }

            let names: Vec<&str> = turn.iter().map(ServerEvent::name).collect();
            assert_eq!(
                names,
                vec!["session_update", "thinking", "claude_message", "thinking", "session_update"],
                "round {round}"
            );
            let thinking: Vec<bool> = turn
                .iter()
                .filter_map(|event| match event {
                    ServerEvent::Thinking(data) => Some(data.thinking),
                    _ => None,
                })
                .collect();
            assert_eq!(thinking, vec![true, false], "round {round}");
        }

        // No late turn-start events trail the last completion.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.client.drain_events().is_empty());
        assert_eq!(h.registry.get("s1").await.unwrap().status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn cancel_then_message_reaches_only_new_process() {
        let h = harness().await;
        let old = h.ready_session("s1").await;
        h.registry.send("s1", "before").await.unwrap();
        wait_writes(&old, 1).await;

        h.registry.cancel("s1").await;
        h.registry.send("s1", "hello").await.unwrap();

        let new = h.process("s1", 1).await;
        h.wait_attached("s1").await;
        new.emit_init();
        assert_eq!(wait_writes(&new, 1).await, vec![user_line("hello")]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(old.writes().await, vec![user_line("before")]);
        assert!(old.is_terminated());
        // The old process's exit must not end the replacement session.
        assert_eq!(h.registry.get("s1").await.unwrap().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn cancel_drops_queued_messages() {
        let h = harness().await;
        h.registry.create("s1").await;
        h.registry.send("s1", "stale").await.unwrap();
        h.registry.cancel("s1").await;

        let info = h.registry.get("s1").await.unwrap();
        assert_eq!(info.status, SessionStatus::Starting);
        assert_eq!(info.queued_messages, 0);

        let replacement = h.process("s1", 1).await;
        h.wait_attached("s1").await;
        replacement.emit_init();
        h.wait_status("s1", SessionStatus::Ready).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(replacement.writes().await.is_empty());
    }

    #[tokio::test]
    async fn output_from_replaced_process_is_ignored() {
        let mut h = harness().await;
        let old = h.ready_session("s1").await;
        h.registry.cancel("s1").await;
        h.process("s1", 1).await;
        h.drain().await;

        old.emit_line(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "ghost"}]}
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h
            .client
            .drain_events()
            .iter()
            .all(|event| event.name() != "claude_message"));
    }

    #[tokio::test]
    async fn send_to_unknown_session_auto_creates() {
        let h = harness().await;
        h.registry.send("fresh", "hi").await.unwrap();
        let process = h.process("fresh", 0).await;
        h.wait_attached("fresh").await;
        process.emit_init();
        assert_eq!(wait_writes(&process, 1).await, vec![user_line("hi")]);
    }

    #[tokio::test]
    async fn spawn_failure_marks_error_and_reports() {
        let mut h = harness().await;
        h.agent.set_fail_spawns(true);
        h.registry.create("s1").await;
        h.wait_status("s1", SessionStatus::Error).await;

        let mut saw_error = false;
        for _ in 0..3 {
            if let ServerEvent::Error(payload) = h.next_event().await {
                assert_eq!(payload.session_id.as_deref(), Some("s1"));
                assert_eq!(payload.type_, boba_daemon_error::ErrorType::ProcessUnavailable);
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);

        let err = h.registry.send("s1", "hello").await.unwrap_err();
        assert!(matches!(err, DaemonError::SessionUnavailable { .. }));
        assert_eq!(h.agent.spawned().await.len(), 0);
    }

    #[tokio::test]
    async fn exit_codes_map_to_terminal_status() {
        let h = harness().await;
        let ok = h.ready_session("ok").await;
        let bad = h.ready_session("bad").await;

        ok.exit(ExitOutcome::Code(0));
        bad.exit(ExitOutcome::Code(2));
        h.wait_status("ok", SessionStatus::Ended).await;
        h.wait_status("bad", SessionStatus::Error).await;

        let err = h.registry.send("ok", "more").await.unwrap_err();
        assert!(matches!(err, DaemonError::SessionUnavailable { ref status, .. } if status == "ended"));

        // A terminal session can be recreated.
        h.registry.create("ok").await;
        h.process("ok", 1).await;
    }

    #[tokio::test]
    async fn delete_kills_and_forgets() {
        let h = harness().await;
        let process = h.ready_session("s1").await;
        h.registry.delete("s1").await.unwrap();
        assert!(h.registry.get("s1").await.is_none());
        let watched = process.clone();
        eventually(move || {
            let watched = watched.clone();
            async move { watched.is_terminated() }
        })
        .await;

        let err = h.registry.delete("s1").await.unwrap_err();
        assert!(matches!(err, DaemonError::UnknownSession { .. }));
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let h = harness().await;
        let a = h.ready_session("a").await;
        let b = h.ready_session("b").await;
        h.registry.shutdown().await;
        assert!(a.is_terminated());
        assert!(b.is_terminated());
        assert!(h.registry.list().await.is_empty());
    }
}
