use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boba_daemon_error::DaemonError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{oneshot, Mutex};
use utoipa::ToSchema;

use crate::protocol::{PermissionRequestData, ServerEvent};
use crate::registry::SessionRegistry;
use crate::relay::EventRelay;

pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS", "NotebookRead"];

/// Body the agent's `PreToolUse` hook sends.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct HookPermissionRequest {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    /// The agent's internal session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_event_name: Option<String>,
}

/// Already-shaped request, answered with [`AllowedResponse`].
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShapedPermissionRequest {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PermissionCallback {
    Hook(HookPermissionRequest),
    Shaped(ShapedPermissionRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    pub hook_specific_output: HookSpecificOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: String,
    /// `allow` or `deny`.
    pub permission_decision: String,
    pub permission_decision_reason: String,
}

impl HookResponse {
    pub fn decision(allowed: bool, reason: impl Into<String>) -> Self {
        Self {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: "PreToolUse".to_string(),
                permission_decision: if allowed { "allow" } else { "deny" }.to_string(),
                permission_decision_reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AllowedResponse {
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PermissionDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn to_hook_response(&self) -> HookResponse {
        HookResponse::decision(self.allowed, self.reason.clone())
    }

    pub fn to_allowed_response(&self) -> AllowedResponse {
        AllowedResponse {
            allowed: self.allowed,
        }
    }
}

/// One hook call, normalised from either body shape.
#[derive(Debug, Clone, Default)]
pub struct PermissionQuery {
    pub tool_name: String,
    pub input: Value,
    pub request_id: Option<String>,
    /// Daemon session id, when the caller knows it.
    pub session_id: Option<String>,
    pub agent_session_id: Option<String>,
}

impl PermissionCallback {
    pub fn into_query(self, session_header: Option<String>) -> PermissionQuery {
        match self {
            Self::Hook(request) => PermissionQuery {
                tool_name: request.tool_name,
                input: request.tool_input,
                request_id: None,
                session_id: session_header,
                agent_session_id: request.session_id,
            },
            Self::Shaped(request) => PermissionQuery {
                tool_name: request.tool_name,
                input: request.input,
                request_id: request.request_id,
                session_id: session_header,
                agent_session_id: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    pub read_only_tools: HashSet<String>,
    pub timeout: Duration,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            read_only_tools: DEFAULT_READ_ONLY_TOOLS.iter().map(|tool| tool.to_string()).collect(),
            timeout: DEFAULT_PERMISSION_TIMEOUT,
        }
    }
}

impl PermissionPolicy {
    pub fn is_read_only(&self, tool_name: &str) -> bool {
        self.read_only_tools.contains(tool_name)
    }
}

#[derive(Debug)]
struct PendingPermission {
    request: PermissionRequestData,
    created: OffsetDateTime,
    /// Arrival order; breaks ties between equal timestamps.
    arrival: u64,
    responder: oneshot::Sender<bool>,
}

/// Correlates hook calls with operator decisions under a timeout.
#[derive(Debug)]
pub struct PermissionBroker {
    policy: PermissionPolicy,
    relay: Arc<EventRelay>,
    registry: Arc<SessionRegistry>,
    pending: Mutex<HashMap<String, PendingPermission>>,
    next_id: AtomicU64,
    next_arrival: AtomicU64,
}

impl PermissionBroker {
    pub fn new(policy: PermissionPolicy, relay: Arc<EventRelay>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            policy,
            relay,
            registry,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_arrival: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Decides one hook call.
    ///
    /// Waiting runs on its own task, so an abandoned HTTP call still ends in
    /// removal by decision or timeout.
    pub async fn request(self: &Arc<Self>, query: PermissionQuery) -> PermissionDecision {
        if self.policy.is_read_only(&query.tool_name) {
            tracing::debug!(tool_name = %query.tool_name, "auto-approving read-only tool");
            return PermissionDecision::allow(format!("{} is read-only", query.tool_name));
        }

        let broker = self.clone();
        match tokio::spawn(async move { broker.await_decision(query).await }).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(error = %err, "permission task failed");
                PermissionDecision::deny("permission broker failure")
            }
        }
    }

    async fn await_decision(&self, query: PermissionQuery) -> PermissionDecision {
        let session_id = match (query.session_id, query.agent_session_id) {
            (Some(session_id), _) => Some(session_id),
            (None, Some(agent_session_id)) => self.registry.find_by_agent_session(&agent_session_id).await,
            (None, None) => None,
        };
        let created = OffsetDateTime::now_utc();
        let request = PermissionRequestData {
            request_id: String::new(),
            tool_name: query.tool_name,
            input: query.input,
            session_id,
            created_at: created.format(&Rfc3339).unwrap_or_default(),
        };

        let (tx, mut rx) = oneshot::channel();
        let request = {
            let mut pending = self.pending.lock().await;
            let request_id = match query.request_id {
                Some(id) if !id.is_empty() && !pending.contains_key(&id) => id,
                _ => self.generate_id(),
            };
            let request = PermissionRequestData { request_id, ..request };
            pending.insert(
                request.request_id.clone(),
                PendingPermission {
                    request: request.clone(),
                    created,
                    arrival: self.next_arrival.fetch_add(1, Ordering::SeqCst),
                    responder: tx,
                },
            );
            request
        };
        let request_id = request.request_id.clone();

        tracing::info!(
            request_id = %request_id,
            tool_name = %request.tool_name,
            session_id = ?request.session_id,
            "permission requested"
        );
        if !self.relay.emit(ServerEvent::PermissionRequest(request)).await {
            tracing::info!(request_id = %request_id, "no relay client; permission stays pending");
        }

        let allowed = match tokio::time::timeout(self.policy.timeout, &mut rx).await {
            Ok(Ok(allowed)) => Some(allowed),
            Ok(Err(_)) => None,
            Err(_) => {
                let removed = self.pending.lock().await.remove(&request_id);
                if removed.is_some() {
                    let err = DaemonError::PermissionTimeout {
                        request_id: request_id.clone(),
                    };
                    tracing::warn!(error = %err, timeout_ms = self.policy.timeout.as_millis() as u64, "denying");
                    return PermissionDecision::deny(format!(
                        "no decision within {}s",
                        self.policy.timeout.as_secs()
                    ));
                }
                // Resolved in the same instant the timer fired.
                rx.try_recv().ok()
            }
        };

        match allowed {
            Some(true) => {
                tracing::info!(request_id = %request_id, "permission allowed");
                PermissionDecision::allow("approved by operator")
            }
            Some(false) => {
                tracing::info!(request_id = %request_id, "permission denied");
                PermissionDecision::deny("denied by operator")
            }
            None => {
                tracing::warn!(request_id = %request_id, "permission request abandoned");
                PermissionDecision::deny("permission request abandoned")
            }
        }
    }

    fn generate_id(&self) -> String {
        format!("perm_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Settles a pending request. Unknown or already-settled ids are a no-op.
    pub async fn resolve(&self, request_id: &str, allowed: bool) -> bool {
        let Some(pending) = self.pending.lock().await.remove(request_id) else {
            return false;
        };
        pending.responder.send(allowed).is_ok()
    }

    /// Still-undecided requests, oldest first.
    pub async fn pending_requests(&self) -> Vec<PermissionRequestData> {
        let pending = self.pending.lock().await;
        let mut entries: Vec<&PendingPermission> = pending.values().collect();
        entries.sort_by_key(|entry| (entry.created, entry.arrival));
        entries.into_iter().map(|entry| entry.request.clone()).collect()
    }

    /// Abandons everything still pending; waiters answer `deny`.
    pub async fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.pending.lock().await);
        if !drained.is_empty() {
            tracing::info!(pending = drained.len(), "denying pending permission requests on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::mock::MockAgent;
    use crate::process::AgentLauncher;
    use crate::relay::RelayConnection;

    async fn broker(timeout: Duration) -> (Arc<PermissionBroker>, RelayConnection) {
        let relay = Arc::new(EventRelay::new());
        let client = relay.attach().await;
        let registry = Arc::new(SessionRegistry::new(
            AgentLauncher::mock(MockAgent::new()),
            relay.clone(),
        ));
        let policy = PermissionPolicy {
            timeout,
            ..PermissionPolicy::default()
        };
        (Arc::new(PermissionBroker::new(policy, relay, registry)), client)
    }

    fn query(tool_name: &str) -> PermissionQuery {
        PermissionQuery {
            tool_name: tool_name.to_string(),
            input: json!({"command": "rm -rf build"}),
            session_id: Some("s1".to_string()),
            ..PermissionQuery::default()
        }
    }

    async fn next_request(client: &mut RelayConnection) -> PermissionRequestData {
        match tokio::time::timeout(Duration::from_secs(2), client.recv_event()).await {
            Ok(Some(ServerEvent::PermissionRequest(request))) => request,
            other => panic!("expected permission_request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_tool_is_allowed_without_round_trip() {
        let (broker, mut client) = broker(Duration::from_secs(5)).await;
        let decision = broker.request(query("Read")).await;
        assert!(decision.allowed);
        assert!(client.drain_events().is_empty());
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn pending_requests_order_by_creation_time() {
        let (broker, _client) = broker(Duration::from_secs(5)).await;
        let base = OffsetDateTime::from_unix_timestamp(1_792_324_800).unwrap();
        // Fractional seconds make the RFC 3339 strings sort the other way.
        let later = base + Duration::from_millis(150);
        let earlier = base + Duration::from_millis(100);
        assert!(later.format(&Rfc3339).unwrap() < earlier.format(&Rfc3339).unwrap());

        let mut receivers = Vec::new();
        {
            let mut pending = broker.pending.lock().await;
            for (request_id, created, arrival) in [("later", later, 0), ("earlier", earlier, 1)] {
                let (responder, rx) = oneshot::channel();
                receivers.push(rx);
                pending.insert(
                    request_id.to_string(),
                    PendingPermission {
                        request: PermissionRequestData {
                            request_id: request_id.to_string(),
                            tool_name: "Bash".to_string(),
                            input: json!({}),
                            session_id: None,
                            created_at: created.format(&Rfc3339).unwrap(),
                        },
                        created,
                        arrival,
                        responder,
                    },
                );
            }
        }

        let ids: Vec<String> = broker
            .pending_requests()
            .await
            .into_iter()
            .map(|request| request.request_id)
            .collect();
        assert_eq!(ids, vec!["earlier", "later"]);
    }

    #[tokio::test]
    async fn operator_decision_unblocks_caller() {
        let (broker, mut client) = broker(Duration::from_secs(5)).await;
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request(query("Bash")).await })
        };

        let request = next_request(&mut client).await;
        assert_eq!(request.request_id, "perm_1");
        assert_eq!(request.tool_name, "Bash");
        assert_eq!(request.session_id.as_deref(), Some("s1"));
        assert!(broker.resolve(&request.request_id, true).await);

        let decision = waiter.await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.to_hook_response().hook_specific_output.permission_decision, "allow");
        assert!(client.drain_events().is_empty());
    }

    #[tokio::test]
    async fn timeout_denies_and_late_response_is_noop() {
        let (broker, mut client) = broker(Duration::from_millis(100)).await;
        let decision = broker.request(query("Bash")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.to_allowed_response(), AllowedResponse { allowed: false });

        let request = next_request(&mut client).await;
        assert!(!broker.resolve(&request.request_id, true).await);
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        let (broker, mut client) = broker(Duration::from_secs(5)).await;
        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request(query("Bash")).await })
        };
        let a = next_request(&mut client).await;
        let second = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request(query("Write")).await })
        };
        let b = next_request(&mut client).await;
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(broker.pending_requests().await.len(), 2);

        assert!(broker.resolve(&b.request_id, false).await);
        assert!(broker.resolve(&a.request_id, true).await);
        assert!(!broker.resolve(&a.request_id, false).await);
        assert!(first.await.unwrap().allowed);
        assert!(!second.await.unwrap().allowed);
    }

    #[tokio::test]
    async fn shaped_request_keeps_its_id() {
        let (broker, mut client) = broker(Duration::from_secs(5)).await;
        let callback: PermissionCallback = serde_json::from_value(json!({
            "toolName": "Edit",
            "input": {"file": "a.rs"},
            "requestId": "req-42"
        }))
        .unwrap();
        assert!(matches!(callback, PermissionCallback::Shaped(_)));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request(callback.into_query(None)).await })
        };
        let request = next_request(&mut client).await;
        assert_eq!(request.request_id, "req-42");
        broker.resolve("req-42", true).await;
        assert!(waiter.await.unwrap().allowed);
    }

    #[tokio::test]
    async fn shutdown_denies_pending() {
        let (broker, mut client) = broker(Duration::from_secs(5)).await;
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request(query("Bash")).await })
        };
        next_request(&mut client).await;
        broker.shutdown().await;
        assert!(!waiter.await.unwrap().allowed);
    }

    #[test]
    fn hook_body_parses_as_hook_shape() {
        let callback: PermissionCallback = serde_json::from_value(json!({
            "session_id": "agent-1",
            "hook_event_name": "PreToolUse",
            "tool_name": "Bash",
            "tool_input": {"command": "ls"}
        }))
        .unwrap();
        let query = callback.into_query(Some("s1".to_string()));
        assert_eq!(query.tool_name, "Bash");
        assert_eq!(query.agent_session_id.as_deref(), Some("agent-1"));
        assert_eq!(query.session_id.as_deref(), Some("s1"));
    }
}
