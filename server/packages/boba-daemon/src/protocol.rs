//! Wire messages, one closed union per direction.
//!
//! * [`AgentOutput`] / [`AgentInput`]: NDJSON exchanged with the agent process.
//! * [`ClientCommand`] / [`ServerEvent`]: JSON frames exchanged with the relay client.

use boba_daemon_error::ErrorPayload;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Agent process (stdout)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
    System(SystemEnvelope),
    Assistant(AssistantEnvelope),
    Result(ResultEnvelope),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemEnvelope {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SystemEnvelope {
    /// Agent session id announced by a `system/init` line.
    pub fn init_session_id(&self) -> Option<&str> {
        if self.subtype.as_deref() == Some("init") {
            self.session_id.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssistantEnvelope {
    #[serde(default)]
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultEnvelope {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

// ---------------------------------------------------------------------------
// Agent process (stdin)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInput {
    User { message: UserMessage },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMessage {
    pub role: &'static str,
    pub content: String,
}

impl AgentInput {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            message: UserMessage {
                role: "user",
                content: content.into(),
            },
        }
    }

    /// Encodes the envelope as one NDJSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Relay client -> daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    CreateSession(SessionRef),
    DeleteSession(SessionRef),
    CancelSession(SessionRef),
    Message(MessageCommand),
    PermissionResponse(PermissionResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageCommand {
    pub session_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub request_id: String,
    pub allowed: bool,
}

// ---------------------------------------------------------------------------
// Daemon -> relay client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Ready(ReadyData),
    SessionReady(SessionReadyData),
    SessionEnded(SessionEndedData),
    SessionCancelled(SessionRef),
    SessionUpdate(SessionUpdateData),
    ClaudeMessage(ClaudeMessageData),
    Thinking(ThinkingData),
    PermissionRequest(PermissionRequestData),
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Owning session of a session-scoped event.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::SessionReady(data) => Some(&data.session_id),
            Self::SessionEnded(data) => Some(&data.session_id),
            Self::SessionCancelled(data) => Some(&data.session_id),
            Self::SessionUpdate(data) => Some(&data.session_id),
            Self::ClaudeMessage(data) => Some(&data.session_id),
            Self::Thinking(data) => Some(&data.session_id),
            Self::PermissionRequest(data) => data.session_id.as_deref(),
            Self::Error(payload) => payload.session_id.as_deref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::SessionReady(_) => "session_ready",
            Self::SessionEnded(_) => "session_ended",
            Self::SessionCancelled(_) => "session_cancelled",
            Self::SessionUpdate(_) => "session_update",
            Self::ClaudeMessage(_) => "claude_message",
            Self::Thinking(_) => "thinking",
            Self::PermissionRequest(_) => "permission_request",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Running,
    Ended,
    Error,
}

impl SessionStatus {
    /// Starting, ready and running sessions own (or are about to own) a process.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub claude_session_id: Option<String>,
    pub status: SessionStatus,
    pub queued_messages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadyData {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionReadyData {
    pub session_id: String,
    pub claude_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedData {
    pub session_id: String,
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateData {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeMessageData {
    pub session_id: String,
    #[serde(flatten)]
    pub body: ClaudeMessageBody,
}

/// Serialized as a `message` or a `tool` key next to `sessionId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeMessageBody {
    Message(TextMessage),
    Tool(ToolUse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TextMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub role: String,
}

impl TextMessage {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
            role: "assistant".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolUse {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolUse {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            kind: "tool_use".to_string(),
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingData {
    pub session_id: String,
    pub thinking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestData {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: String,
}
