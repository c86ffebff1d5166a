use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ProcessUnavailable,
    MalformedLine,
    UnknownSession,
    SessionUnavailable,
    PermissionTimeout,
    TransportDisconnect,
    InvalidRequest,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::ProcessUnavailable => "urn:boba-daemon:error:process_unavailable",
            Self::MalformedLine => "urn:boba-daemon:error:malformed_line",
            Self::UnknownSession => "urn:boba-daemon:error:unknown_session",
            Self::SessionUnavailable => "urn:boba-daemon:error:session_unavailable",
            Self::PermissionTimeout => "urn:boba-daemon:error:permission_timeout",
            Self::TransportDisconnect => "urn:boba-daemon:error:transport_disconnect",
            Self::InvalidRequest => "urn:boba-daemon:error:invalid_request",
            Self::StreamError => "urn:boba-daemon:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ProcessUnavailable => "Process Unavailable",
            Self::MalformedLine => "Malformed Line",
            Self::UnknownSession => "Unknown Session",
            Self::SessionUnavailable => "Session Unavailable",
            Self::PermissionTimeout => "Permission Timeout",
            Self::TransportDisconnect => "Transport Disconnect",
            Self::InvalidRequest => "Invalid Request",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::ProcessUnavailable => 502,
            Self::MalformedLine => 502,
            Self::UnknownSession => 404,
            Self::SessionUnavailable => 409,
            Self::PermissionTimeout => 504,
            Self::TransportDisconnect => 503,
            Self::InvalidRequest => 400,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Payload of the relay `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(rename = "type")]
    pub type_: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("agent process unavailable for session {session_id}: {reason}")]
    ProcessUnavailable {
        session_id: String,
        reason: String,
        exit_code: Option<i32>,
    },
    #[error("malformed line from session {session_id}: {message}")]
    MalformedLine { session_id: String, message: String },
    #[error("unknown session: {session_id}")]
    UnknownSession { session_id: String },
    #[error("session {session_id} is {status}")]
    SessionUnavailable { session_id: String, status: String },
    #[error("permission request {request_id} timed out")]
    PermissionTimeout { request_id: String },
    #[error("transport disconnected: {message}")]
    TransportDisconnect { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl DaemonError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ProcessUnavailable { .. } => ErrorType::ProcessUnavailable,
            Self::MalformedLine { .. } => ErrorType::MalformedLine,
            Self::UnknownSession { .. } => ErrorType::UnknownSession,
            Self::SessionUnavailable { .. } => ErrorType::SessionUnavailable,
            Self::PermissionTimeout { .. } => ErrorType::PermissionTimeout,
            Self::TransportDisconnect { .. } => ErrorType::TransportDisconnect,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    /// Session the error belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::ProcessUnavailable { session_id, .. }
            | Self::MalformedLine { session_id, .. }
            | Self::UnknownSession { session_id }
            | Self::SessionUnavailable { session_id, .. } => Some(session_id),
            Self::PermissionTimeout { .. }
            | Self::TransportDisconnect { .. }
            | Self::InvalidRequest { .. }
            | Self::StreamError { .. } => None,
        }
    }

    pub fn to_error_payload(&self) -> ErrorPayload {
        let details = match self {
            Self::ProcessUnavailable {
                exit_code: Some(code),
                ..
            } => {
                let mut map = Map::new();
                map.insert(
                    "exitCode".to_string(),
                    Value::Number(serde_json::Number::from(*code as i64)),
                );
                Some(Value::Object(map))
            }
            Self::SessionUnavailable { status, .. } => {
                let mut map = Map::new();
                map.insert("status".to_string(), Value::String(status.clone()));
                Some(Value::Object(map))
            }
            Self::PermissionTimeout { request_id } => {
                let mut map = Map::new();
                map.insert("requestId".to_string(), Value::String(request_id.clone()));
                Some(Value::Object(map))
            }
            _ => None,
        };

        ErrorPayload {
            session_id: self.session_id().map(ToString::to_string),
            message: self.to_string(),
            type_: self.error_type(),
            details,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let payload = self.to_error_payload();

        let mut extensions = Map::new();
        if let Some(session_id) = payload.session_id {
            extensions.insert("sessionId".to_string(), Value::String(session_id));
        }
        if let Some(details) = payload.details {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<DaemonError> for ProblemDetails {
    fn from(value: DaemonError) -> Self {
        value.to_problem_details()
    }
}

impl From<&DaemonError> for ProblemDetails {
    fn from(value: &DaemonError) -> Self {
        value.to_problem_details()
    }
}

impl From<DaemonError> for ErrorPayload {
    fn from(value: DaemonError) -> Self {
        value.to_error_payload()
    }
}

impl From<&DaemonError> for ErrorPayload {
    fn from(value: &DaemonError) -> Self {
        value.to_error_payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_unavailable_payload_carries_exit_code() {
        let err = DaemonError::ProcessUnavailable {
            session_id: "s1".to_string(),
            reason: "exited before producing output".to_string(),
            exit_code: Some(127),
        };
        let payload = err.to_error_payload();
        assert_eq!(payload.session_id.as_deref(), Some("s1"));
        assert_eq!(payload.type_, ErrorType::ProcessUnavailable);
        assert_eq!(payload.details.unwrap()["exitCode"], 127);
    }

    #[test]
    fn problem_details_use_error_type_status() {
        let err = DaemonError::UnknownSession {
            session_id: "missing".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:boba-daemon:error:unknown_session");
        assert_eq!(problem.extensions["sessionId"], "missing");
    }

    #[test]
    fn error_payload_serializes_camel_case() {
        let payload = DaemonError::SessionUnavailable {
            session_id: "s2".to_string(),
            status: "ended".to_string(),
        }
        .to_error_payload();
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["sessionId"], "s2");
        assert_eq!(value["type"], "session_unavailable");
        assert_eq!(value["details"]["status"], "ended");
    }
}
