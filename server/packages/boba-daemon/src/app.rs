use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use boba_daemon_error::{DaemonError, ErrorType, ProblemDetails};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::hooks::SESSION_HEADER;
use crate::permission::{
    AllowedResponse, HookPermissionRequest, HookResponse, HookSpecificOutput, PermissionBroker,
    PermissionCallback, PermissionPolicy, ShapedPermissionRequest,
};
use crate::process::AgentLauncher;
use crate::protocol::SessionInfo;
use crate::registry::SessionRegistry;
use crate::relay::{ws_handler, EventRelay};

/// Shared daemon state; one instance serves both routers.
#[derive(Debug)]
pub struct AppState {
    pub relay: Arc<EventRelay>,
    pub registry: Arc<SessionRegistry>,
    pub broker: Arc<PermissionBroker>,
}

impl AppState {
    pub fn new(launcher: AgentLauncher, policy: PermissionPolicy) -> Arc<Self> {
        let relay = Arc::new(EventRelay::new());
        let registry = Arc::new(SessionRegistry::new(launcher, relay.clone()));
        let broker = Arc::new(PermissionBroker::new(policy, relay.clone(), registry.clone()));
        Arc::new(Self {
            relay,
            registry,
            broker,
        })
    }

    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
        self.registry.shutdown().await;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_permission),
    components(
        schemas(
            HealthResponse,
            HookPermissionRequest,
            ShapedPermissionRequest,
            HookResponse,
            HookSpecificOutput,
            AllowedResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "permissions", description = "Agent tool permission callbacks")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://127.0.0.1:3002")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Daemon(err) => err.to_problem_details(),
        };
        let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

/// Operator-facing router: relay socket and session listing.
pub fn build_relay_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/v1/health", get(get_health))
        .route("/v1/sessions", get(list_sessions))
        .with_state(state)
}

/// Agent-facing router: permission callbacks.
pub fn build_hook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/permission", post(post_permission))
        .route("/hook/pre-tool-use", post(post_permission))
        .route("/v1/health", get(get_health))
        .route("/v1/openapi.json", get(get_openapi))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.registry.list().await,
    })
}

/// Blocks until the operator decides or the permission timeout passes.
#[utoipa::path(
    post,
    path = "/permission",
    request_body = HookPermissionRequest,
    params(("x-boba-session-id" = Option<String>, Header, description = "Daemon session id of the calling agent")),
    responses(
        (status = 200, description = "Hook decision; pre-shaped requests get `{allowed}`", body = HookResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "permissions"
)]
async fn post_permission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let callback: PermissionCallback =
        serde_json::from_value(payload).map_err(|err| DaemonError::InvalidRequest {
            message: format!("invalid permission request: {err}"),
        })?;
    let session_header = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let hook_shaped = matches!(callback, PermissionCallback::Hook(_));
    let decision = state.broker.request(callback.into_query(session_header)).await;
    let response = if hook_shaped {
        Json(decision.to_hook_response()).into_response()
    } else {
        Json(decision.to_allowed_response()).into_response()
    };
    Ok(response)
}
