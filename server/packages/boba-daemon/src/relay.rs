//! Event relay: the single remote operator connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use boba_daemon_error::DaemonError;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};

use crate::app::AppState;
use crate::protocol::{ClientCommand, ReadyData, ServerEvent};

/// Frames queued for one connection's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event(ServerEvent),
    Pong(Vec<u8>),
    /// The connection was replaced by a newer one.
    Close,
}

#[derive(Debug)]
struct RelayClient {
    id: u64,
    sender: mpsc::UnboundedSender<RelayFrame>,
}

#[derive(Debug)]
pub struct RelayConnection {
    pub id: u64,
    sender: mpsc::UnboundedSender<RelayFrame>,
    frames: mpsc::UnboundedReceiver<RelayFrame>,
}

impl RelayConnection {
    /// Next event, skipping transport frames. `None` once replaced or closed.
    pub async fn recv_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.frames.recv().await? {
                RelayFrame::Event(event) => return Some(event),
                RelayFrame::Pong(_) => continue,
                RelayFrame::Close => return None,
            }
        }
    }

    /// Already-queued events, without waiting.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let RelayFrame::Event(event) = frame {
                events.push(event);
            }
        }
        events
    }
}

/// Holds at most one client; attaching a new one replaces the old.
#[derive(Debug, Default)]
pub struct EventRelay {
    client: Mutex<Option<RelayClient>>,
    next_connection_id: AtomicU64,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self) -> RelayConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, frames) = mpsc::unbounded_channel();
        let previous = self.client.lock().await.replace(RelayClient {
            id,
            sender: sender.clone(),
        });
        if let Some(previous) = previous {
            tracing::info!(
                connection_id = id,
                replaced_connection_id = previous.id,
                "relay client replaced"
            );
            let _ = previous.sender.send(RelayFrame::Close);
        } else {
            tracing::info!(connection_id = id, "relay client attached");
        }
        RelayConnection { id, sender, frames }
    }

    /// Drops the client slot if `id` still owns it.
    pub async fn detach(&self, id: u64) {
        let mut client = self.client.lock().await;
        if client.as_ref().is_some_and(|client| client.id == id) {
            *client = None;
            tracing::info!(connection_id = id, "relay client detached");
        }
    }

    pub async fn is_current(&self, id: u64) -> bool {
        self.client
            .lock()
            .await
            .as_ref()
            .is_some_and(|client| client.id == id)
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Forwards an event to the current client; returns whether it was queued.
    ///
    /// A client whose connection is gone is detached here. Pending permission
    /// requests and sessions are untouched and replay to the next client.
    pub async fn emit(&self, event: ServerEvent) -> bool {
        let mut slot = self.client.lock().await;
        let Some(client) = slot.as_ref() else {
            tracing::debug!(
                event = event.name(),
                session_id = ?event.session_id(),
                "no relay client; dropping event"
            );
            return false;
        };
        let name = event.name();
        if client.sender.send(RelayFrame::Event(event)).is_ok() {
            return true;
        }

        let err = DaemonError::TransportDisconnect {
            message: format!("connection {} closed before `{name}` was sent", client.id),
        };
        tracing::warn!(connection_id = client.id, error = %err, "relay client detached");
        *slot = None;
        false
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let RelayConnection {
        id,
        sender,
        mut frames,
    } = state.relay.attach().await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let result = match frame {
                RelayFrame::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => ws_tx.send(Message::Text(json)).await,
                    Err(err) => {
                        tracing::error!(error = %err, event = event.name(), "failed to serialize relay event");
                        continue;
                    }
                },
                RelayFrame::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                RelayFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                tracing::debug!(connection_id = id, "relay send failed; client disconnected");
                break;
            }
        }
    });

    let _ = sender.send(RelayFrame::Event(ServerEvent::Ready(ReadyData {
        sessions: state.registry.list().await,
    })));
    for request in state.broker.pending_requests().await {
        let _ = sender.send(RelayFrame::Event(ServerEvent::PermissionRequest(request)));
    }

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = sender.send(RelayFrame::Pong(data));
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                let err = DaemonError::TransportDisconnect {
                    message: err.to_string(),
                };
                tracing::warn!(connection_id = id, error = %err, "relay socket error");
                break;
            }
        };

        if !state.relay.is_current(id).await {
            tracing::debug!(connection_id = id, "ignoring command from replaced relay client");
            continue;
        }

        match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => dispatch(&state, command).await,
            Err(err) => {
                tracing::warn!(connection_id = id, error = %err, "unparseable relay command");
                let error = DaemonError::InvalidRequest {
                    message: format!("unparseable command: {err}"),
                };
                let _ = sender.send(RelayFrame::Event(ServerEvent::Error(error.to_error_payload())));
            }
        }
    }

    state.relay.detach(id).await;
    send_task.abort();
}

/// Routes one inbound command to the registry or the broker.
pub async fn dispatch(state: &AppState, command: ClientCommand) {
    let result = match command {
        ClientCommand::CreateSession(target) => match require_session_id(&target.session_id) {
            Ok(()) => {
                state.registry.create(&target.session_id).await;
                Ok(())
            }
            Err(err) => Err(err),
        },
        ClientCommand::DeleteSession(target) => state.registry.delete(&target.session_id).await,
        ClientCommand::CancelSession(target) => match require_session_id(&target.session_id) {
            Ok(()) => {
                state.registry.cancel(&target.session_id).await;
                Ok(())
            }
            Err(err) => Err(err),
        },
        ClientCommand::Message(message) => match require_session_id(&message.session_id) {
            Ok(()) => state.registry.send(&message.session_id, &message.content).await,
            Err(err) => Err(err),
        },
        ClientCommand::PermissionResponse(response) => {
            if !state
                .broker
                .resolve(&response.request_id, response.allowed)
                .await
            {
                tracing::debug!(
                    request_id = %response.request_id,
                    "permission response for unknown or settled request"
                );
            }
            Ok(())
        }
    };

    if let Err(err) = result {
        tracing::warn!(error = %err, session_id = ?err.session_id(), "relay command failed");
        state.relay.emit(ServerEvent::Error(err.to_error_payload())).await;
    }
}

fn require_session_id(session_id: &str) -> Result<(), DaemonError> {
    if session_id.trim().is_empty() {
        return Err(DaemonError::InvalidRequest {
            message: "sessionId must not be empty".to_string(),
        });
    }
    Ok(())
}
