use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Extension, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::AppState;
use super::models::*;
use super::session::SessionContext;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the shared broadcast channel.
pub const CHANNEL_CAPACITY: usize = 256;

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Connected {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    MetricsUpdate(MetricsSnapshot),
    Status {
        room: String,
        msg: String,
    },

    // Lifecycle events published by the API
    ProjectCreated {
        project: Project,
    },
    ProjectUpdated {
        project: Project,
    },
    CollaboratorsChanged {
        project_id: i64,
        collaborators: Vec<String>,
    },
    DeploymentCreated {
        deployment: Deployment,
    },
    WorkspaceLaunched {
        workspace: Workspace,
    },
    ContainerAction {
        container_id: String,
        action: String,
    },
}

/// Synthetic metrics pushed on request. Not read from `system_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_in: u64,
    pub network_out: u64,
    pub active_connections: u32,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn synthetic() -> Self {
        Self {
            cpu_usage: 45.2,
            memory_usage: 67.8,
            disk_usage: 23.1,
            network_in: 1024,
            network_out: 2048,
            active_connections: 12,
            timestamp: Utc::now(),
        }
    }
}

/// A serialized frame on the shared channel. `room: None` reaches every
/// connection; otherwise only connections that joined the room.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub room: Option<String>,
    pub payload: String,
}

impl Broadcast {
    fn delivers_to(&self, joined: &HashSet<String>) -> bool {
        match &self.room {
            None => true,
            Some(room) => joined.contains(room),
        }
    }
}

pub type WsSender = broadcast::Sender<Broadcast>;

pub fn channel() -> WsSender {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    tx
}

/// Inbound frame. `data` is optional so bare `{"event": "request_metrics"}`
/// is accepted.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// What a client frame produces.
#[derive(Debug)]
enum Outgoing {
    /// Reply to the sender only.
    Reply(String),
    /// Publish on the shared channel.
    Publish(Broadcast),
}

fn encode(msg: &WsMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "failed to serialize WsMessage");
            None
        }
    }
}

fn room_of(data: &serde_json::Value) -> Option<String> {
    data.get("room")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

fn room_status(room: String, msg: String) -> Option<Outgoing> {
    let payload = encode(&WsMessage::Status {
        room: room.clone(),
        msg,
    })?;
    Some(Outgoing::Publish(Broadcast {
        room: Some(room),
        payload,
    }))
}

/// Apply one client text frame to the connection's room set.
fn handle_client_frame(
    text: &str,
    session_id: &str,
    joined: &mut HashSet<String>,
) -> Option<Outgoing> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(session_id, error = %e, "ignoring malformed client frame");
            return None;
        }
    };

    match frame.event.as_str() {
        "request_metrics" => {
            encode(&WsMessage::MetricsUpdate(MetricsSnapshot::synthetic())).map(Outgoing::Reply)
        }
        "join" => {
            let room = room_of(&frame.data)?;
            joined.insert(room.clone());
            info!(session_id, room = %room, "client joined room");
            room_status(room, format!("{} has entered the room.", session_id))
        }
        "leave" => {
            let room = room_of(&frame.data)?;
            joined.remove(&room);
            info!(session_id, room = %room, "client left room");
            room_status(room, format!("{} has left the room.", session_id))
        }
        other => {
            debug!(session_id, event = other, "ignoring unknown client event");
            None
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
) -> impl IntoResponse {
    let tx = state.ws_tx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, tx, session.session_id))
}

async fn handle_socket(socket: WebSocket, tx: WsSender, session_id: String) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    info!(session_id = %session_id, "websocket connected");
    run_socket_loop(sender, receiver, tx, rx, &session_id).await;
    info!(session_id = %session_id, "websocket disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding (filtered by the rooms this connection has
/// joined), client event handling, and periodic ping/pong health checking
/// into a single select loop. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping is sent, the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    tx: WsSender,
    mut rx: broadcast::Receiver<Broadcast>,
    session_id: &str,
) {
    let connected = WsMessage::Connected {
        session_id: session_id.to_string(),
        timestamp: Utc::now(),
    };
    if let Some(json) = encode(&connected)
        && sender.send(Message::Text(json.into())).await.is_err()
    {
        return;
    }

    let mut joined: HashSet<String> = HashSet::new();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(session_id, "pong timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if !frame.delivers_to(&joined) {
                            continue;
                        }
                        if sender.send(Message::Text(frame.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(session_id, skipped, "websocket receiver lagged");
                        continue;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match handle_client_frame(text.as_str(), session_id, &mut joined) {
                            Some(Outgoing::Reply(json)) => {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Outgoing::Publish(frame)) => {
                                let _ = tx.send(frame);
                            }
                            None => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to every connected client.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &WsSender, msg: &WsMessage) {
    if let Some(payload) = encode(msg) {
        let _ = tx.send(Broadcast {
            room: None,
            payload,
        }); // Ignore error if no receivers
    }
}

// ── Tests ────────────────────────────────────────────────────────────
