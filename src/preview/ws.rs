use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error};

use super::api::AppState;
use super::console::ConsoleEntry;
use super::controller::PreviewController;
use super::models::{PreviewAddress, Snapshot};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PreviewEvent {
    StateChanged { snapshot: Snapshot },
    ConsoleAppended { entry: ConsoleEntry },
    ConsoleCleared,
    PreviewReady { preview: PreviewAddress },
    /// Sent to a client that missed events: replace local state wholesale.
    Resync {
        snapshot: Snapshot,
        entries: Vec<ConsoleEntry>,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    // Subscribe before taking the snapshot so nothing falls between them
    let rx = state.controller.subscribe_events();
    let hello = PreviewEvent::StateChanged {
        snapshot: state.controller.snapshot(),
    };
    if let Ok(json) = serde_json::to_string(&hello)
        && sender.send(Message::Text(json.into())).await.is_err()
    {
        return;
    }
    run_socket_loop(sender, receiver, rx, &state.controller).await;
}

/// Liveness bookkeeping for one socket. A ping goes out every
/// [`PING_INTERVAL`]; a client that has not answered for [`PONG_TIMEOUT`]
/// is dropped.
#[derive(Debug)]
struct Keepalive {
    last_pong: Instant,
    awaiting_pong: bool,
}

impl Keepalive {
    fn new(now: Instant) -> Self {
        Self {
            last_pong: now,
            awaiting_pong: false,
        }
    }

    /// Called on each ping tick. False means the client is gone.
    fn ping_due(&mut self, now: Instant) -> bool {
        if self.awaiting_pong && now.duration_since(self.last_pong) > PONG_TIMEOUT {
            return false;
        }
        self.awaiting_pong = true;
        true
    }

    fn pong(&mut self, now: Instant) {
        self.last_pong = now;
        self.awaiting_pong = false;
    }
}

enum Outgoing {
    Send(String),
    Skip,
    Close,
}

/// Frame to forward for one receive from the event channel. A lagging
/// client gets a [`PreviewEvent::Resync`] carrying the whole console, so
/// what it shows never has holes.
fn outgoing(
    received: Result<String, broadcast::error::RecvError>,
    controller: &PreviewController,
) -> Outgoing {
    match received {
        Ok(json) => Outgoing::Send(json),
        Err(broadcast::error::RecvError::Closed) => Outgoing::Close,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "WebSocket client fell behind, resyncing");
            let resync = PreviewEvent::Resync {
                snapshot: controller.snapshot(),
                entries: controller.console().entries(),
            };
            match serde_json::to_string(&resync) {
                Ok(json) => Outgoing::Send(json),
                Err(e) => {
                    error!(error = %e, "Failed to serialize resync event");
                    Outgoing::Skip
                }
            }
        }
    }
}

async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    controller: &PreviewController,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut keepalive = Keepalive::new(Instant::now());

    loop {
        let frame = tokio::select! {
            _ = ticks.tick() => {
                if !keepalive.ping_due(Instant::now()) {
                    debug!("WebSocket client stopped answering pings");
                    break;
                }
                Message::Ping(Vec::new().into())
            }
            received = rx.recv() => match outgoing(received, controller) {
                Outgoing::Send(json) => Message::Text(json.into()),
                Outgoing::Skip => continue,
                Outgoing::Close => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Pong(_))) => {
                    keepalive.pong(Instant::now());
                    continue;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        if sender.send(frame).await.is_err() {
            break;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to every subscriber.
/// Returns silently even if nobody is listening.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &PreviewEvent) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize preview event");
        }
    }
}
