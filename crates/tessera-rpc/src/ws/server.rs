use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tessera_consensus::EngineStatus;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::events::{EventBroadcaster, WsEvent};

const HEARTBEAT: Duration = Duration::from_secs(30);

pub struct WsState {
    pub broadcaster: Arc<EventBroadcaster>,
    pub status: watch::Receiver<EngineStatus>,
}

/// `/ws` streams commit events and view changes as JSON text frames
pub fn create_ws_router(broadcaster: Arc<EventBroadcaster>, status: watch::Receiver<EngineStatus>) -> Router {
    let state = Arc::new(WsState { broadcaster, status });

    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.broadcaster.subscribe();
    let mut status = state.status.clone();
    let mut last_view = status.borrow_and_update().view;
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.tick().await;

    info!("New WebSocket connection");

    loop {
        let outgoing = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WebSocket client lagged {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    debug!("Consensus stopped");
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.view == last_view {
                    continue;
                }
                last_view = current.view;
                WsEvent::view_changed(&current)
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                continue;
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => continue,
            },
        };

        let json = match serde_json::to_string(&outgoing) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                continue;
            }
        };
        if let Err(e) = sender.send(Message::Text(json.into())).await {
            warn!("Failed to send WebSocket message: {}", e);
            break;
        }
    }

    info!("WebSocket connection closed");
}
