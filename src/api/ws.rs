// =============================================================================
// WebSocket feed - broadcast events pushed to viewers
// =============================================================================
//
// Clients connect to `/ws` and receive every candle and trade event as a JSON
// text frame. The connection is registered on the broadcaster for its
// lifetime; a send failure or a Close frame unregisters it.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastEvent, Broadcaster};

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<Broadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, broadcaster))
}

/// Forward broadcast events to one connection until either side goes away.
async fn handle_ws_connection(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let (id, mut events) = broadcaster.subscribe();
    info!(subscriber = id, "WebSocket viewer connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(json) = encode(&event) else { continue };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(subscriber = id, error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(subscriber = id, error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Viewers are read-only.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(subscriber = id, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    broadcaster.unsubscribe(id);
    info!(subscriber = id, "WebSocket viewer disconnected");
}

fn encode(event: &BroadcastEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(error = %e, "failed to serialize broadcast event");
            None
        }
    }
}
