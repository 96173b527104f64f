pub mod ws;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::broadcast::Broadcaster;

/// HTTP surface of the service: the broadcast WebSocket feed.
pub fn router(broadcaster: Arc<Broadcaster>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(broadcaster)
}
