//! HTTP surface of the relay: the WebSocket upgrade route and a health probe.

pub mod config;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::trace::TraceLayer;

use murmur_gateway::{MessageRouter, connection};

#[derive(Clone)]
pub struct ServerState {
    pub router: MessageRouter,
    pub max_message_bytes: usize,
}

pub fn app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .max_frame_size(state.max_message_bytes)
        .on_upgrade(move |socket| connection::handle_connection(socket, state.router))
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "online": state.router.registry().len().await,
    }))
}
