//! WebSocket endpoint client legs connect to

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    response::IntoResponse,
    routing::get,
};

use super::ApiState;
use crate::relay::run_relay;

/// Build the relay router mounted at `path`
pub fn router(path: &str, state: Arc<ApiState>) -> Router {
    Router::new()
        .route(path, get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Relay one client connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let _guard = SessionGuard::enter(&state.active_sessions);
    run_relay(socket, Arc::clone(&state.relay)).await;
}

/// Counts a running session for as long as it lives
struct SessionGuard<'a>(&'a AtomicUsize);

impl<'a> SessionGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
