//! HTTP surface of the relay: the WebSocket endpoint and a health probe

pub mod health;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::Result;

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub relay: Arc<RelayConfig>,
    /// Relay sessions currently running
    pub active_sessions: Arc<AtomicUsize>,
}

impl ApiState {
    #[must_use]
    pub fn new(relay: Arc<RelayConfig>) -> Self {
        Self {
            relay,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    #[must_use]
    pub fn new(relay: RelayConfig) -> Self {
        Self {
            state: Arc::new(ApiState::new(Arc::new(relay))),
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .merge(websocket::router(&self.state.relay.path, self.state.clone()))
            .merge(health::router(self.state.clone()));

        // clients may be served from any origin
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server on the configured port
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.state.relay.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
        tracing::info!(
            port,
            path = %self.state.relay.path,
            egress = self.state.relay.egress_host().unwrap_or("direct"),
            max_pending_frames = ?self.state.relay.max_pending_frames,
            "relay listening"
        );
        if self.state.relay.api_key.is_none() {
            tracing::warn!("GEMINI_API_KEY is not set; every session will fail upstream");
        }

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
