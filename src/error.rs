//! Error types for the avatar gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error (missing, revoked or misconfigured device)
    #[error("audio error: {0}")]
    Audio(String),

    /// Resampling requested from a lower to a higher rate
    #[error("unsupported sample rate conversion: {input} Hz -> {target} Hz")]
    UnsupportedRate { input: u32, target: u32 },

    /// Malformed or unexpected message shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Upstream or client leg failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Error reported by the speech service itself
    #[error("service error: {0}")]
    Service(String),

    /// Pre-handshake buffer exceeded its configured cap
    #[error("pre-handshake buffer overflow ({0} frames)")]
    BufferOverflow(usize),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Base64 payload could not be decoded
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// WebSocket error from the client library
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
