//! Session relay between a client leg and the upstream speech service
//!
//! Each client connection gets its own [`RelaySession`] actor. Both legs are
//! pairs of pump tasks: a reader that turns socket messages into
//! [`SessionEvent`]s and a writer that drains [`LegCommand`]s. The actor owns
//! every state transition; the legs never touch each other.
//!
//! ```text
//! client socket ──reader──▶ ┌──────────────┐ ──LegCommand──▶ writer ──▶ upstream socket
//!                           │ RelaySession │
//! client socket ◀──writer── └──────────────┘ ◀──reader────────────────── upstream socket
//! ```

mod egress;
mod legs;
mod session;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite;

pub use egress::{UpstreamStream, connect_upstream, ensure_crypto_provider};
pub use legs::{WireMessage, spawn_leg};
pub use session::{Flow, RelaySession, RelayState};

use crate::Result;
use crate::config::RelayConfig;

/// Largest close reason that fits a control frame (125 bytes minus the code)
pub const MAX_CLOSE_REASON: usize = 123;

/// Well-known close codes
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// A data frame, forwarded opaquely
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Close code and human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Form that may legally go on the wire
    ///
    /// Codes that are reserved or undefined for sending become 1011 and the
    /// reason is cut at a character boundary to fit a control frame.
    #[must_use]
    pub fn sendable(mut self) -> Self {
        if !matches!(self.code, 1000..=1003 | 1007..=1014 | 3000..=4999) {
            self.code = close_code::INTERNAL_ERROR;
        }
        if self.reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !self.reason.is_char_boundary(end) {
                end -= 1;
            }
            self.reason.truncate(end);
        }
        self
    }
}

/// Something that happened on one leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegEvent {
    Frame(Frame),
    /// Close frame received, or the stream ended without one
    Closed(Option<CloseInfo>),
    /// Transport failure
    Error(String),
}

/// Instruction for a leg's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegCommand {
    Send(Frame),
    Close(Option<CloseInfo>),
}

/// Input to the session actor
#[derive(Debug)]
pub enum SessionEvent {
    Client(LegEvent),
    Upstream(LegEvent),
    /// Upstream handshake finished; frames may now be written to it
    UpstreamReady(LegHandle),
    /// Upstream could not be reached or rejected the handshake
    UpstreamFailed(String),
}

/// The actor's end of a leg
///
/// Dropping the handle stops the leg's reader and lets its writer finish
/// whatever was already queued before closing the socket.
#[derive(Debug)]
pub struct LegHandle {
    commands: mpsc::UnboundedSender<LegCommand>,
    reader: Option<AbortHandle>,
}

impl LegHandle {
    /// Handle backed by a bare command channel
    #[must_use]
    pub const fn new(commands: mpsc::UnboundedSender<LegCommand>) -> Self {
        Self {
            commands,
            reader: None,
        }
    }

    const fn with_reader(commands: mpsc::UnboundedSender<LegCommand>, reader: AbortHandle) -> Self {
        Self {
            commands,
            reader: Some(reader),
        }
    }

    /// Queue a frame; returns false if the writer is gone
    pub fn send(&self, frame: Frame) -> bool {
        self.commands.send(LegCommand::Send(frame)).is_ok()
    }

    /// Queue a close
    pub fn close(&self, info: Option<CloseInfo>) {
        let _ = self.commands.send(LegCommand::Close(info));
    }
}

impl Drop for LegHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Relay one client connection until either side is done
///
/// The upstream leg is opened in the background; frames the client sends in
/// the meantime are buffered by the session.
pub async fn run_relay<S, M, E>(client_socket: S, relay: Arc<RelayConfig>) -> RelayState
where
    S: futures::Stream<Item = std::result::Result<M, E>> + futures::Sink<M, Error = E> + Send + 'static,
    M: WireMessage + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    run_relay_with(client_socket, relay, |relay| async move {
        connect_upstream(&relay).await
    })
    .await
}

/// [`run_relay`] with a caller-supplied upstream connector
///
/// A connector that fails or panics ends the session with 1011 instead of
/// leaving the client waiting on a leg that will never open.
pub async fn run_relay_with<S, M, E, C, F, U>(
    client_socket: S,
    relay: Arc<RelayConfig>,
    connect: C,
) -> RelayState
where
    S: futures::Stream<Item = std::result::Result<M, E>> + futures::Sink<M, Error = E> + Send + 'static,
    M: WireMessage + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    C: FnOnce(Arc<RelayConfig>) -> F + Send + 'static,
    F: Future<Output = Result<U>> + Send + 'static,
    U: futures::Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>>
        + futures::Sink<tungstenite::Message, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let client = spawn_leg(client_socket, SessionEvent::Client, events_tx.clone());

    let mut session = RelaySession::new(client, relay.max_pending_frames);
    let session_id = session.id();
    tracing::info!(session_id = %session_id, "client connected");
    session.begin_connect();

    let via_egress = relay.egress.is_some();
    let connector = tokio::spawn(async move {
        let attempt = AssertUnwindSafe(connect(relay)).catch_unwind().await;
        let event = match attempt {
            Ok(Ok(stream)) => {
                tracing::info!(session_id = %session_id, via_egress, "upstream connected");
                SessionEvent::UpstreamReady(spawn_leg(stream, SessionEvent::Upstream, events_tx.clone()))
            }
            Ok(Err(e)) => {
                tracing::error!(session_id = %session_id, error = %e, "upstream connect failed");
                SessionEvent::UpstreamFailed(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(session_id = %session_id, panic = %message, "upstream connector panicked");
                SessionEvent::UpstreamFailed(format!("connector panicked: {message}"))
            }
        };
        let _ = events_tx.send(event);
    });

    let state = session.run(events_rx).await;
    connector.abort();

    tracing::info!(session_id = %session_id, state = ?state, "session ended");
    state
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
