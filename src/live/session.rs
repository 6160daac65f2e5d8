//! Live link to the speech service through the relay

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{ClientMessage, ServerEvent, parse_server_message};
use crate::config::ClientConfig;
use crate::voice::{AudioFrame, PlaybackQueue, SessionGate};
use crate::{Error, Result};

/// WebSocket connection to the relay
pub type LinkStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state shown to the user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Ended by an error; carries the user-facing message
    Error(String),
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Open the WebSocket to the relay
///
/// # Errors
///
/// Returns error if the connection or handshake fails
pub async fn connect(relay_url: &str) -> Result<LinkStream> {
    crate::relay::ensure_crypto_provider();
    let (stream, response) = tokio_tungstenite::connect_async(relay_url).await?;
    tracing::debug!(url = %relay_url, status = %response.status(), "connected to relay");
    Ok(stream)
}

/// Reacts to service messages; owns no I/O
pub struct LinkHandler {
    gate: SessionGate,
    playback: PlaybackQueue,
    status: Arc<watch::Sender<SessionStatus>>,
    greeting: Option<String>,
    default_rate: u32,
}

impl LinkHandler {
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        gate: SessionGate,
        playback: PlaybackQueue,
        status: Arc<watch::Sender<SessionStatus>>,
    ) -> Self {
        Self {
            gate,
            playback,
            status,
            greeting: config.greeting.clone(),
            default_rate: config.playback.sample_rate,
        }
    }

    /// Handle one inbound text frame, returning messages to send back
    ///
    /// Malformed frames are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns `Service` when the service reports an error, which ends the link
    pub fn on_text(&mut self, text: &str) -> Result<Vec<ClientMessage>> {
        let events = match parse_server_message(text, self.default_rate) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed message");
                return Ok(Vec::new());
            }
        };

        let mut replies = Vec::new();
        for event in events {
            match event {
                ServerEvent::SetupComplete => {
                    if self.gate.open() {
                        tracing::info!("setup complete, audio streaming enabled");
                        self.status.send_replace(SessionStatus::Connected);
                        if let Some(greeting) = self.greeting.take() {
                            replies.push(ClientMessage::user_text(&greeting));
                        }
                    }
                }
                ServerEvent::Audio(frame) => {
                    if let Err(e) = self.playback.enqueue(frame) {
                        tracing::warn!(error = %e, "dropping audio chunk");
                    }
                }
                ServerEvent::Interrupted => {
                    tracing::debug!("turn interrupted, clearing playback");
                    self.playback.clear();
                }
                ServerEvent::TurnComplete => tracing::debug!("turn complete"),
                ServerEvent::Error(message) => {
                    tracing::error!(error = %message, "service error");
                    self.status.send_replace(SessionStatus::Error(message.clone()));
                    return Err(Error::Service(message));
                }
            }
        }
        Ok(replies)
    }
}

/// Drive the link until it closes
///
/// Sends the setup message, then forwards captured frames while handling
/// service messages. A normal close returns `Ok`.
///
/// # Errors
///
/// Returns error on a transport failure, an abnormal close or a service error
pub async fn run_link(
    ws: LinkStream,
    config: &ClientConfig,
    mut handler: LinkHandler,
    mut frames: mpsc::Receiver<AudioFrame>,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::text(ClientMessage::setup(config).to_json()?))
        .await?;
    tracing::debug!(model = %config.model, voice = %config.voice_name, "setup sent");

    let mut capture_open = true;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let text = match msg {
                    None => {
                        return Err(Error::Transport("relay connection ended".to_string()));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "discarding non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(f) if f.code != CloseCode::Normal => Err(Error::Transport(format!(
                                "relay closed ({}): {}",
                                u16::from(f.code),
                                f.reason.as_str()
                            ))),
                            _ => Ok(()),
                        };
                    }
                    Some(Ok(_)) => continue,
                };

                for reply in handler.on_text(&text)? {
                    sink.send(Message::text(reply.to_json()?)).await?;
                }
            }
            frame = frames.recv(), if capture_open => {
                match frame {
                    Some(frame) => {
                        sink.send(Message::text(ClientMessage::audio(&frame).to_json()?))
                            .await?;
                    }
                    None => {
                        tracing::debug!("capture ended");
                        capture_open = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::voice::PlaybackScheduler;

    fn handler(greeting: Option<&str>) -> (LinkHandler, SessionGate, PlaybackQueue, watch::Receiver<SessionStatus>) {
        let config = ClientConfig {
            greeting: greeting.map(str::to_string),
            ..ClientConfig::default()
        };
        let gate = SessionGate::new();
        let queue = PlaybackQueue::new(PlaybackScheduler::new(24_000, Duration::ZERO));
        let (tx, rx) = watch::channel(SessionStatus::Connecting);
        let handler = LinkHandler::new(&config, gate.clone(), queue.clone(), Arc::new(tx));
        (handler, gate, queue, rx)
    }

    #[test]
    fn test_setup_complete_opens_gate_and_greets_once() {
        let (mut h, gate, _queue, status) = handler(Some("hi there"));

        let replies = h.on_text(r#"{"setupComplete":{}}"#).unwrap();
        assert!(gate.is_open());
        assert_eq!(*status.borrow(), SessionStatus::Connected);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], ClientMessage::ClientContent(_)));

        assert!(h.on_text(r#"{"setupComplete":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn test_no_greeting_configured() {
        let (mut h, gate, _queue, _status) = handler(None);
        assert!(h.on_text(r#"{"setupComplete":{}}"#).unwrap().is_empty());
        assert!(gate.is_open());
    }

    #[test]
    fn test_audio_is_scheduled() {
        let (mut h, _gate, queue, _status) = handler(None);
        let frame = AudioFrame::new(vec![0.1; 240], 24_000);
        let text = serde_json::json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": frame.to_base64() } }
            ]}}
        })
        .to_string();

        h.on_text(&text).unwrap();
        assert!(!queue.is_idle());
        assert_eq!(queue.pending(), Duration::from_millis(10));

        h.on_text(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert!(queue.is_idle());
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        let (mut h, gate, _queue, status) = handler(None);
        assert!(h.on_text("{oops").unwrap().is_empty());
        assert!(!gate.is_open());
        assert_eq!(*status.borrow(), SessionStatus::Connecting);
    }

    #[test]
    fn test_service_error_ends_link() {
        let (mut h, _gate, _queue, status) = handler(None);
        let result = h.on_text(r#"{"error":{"message":"bad key"}}"#);
        assert!(matches!(result, Err(Error::Service(ref m)) if m == "bad key"));
        assert_eq!(*status.borrow(), SessionStatus::Error("bad key".to_string()));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Connecting.to_string(), "connecting");
        assert_eq!(SessionStatus::Error("x".to_string()).to_string(), "error: x");
    }
}
