//! Socket pump tasks for relay legs

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use super::{CloseInfo, Frame, LegCommand, LegEvent, LegHandle, SessionEvent};

/// WebSocket message type a leg can carry
pub trait WireMessage: Sized {
    fn from_frame(frame: Frame) -> Self;

    fn close(info: Option<CloseInfo>) -> Self;

    /// `None` for control traffic the relay does not forward
    fn into_event(self) -> Option<LegEvent>;
}

impl WireMessage for axum::extract::ws::Message {
    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(bytes) => Self::Binary(bytes),
        }
    }

    fn close(info: Option<CloseInfo>) -> Self {
        Self::Close(info.map(|i| {
            let i = i.sendable();
            axum::extract::ws::CloseFrame {
                code: i.code,
                reason: i.reason.into(),
            }
        }))
    }

    fn into_event(self) -> Option<LegEvent> {
        match self {
            Self::Text(text) => Some(LegEvent::Frame(Frame::Text(text.as_str().to_owned()))),
            Self::Binary(bytes) => Some(LegEvent::Frame(Frame::Binary(bytes))),
            Self::Close(frame) => Some(LegEvent::Closed(
                frame.map(|f| CloseInfo::new(f.code, f.reason.as_str())),
            )),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }
}

impl WireMessage for tungstenite::Message {
    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::text(text),
            Frame::Binary(bytes) => Self::Binary(bytes),
        }
    }

    fn close(info: Option<CloseInfo>) -> Self {
        Self::Close(info.map(|i| {
            let i = i.sendable();
            tungstenite::protocol::CloseFrame {
                code: i.code.into(),
                reason: i.reason.into(),
            }
        }))
    }

    fn into_event(self) -> Option<LegEvent> {
        match self {
            Self::Text(text) => Some(LegEvent::Frame(Frame::Text(text.as_str().to_owned()))),
            Self::Binary(bytes) => Some(LegEvent::Frame(Frame::Binary(bytes))),
            Self::Close(frame) => Some(LegEvent::Closed(
                frame.map(|f| CloseInfo::new(u16::from(f.code), f.reason.as_str())),
            )),
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => None,
        }
    }
}

/// Split a socket into reader and writer tasks
///
/// The reader wraps every event with `wrap` and feeds the session; it stops
/// after the first close or error. The writer drains commands until it sends
/// a close or the handle is dropped, then closes the socket.
pub fn spawn_leg<S, M, E>(
    socket: S,
    wrap: fn(LegEvent) -> SessionEvent,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> LegHandle
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: WireMessage + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (mut sink, mut stream) = socket.split::<M>();
    let (commands, mut rx) = mpsc::unbounded_channel::<LegCommand>();

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                LegCommand::Send(frame) => {
                    if let Err(e) = sink.send(M::from_frame(frame)).await {
                        tracing::debug!(error = %e, "leg write failed");
                        break;
                    }
                }
                LegCommand::Close(info) => {
                    let _ = sink.send(M::close(info)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        loop {
            let event = match stream.next().await {
                Some(Ok(message)) => match message.into_event() {
                    Some(event) => event,
                    None => continue,
                },
                Some(Err(e)) => LegEvent::Error(e.to_string()),
                None => LegEvent::Closed(None),
            };
            let last = !matches!(event, LegEvent::Frame(_));
            if events.send(wrap(event)).is_err() || last {
                break;
            }
        }
    });

    LegHandle::with_reader(commands, reader.abort_handle())
}
