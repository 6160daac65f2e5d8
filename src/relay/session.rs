//! Relay session state machine

use std::collections::VecDeque;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{CloseInfo, Frame, LegEvent, LegHandle, SessionEvent, close_code};
use crate::Error;

/// Lifecycle of one relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    ConnectingUpstream,
    UpstreamOpen,
    Forwarding,
    Closing,
    Closed,
    Failed,
}

impl RelayState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Whether the actor keeps running after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Actor owning one client connection and its upstream leg
pub struct RelaySession {
    id: Uuid,
    state: RelayState,
    client: LegHandle,
    upstream: Option<LegHandle>,
    pending: VecDeque<Frame>,
    max_pending: Option<usize>,
}

impl RelaySession {
    #[must_use]
    pub fn new(client: LegHandle, max_pending: Option<usize>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RelayState::Idle,
            client,
            upstream: None,
            pending: VecDeque::new(),
            max_pending,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> RelayState {
        self.state
    }

    /// Frames waiting for the upstream leg
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn transition(&mut self, to: RelayState) {
        if self.state != to {
            tracing::debug!(session_id = %self.id, from = ?self.state, to = ?to, "relay state");
            self.state = to;
        }
    }

    /// The client leg was accepted and the upstream connect has started
    pub fn begin_connect(&mut self) {
        if self.state == RelayState::Idle {
            self.transition(RelayState::ConnectingUpstream);
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent) -> Flow {
        if self.state.is_terminal() {
            return Flow::Stop;
        }

        match event {
            SessionEvent::Client(LegEvent::Frame(frame)) => self.on_client_frame(frame),
            SessionEvent::Client(LegEvent::Closed(info)) => {
                tracing::info!(session_id = %self.id, code = info.as_ref().map(|i| i.code), "client closed");
                self.finish(Side::Upstream, info, RelayState::Closed)
            }
            SessionEvent::Client(LegEvent::Error(message)) => {
                tracing::warn!(session_id = %self.id, error = %message, "client leg error");
                self.finish(Side::Upstream, None, RelayState::Closed)
            }
            SessionEvent::UpstreamReady(handle) => self.on_upstream_ready(handle),
            SessionEvent::UpstreamFailed(message) => {
                self.fail(CloseInfo::new(close_code::INTERNAL_ERROR, format!("upstream error: {message}")))
            }
            SessionEvent::Upstream(LegEvent::Frame(frame)) => {
                if self.client.send(frame) && self.state == RelayState::UpstreamOpen {
                    self.transition(RelayState::Forwarding);
                }
                Flow::Continue
            }
            SessionEvent::Upstream(LegEvent::Closed(info)) => {
                tracing::info!(session_id = %self.id, code = info.as_ref().map(|i| i.code), "upstream closed");
                let info = info.unwrap_or_else(|| CloseInfo::new(close_code::INTERNAL_ERROR, "upstream closed"));
                self.finish(Side::Client, Some(info), RelayState::Closed)
            }
            SessionEvent::Upstream(LegEvent::Error(message)) => {
                tracing::error!(session_id = %self.id, error = %message, "upstream leg error");
                self.fail(CloseInfo::new(close_code::INTERNAL_ERROR, format!("upstream error: {message}")))
            }
        }
    }

    fn on_client_frame(&mut self, frame: Frame) -> Flow {
        match self.state {
            RelayState::Idle | RelayState::ConnectingUpstream => {
                self.pending.push_back(frame);
                if let Some(cap) = self.max_pending
                    && self.pending.len() > cap
                {
                    let error = Error::BufferOverflow(cap);
                    tracing::warn!(session_id = %self.id, error = %error, "closing client");
                    return self.fail(CloseInfo::new(close_code::POLICY, error.to_string()));
                }
                tracing::trace!(session_id = %self.id, pending = self.pending.len(), "buffered frame");
                Flow::Continue
            }
            RelayState::UpstreamOpen | RelayState::Forwarding => {
                if let Some(upstream) = &self.upstream
                    && upstream.send(frame)
                {
                    self.transition(RelayState::Forwarding);
                }
                Flow::Continue
            }
            RelayState::Closing | RelayState::Closed | RelayState::Failed => Flow::Continue,
        }
    }

    fn on_upstream_ready(&mut self, handle: LegHandle) -> Flow {
        if self.state != RelayState::ConnectingUpstream {
            handle.close(Some(CloseInfo::new(close_code::NORMAL, "")));
            return Flow::Continue;
        }

        self.transition(RelayState::UpstreamOpen);
        if !self.pending.is_empty() {
            tracing::debug!(session_id = %self.id, count = self.pending.len(), "flushing buffered frames");
        }
        let mut forwarded = false;
        while let Some(frame) = self.pending.pop_front() {
            forwarded |= handle.send(frame);
        }
        self.upstream = Some(handle);
        if forwarded {
            self.transition(RelayState::Forwarding);
        }
        Flow::Continue
    }

    /// Close the leg on `side` and end the session in `end`
    fn finish(&mut self, side: Side, info: Option<CloseInfo>, end: RelayState) -> Flow {
        self.transition(RelayState::Closing);
        let info = info.map(CloseInfo::sendable);
        match side {
            Side::Client => self.client.close(info),
            Side::Upstream => {
                if let Some(upstream) = &self.upstream {
                    upstream.close(info);
                }
            }
        }
        self.pending.clear();
        self.transition(end);
        Flow::Stop
    }

    fn fail(&mut self, info: CloseInfo) -> Flow {
        if let Some(upstream) = &self.upstream {
            upstream.close(None);
        }
        self.client.close(Some(info.sendable()));
        self.pending.clear();
        self.transition(RelayState::Failed);
        Flow::Stop
    }

    /// Process events until the session ends
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> RelayState {
        while let Some(event) = events.recv().await {
            if self.handle(event) == Flow::Stop {
                break;
            }
        }

        if !self.state.is_terminal() {
            self.finish(Side::Client, None, RelayState::Closed);
        }
        self.state
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Upstream,
}
