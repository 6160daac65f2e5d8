//! Avatar Gateway - realtime voice relay and talking-head driver
//!
//! This library provides the pieces of a browserless voice avatar:
//! - A WebSocket relay that keeps the speech service key off the client
//! - Microphone capture and PCM16 encoding for the service
//! - Gapless scheduling of the service's audio replies
//! - Spectral lip sync that turns playback into mouth shapes
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Conversation (client)                  │
//! │  Capture ─▶ Encoder ─▶ link ─▶ PlaybackQueue ─▶ Speaker │
//! │                               │                         │
//! │                       Spectrum ─▶ Visemes ─▶ frames     │
//! └──────────────────────────┬─────────────────────────────┘
//!                            │ WebSocket
//! ┌──────────────────────────▼─────────────────────────────┐
//! │                     Relay (server)                      │
//! │   client leg  ◀──▶  RelaySession  ◀──▶  upstream leg    │
//! └──────────────────────────┬─────────────────────────────┘
//!                            │ WebSocket (optionally via CONNECT egress)
//! ┌──────────────────────────▼─────────────────────────────┐
//! │                 Realtime speech service                 │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod avatar;
pub mod config;
pub mod error;
pub mod live;
pub mod relay;
pub mod voice;

pub use api::ApiServer;
pub use avatar::{AvatarDriver, AvatarFrame, LipSyncSource, VisemeState, VisemeSynthesizer};
pub use config::{ClientConfig, Config, RelayConfig};
pub use error::{Error, Result};
pub use live::{Conversation, SessionStatus};
pub use relay::{RelaySession, RelayState, run_relay};
