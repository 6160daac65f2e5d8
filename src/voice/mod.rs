//! Voice processing module
//!
//! Microphone capture and encoding, gapless playback of service audio, and
//! the spectrum taps that feed the avatar.

mod capture;
pub mod pcm;
mod playback;
pub mod spectrum;

pub use capture::{AudioCapture, BlockOutcome, CaptureEncoder, SessionGate, VolumeMeter};
pub use pcm::AudioFrame;
pub use playback::{AudioPlayback, PlaybackQueue, PlaybackScheduler, ScheduledSlot};
pub use spectrum::{SampleTap, SnapshotCell, SpectrumAnalyser, SpectrumFeed, SpectrumSnapshot};

/// Channel on which audio device callbacks report fatal stream errors
pub type FaultSender = tokio::sync::mpsc::UnboundedSender<crate::Error>;
