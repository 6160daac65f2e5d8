//! Local conversation client
//!
//! Ties the microphone, the relay link, the speaker and the avatar together
//! for one session. Everything a [`Conversation`] starts it also stops;
//! there is no state in which the link is down but a device is still open.

pub mod protocol;
mod session;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use session::{LinkHandler, LinkStream, SessionStatus, connect, run_link};

use crate::avatar::{AvatarDriver, AvatarFrame, AvatarInputs};
use crate::config::ClientConfig;
use crate::voice::spectrum::DEFAULT_FFT_SIZE;
use crate::voice::{
    AudioCapture, AudioPlayback, CaptureEncoder, SessionGate, SpectrumFeed, VolumeMeter,
};
use crate::{Error, Result};

/// Captured frames buffered between the audio callback and the link
const OUTBOUND_FRAME_CAPACITY: usize = 64;

/// One running voice session
pub struct Conversation {
    gate: SessionGate,
    status: Arc<watch::Sender<SessionStatus>>,
    capture: AudioCapture,
    playback: AudioPlayback,
    input_volume: VolumeMeter,
    link: Option<JoinHandle<Result<()>>>,
    animation: JoinHandle<()>,
    frames: watch::Receiver<AvatarFrame>,
    faults: mpsc::UnboundedReceiver<Error>,
}

impl Conversation {
    /// Open devices, connect to the relay and start the session
    ///
    /// On failure nothing is left running.
    ///
    /// # Errors
    ///
    /// Returns error if a device cannot be opened or the relay is unreachable
    #[allow(clippy::future_not_send)]
    pub async fn start(config: &ClientConfig) -> Result<Self> {
        let (status, _) = watch::channel(SessionStatus::Connecting);
        let status = Arc::new(status);
        let gate = SessionGate::new();

        match Self::open(config, gate.clone(), Arc::clone(&status)).await {
            Ok(conversation) => Ok(conversation),
            Err(e) => {
                gate.close();
                status.send_replace(SessionStatus::Error(e.to_string()));
                tracing::error!(error = %e, "failed to start conversation");
                Err(e)
            }
        }
    }

    #[allow(clippy::future_not_send)]
    async fn open(
        config: &ClientConfig,
        gate: SessionGate,
        status: Arc<watch::Sender<SessionStatus>>,
    ) -> Result<Self> {
        let (fault_tx, faults) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_FRAME_CAPACITY);

        let mut playback = AudioPlayback::new(&config.playback)?;
        playback.start(fault_tx.clone())?;

        let mut capture = AudioCapture::new()?;
        let capture_spectrum = config
            .lip_sync_source
            .uses_capture()
            .then(|| SpectrumFeed::new(DEFAULT_FFT_SIZE, capture.sample_rate()));
        let mut encoder =
            CaptureEncoder::new(config.capture.clone(), capture.sample_rate(), gate.clone(), frame_tx);
        if let Some(feed) = &capture_spectrum {
            encoder = encoder.with_spectrum_tap(feed.tap().clone());
        }
        let input_volume = encoder.volume_meter();
        capture.start(encoder, fault_tx)?;

        let ws = connect(&config.relay_url).await?;
        tracing::info!(url = %config.relay_url, "conversation link open");

        let handler = LinkHandler::new(config, gate.clone(), playback.queue(), Arc::clone(&status));
        let link_config = config.clone();
        let link = tokio::spawn(async move { run_link(ws, &link_config, handler, frame_rx).await });

        let inputs = AvatarInputs {
            output: playback.spectrum(),
            capture: capture_spectrum,
            input_volume: input_volume.clone(),
        };
        let (frames, animation) =
            AvatarDriver::new(inputs, config.lip_sync_source, config.animation_fps).spawn();

        Ok(Self {
            gate,
            status,
            capture,
            playback,
            input_volume,
            link: Some(link),
            animation,
            frames,
            faults,
        })
    }

    /// Live connection status
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Live animation frames
    #[must_use]
    pub fn frames(&self) -> watch::Receiver<AvatarFrame> {
        self.frames.clone()
    }

    /// Microphone loudness in 0..1
    #[must_use]
    pub fn input_volume(&self) -> f32 {
        self.input_volume.get()
    }

    /// Playback energy in 0..1
    #[must_use]
    pub fn output_volume(&self) -> f32 {
        self.playback.volume()
    }

    /// Wait until the session ends on its own
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session: a link failure, a service
    /// error or a lost audio device
    pub async fn wait(&mut self) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };

        let result = tokio::select! {
            joined = link => match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(Error::Transport(format!("link task failed: {e}"))),
            },
            Some(fault) = self.faults.recv() => Err(fault),
        };
        self.teardown(result.as_ref().err());
        result
    }

    /// Stop everything
    pub fn shutdown(mut self) {
        self.teardown(None);
    }

    fn teardown(&mut self, error: Option<&Error>) {
        self.gate.close();
        if let Some(link) = self.link.take() {
            link.abort();
        }
        self.capture.stop();
        self.playback.stop();
        self.animation.abort();

        match error {
            Some(e) => {
                let message = e.to_string();
                self.status.send_if_modified(|status| {
                    if matches!(status, SessionStatus::Error(_)) {
                        false
                    } else {
                        *status = SessionStatus::Error(message);
                        true
                    }
                });
            }
            None => {
                self.status.send_if_modified(|status| {
                    if matches!(status, SessionStatus::Error(_) | SessionStatus::Disconnected) {
                        false
                    } else {
                        *status = SessionStatus::Disconnected;
                        true
                    }
                });
            }
        }
        let status = self.status.borrow().to_string();
        tracing::info!(status = %status, "conversation closed");
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if !self.gate.is_closed() {
            self.teardown(None);
        }
    }
}
