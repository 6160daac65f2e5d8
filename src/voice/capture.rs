//! Audio capture from microphone
//!
//! The cpal input callback hands raw samples to a [`CaptureEncoder`], which
//! cuts them into fixed-size blocks, publishes a loudness estimate, and turns
//! each block into a wire-ready [`AudioFrame`] once the session gate is open.
//!
//! Everything here runs on the device thread. Block assembly reuses one
//! buffer; the only allocation is the outbound frame handed to the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::pcm::{self, AudioFrame};
use super::spectrum::SampleTap;
use super::FaultSender;
use crate::config::CaptureSettings;
use crate::{Error, Result};

const GATE_PENDING: u8 = 0;
const GATE_OPEN: u8 = 1;
const GATE_CLOSED: u8 = 2;

/// Whether captured audio may be transmitted
///
/// Starts pending, opens once the upstream handshake completes and closes for
/// good on teardown. Closing takes effect on the very next block.
#[derive(Debug, Clone, Default)]
pub struct SessionGate {
    state: Arc<AtomicU8>,
}

impl SessionGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate; has no effect once closed
    pub fn open(&self) -> bool {
        self.state
            .compare_exchange(GATE_PENDING, GATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Close the gate permanently
    pub fn close(&self) {
        self.state.store(GATE_CLOSED, Ordering::Release);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_OPEN
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_CLOSED
    }
}

/// Poll-based loudness readout in 0..1
///
/// Holds only the latest value; nothing is queued.
#[derive(Debug, Clone, Default)]
pub struct VolumeMeter {
    bits: Arc<AtomicU32>,
}

impl VolumeMeter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, volume: f32) {
        self.bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// What happened to one captured block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Encoded and handed to the session
    Sent,
    /// Dropped because the handshake has not completed (or the session closed)
    Gated,
    /// Dropped because the outbound queue is full
    Backpressured,
    /// Dropped because the session link is gone
    Disconnected,
}

/// Per-block gain, loudness, resampling and encoding
pub struct CaptureEncoder {
    settings: CaptureSettings,
    input_rate: u32,
    gate: SessionGate,
    volume: VolumeMeter,
    frames: mpsc::Sender<AudioFrame>,
    block: Vec<f32>,
    tap: Option<SampleTap>,
}

impl CaptureEncoder {
    /// Create an encoder for a device running at `input_rate`
    #[must_use]
    pub fn new(
        settings: CaptureSettings,
        input_rate: u32,
        gate: SessionGate,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Self {
        let block_size = settings.block_size.max(1);
        Self {
            settings,
            input_rate,
            gate,
            volume: VolumeMeter::new(),
            frames,
            block: Vec::with_capacity(block_size),
            tap: None,
        }
    }

    /// Also copy the gained input into `tap` for spectrum analysis
    #[must_use]
    pub fn with_spectrum_tap(mut self, tap: SampleTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Shared loudness readout updated every block
    #[must_use]
    pub fn volume_meter(&self) -> VolumeMeter {
        self.volume.clone()
    }

    /// Feed raw mono samples; every complete block is processed
    pub fn push(&mut self, mut samples: &[f32]) {
        let block_size = self.settings.block_size.max(1);

        while !samples.is_empty() {
            let take = (block_size - self.block.len()).min(samples.len());
            self.block.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.block.len() == block_size {
                let mut block = std::mem::take(&mut self.block);
                if let Err(e) = self.process_block(&mut block) {
                    tracing::warn!(error = %e, "dropping capture block");
                }
                block.clear();
                self.block = block;
            }
        }
    }

    /// Process one block
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedRate` if the device rate is below the target rate;
    /// only this block is affected
    pub fn process_block(&mut self, block: &mut [f32]) -> Result<BlockOutcome> {
        for sample in block.iter_mut() {
            *sample *= self.settings.gain;
        }

        let level = (pcm::rms(block) * self.settings.volume_scale).min(1.0);
        self.volume.set(level);

        if let Some(tap) = &self.tap {
            tap.write(block);
        }

        if !self.gate.is_open() {
            return Ok(BlockOutcome::Gated);
        }

        let resampled = pcm::downsample(block, self.input_rate, self.settings.target_rate)?;
        let frame = AudioFrame::new(resampled, self.settings.target_rate);

        match self.frames.try_send(frame) {
            Ok(()) => Ok(BlockOutcome::Sent),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(BlockOutcome::Backpressured),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(BlockOutcome::Disconnected),
        }
    }
}

/// Captures audio from the default input device
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at its preferred configuration
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
        })
    }

    /// Native rate of the input device
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start capturing into `encoder`
    ///
    /// Stream errors (device unplugged or revoked) are reported on `faults`.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self, encoder: CaptureEncoder, faults: FaultSender) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = match self.sample_format {
            SampleFormat::F32 => build_input::<f32>(&self.device, &self.config, encoder, faults),
            SampleFormat::I16 => build_input::<i16>(&self.device, &self.config, encoder, faults),
            SampleFormat::U16 => build_input::<u16>(&self.device, &self.config, encoder, faults),
            other => Err(Error::Audio(format!("unsupported input sample format: {other}"))),
        }?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

/// Build an input stream that downmixes to mono and feeds the encoder
#[allow(clippy::cast_precision_loss)]
fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut encoder: CaptureEncoder,
    faults: FaultSender,
) -> Result<Stream>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    // grows to the device's largest callback once, then is reused
    let mut mono: Vec<f32> = Vec::with_capacity(4096);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                }));
                encoder.push(&mono);
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = faults.send(Error::Audio(format!("input device: {err}")));
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(input_rate: u32, capacity: usize) -> (CaptureEncoder, SessionGate, mpsc::Receiver<AudioFrame>) {
        let gate = SessionGate::new();
        let (tx, rx) = mpsc::channel(capacity);
        let enc = CaptureEncoder::new(CaptureSettings::default(), input_rate, gate.clone(), tx);
        (enc, gate, rx)
    }

    #[test]
    fn test_gate_lifecycle() {
        let gate = SessionGate::new();
        assert!(!gate.is_open());
        assert!(gate.open());
        assert!(gate.is_open());
        gate.close();
        assert!(gate.is_closed());
        assert!(!gate.open());
        assert!(!gate.is_open());
    }

    #[test]
    fn test_blocks_dropped_before_handshake() {
        let (mut enc, _gate, mut rx) = encoder(48_000, 8);
        enc.push(&[0.1; 512]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_volume_updates_even_when_gated() {
        let (mut enc, _gate, _rx) = encoder(48_000, 8);
        let meter = enc.volume_meter();
        // gain 3, rms 0.3, scale 5 -> capped at 1
        enc.push(&[0.1; 128]);
        assert!((meter.get() - 1.0).abs() < 1e-6);

        // gain 3, rms 0.03, scale 5 -> 0.15
        enc.push(&[0.01; 128]);
        assert!((meter.get() - 0.15).abs() < 1e-4);
    }

    #[test]
    fn test_open_gate_emits_resampled_frames() {
        let (mut enc, gate, mut rx) = encoder(48_000, 8);
        gate.open();
        enc.push(&[0.1; 256]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(first.sample_rate, 16_000);
        assert_eq!(first.samples.len(), 43);
        assert!((first.samples[0] - 0.3).abs() < 1e-6);
        assert_eq!(second.samples.len(), 43);
    }

    #[test]
    fn test_partial_block_waits_for_more_samples() {
        let (mut enc, gate, mut rx) = encoder(16_000, 8);
        gate.open();
        enc.push(&[0.0; 100]);
        assert!(rx.try_recv().is_err());
        enc.push(&[0.0; 28]);
        assert_eq!(rx.try_recv().unwrap().samples.len(), 128);
    }

    #[test]
    fn test_closing_gate_stops_transmission() {
        let (mut enc, gate, mut rx) = encoder(16_000, 8);
        gate.open();
        enc.push(&[0.0; 128]);
        gate.close();
        enc.push(&[0.0; 128]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_low_rate_device_fails_only_the_encode() {
        let (mut enc, gate, mut rx) = encoder(8_000, 8);
        let meter = enc.volume_meter();
        gate.open();

        let mut block = vec![0.1; 128];
        let result = enc.process_block(&mut block);
        assert!(matches!(result, Err(Error::UnsupportedRate { .. })));
        assert!(meter.get() > 0.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_backpressures() {
        let (mut enc, gate, _rx) = encoder(16_000, 1);
        gate.open();
        let mut block = vec![0.0; 128];
        assert_eq!(enc.process_block(&mut block).unwrap(), BlockOutcome::Sent);
        let mut block = vec![0.0; 128];
        assert_eq!(enc.process_block(&mut block).unwrap(), BlockOutcome::Backpressured);
    }

    #[test]
    fn test_spectrum_tap_receives_gained_blocks() {
        let (enc, _gate, _rx) = encoder(48_000, 8);
        let tap = SampleTap::new(256, 48_000);
        let mut enc = enc.with_spectrum_tap(tap.clone());

        // one full block and a partial one; only the full block is tapped
        enc.push(&[0.1; 200]);
        let mut latest = [0.0; 256];
        tap.copy_latest(&mut latest);
        assert!(latest[..128].iter().all(|s| s.abs() < f32::EPSILON));
        assert!(latest[128..].iter().all(|s| (s - 0.3).abs() < 1e-6));
        assert_eq!(tap.sample_rate(), 48_000);
    }

    #[test]
    fn test_blocks_span_callback_boundaries() {
        let (mut enc, gate, mut rx) = encoder(16_000, 8);
        gate.open();
        let ramp: Vec<f32> = (0..256u16).map(|i| f32::from(i) / 1000.0).collect();
        for piece in ramp.chunks(100) {
            enc.push(piece);
        }

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        // gain 3 applied to consecutive samples, nothing lost at the seams
        assert!((first.samples[127] - 0.381).abs() < 1e-5);
        assert!((second.samples[0] - 0.384).abs() < 1e-5);
        assert!((second.samples[127] - 0.765).abs() < 1e-5);
    }
}
