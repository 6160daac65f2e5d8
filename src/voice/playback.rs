//! Audio playback to speakers
//!
//! Incoming chunks are laid back to back on a sample clock owned by the
//! output callback, so consecutive chunks play without gaps. When the cursor
//! falls behind the clock (an underrun) it is pushed a small lookahead into
//! the future rather than scheduling into the past.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use super::FaultSender;
use super::pcm::AudioFrame;
use super::spectrum::{DEFAULT_FFT_SIZE, SpectrumFeed};
use crate::config::PlaybackSettings;
use crate::{Error, Result};

/// Where a chunk landed on the playback timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    /// First sample, in output-clock samples
    pub start: u64,
    /// Length in samples
    pub len: u64,
}

impl ScheduledSlot {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }
}

struct ScheduledChunk {
    start: u64,
    samples: Vec<f32>,
}

/// Gapless chunk scheduler driven by an output sample clock
///
/// Time is counted in samples at the playback rate. `render` advances the
/// clock; `enqueue` places chunks on the timeline.
pub struct PlaybackScheduler {
    sample_rate: u32,
    lookahead: u64,
    clock: u64,
    next_start: Option<u64>,
    scheduled: VecDeque<ScheduledChunk>,
}

impl PlaybackScheduler {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(sample_rate: u32, lookahead: Duration) -> Self {
        let lookahead = (lookahead.as_secs_f64() * f64::from(sample_rate)).round() as u64;
        Self {
            sample_rate,
            lookahead,
            clock: 0,
            next_start: None,
            scheduled: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current position of the output clock
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.clock
    }

    /// Start time the next chunk will get, if the cursor is still ahead
    #[must_use]
    pub const fn next_start(&self) -> Option<u64> {
        self.next_start
    }

    /// Samples scheduled but not yet rendered
    #[must_use]
    pub fn pending_samples(&self) -> u64 {
        self.next_start.map_or(0, |next| next.saturating_sub(self.clock))
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Place a chunk on the timeline
    ///
    /// Returns `None` for an empty chunk, which is ignored.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Option<ScheduledSlot> {
        if samples.is_empty() {
            return None;
        }

        let start = match self.next_start {
            Some(next) if next >= self.clock => next,
            _ => self.clock + self.lookahead,
        };
        let len = samples.len() as u64;

        self.next_start = Some(start + len);
        self.scheduled.push_back(ScheduledChunk { start, samples });

        Some(ScheduledSlot { start, len })
    }

    /// Fill `out` with the samples due at the current clock and advance it
    ///
    /// Positions with nothing scheduled are silence.
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let window_start = self.clock;
        let window_end = window_start + out.len() as u64;

        for chunk in &self.scheduled {
            if chunk.start >= window_end {
                break;
            }
            let chunk_end = chunk.start + chunk.samples.len() as u64;
            let from = chunk.start.max(window_start);
            let to = chunk_end.min(window_end);
            if from >= to {
                continue;
            }

            let src = (from - chunk.start) as usize;
            let dst = (from - window_start) as usize;
            let n = (to - from) as usize;
            out[dst..dst + n].copy_from_slice(&chunk.samples[src..src + n]);
        }

        self.clock = window_end;
        while self
            .scheduled
            .front()
            .is_some_and(|c| c.start + c.samples.len() as u64 <= self.clock)
        {
            self.scheduled.pop_front();
        }
    }

    /// Drop everything scheduled and forget the cursor
    pub fn clear(&mut self) {
        self.scheduled.clear();
        self.next_start = None;
    }
}

/// Cloneable handle for feeding decoded frames into a running output
#[derive(Clone)]
pub struct PlaybackQueue {
    scheduler: Arc<Mutex<PlaybackScheduler>>,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new(scheduler: PlaybackScheduler) -> Self {
        Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackScheduler> {
        self.scheduler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Schedule a frame, converting its rate to the output rate if needed
    ///
    /// # Errors
    ///
    /// Returns error if the frame's rate cannot be converted
    pub fn enqueue(&self, frame: AudioFrame) -> Result<Option<ScheduledSlot>> {
        let output_rate = self.lock().sample_rate();
        let samples = if frame.sample_rate == output_rate || frame.sample_rate == 0 {
            frame.samples
        } else {
            resample(&frame.samples, frame.sample_rate, output_rate)?
        };

        Ok(self.lock().enqueue(samples))
    }

    pub fn render(&self, out: &mut [f32]) {
        self.lock().render(out);
    }

    #[must_use]
    pub fn pending(&self) -> Duration {
        let scheduler = self.lock();
        samples_to_duration(scheduler.pending_samples(), scheduler.sample_rate())
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn samples_to_duration(samples: u64, rate: u32) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples.saturating_mul(1_000_000_000) / u64::from(rate))
}

/// Convert a chunk between sample rates
///
/// The resampler's warm-up delay is trimmed so the output lines up with the
/// input.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    const CHUNK_SIZE: usize = 1024;

    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_SIZE, 2, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected = (samples.len() as f64 * f64::from(to) / f64::from(from)).round() as usize;
    let mut output = Vec::with_capacity(expected + resampler.output_delay());

    for chunk in samples.chunks(CHUNK_SIZE) {
        let result = if chunk.len() == CHUNK_SIZE {
            resampler.process(&[chunk], None)
        } else {
            resampler.process_partial(Some(&[chunk]), None)
        }
        .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
    output.extend_from_slice(&tail[0]);

    let delay = resampler.output_delay().min(output.len());
    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}

/// Plays scheduled audio on the default output device
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
    queue: PlaybackQueue,
    spectrum: SpectrumFeed,
    stream: Option<Stream>,
}

impl AudioPlayback {
    /// Open the default output device at the configured rate
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(settings: &PlaybackSettings) -> Result<Self> {
        let host = cpal::default_host();
        let rate = SampleRate(settings.sample_rate);

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = settings.sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        let scheduler = PlaybackScheduler::new(settings.sample_rate, settings.lookahead);
        Ok(Self {
            device,
            config,
            queue: PlaybackQueue::new(scheduler),
            spectrum: SpectrumFeed::new(DEFAULT_FFT_SIZE, settings.sample_rate),
            stream: None,
        })
    }

    /// Handle for scheduling decoded audio
    #[must_use]
    pub fn queue(&self) -> PlaybackQueue {
        self.queue.clone()
    }

    /// Tap on what is actually being played
    ///
    /// The output callback only records samples; whoever drives the
    /// animation analyses the feed once per frame.
    #[must_use]
    pub fn spectrum(&self) -> SpectrumFeed {
        self.spectrum.clone()
    }

    /// Normalized average output energy as of the last analysed frame
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.spectrum.volume()
    }

    /// Start the output stream
    ///
    /// Stream errors (device unplugged) are reported on `faults`.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self, faults: FaultSender) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels.max(1));
        let queue = self.queue.clone();
        let tap = self.spectrum.tap().clone();
        // grows to the device's largest callback once, then is reused
        let mut mono: Vec<f32> = Vec::with_capacity(4096);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mono.resize(data.len() / channels, 0.0);
                    queue.render(&mut mono);

                    for (frame, sample) in data.chunks_mut(channels).zip(&mono) {
                        frame.fill(*sample);
                    }
                    tap.write(&mono);
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    let _ = faults.send(Error::Audio(format!("output device: {err}")));
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio playback started");
        Ok(())
    }

    /// Stop the output stream and drop anything still scheduled
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio playback stopped");
        }
        self.queue.clear();
        self.spectrum.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> PlaybackScheduler {
        // 50 ms at 24 kHz = 1200 samples
        PlaybackScheduler::new(24_000, Duration::from_millis(50))
    }

    #[test]
    fn test_first_chunk_starts_after_lookahead() {
        let mut s = scheduler();
        let slot = s.enqueue(vec![0.5; 480]).unwrap();
        assert_eq!(slot.start, 1200);
        assert_eq!(s.next_start(), Some(1680));
    }

    #[test]
    fn test_chunks_are_back_to_back() {
        let mut s = scheduler();
        let a = s.enqueue(vec![0.1; 480]).unwrap();
        let b = s.enqueue(vec![0.2; 240]).unwrap();
        let c = s.enqueue(vec![0.3; 100]).unwrap();
        assert_eq!(b.start, a.end());
        assert_eq!(c.start, b.end());
    }

    #[test]
    fn test_underrun_resets_cursor_with_lookahead() {
        let mut s = scheduler();
        s.enqueue(vec![0.1; 240]);

        // play well past the end of the scheduled audio
        let mut out = vec![0.0; 4000];
        s.render(&mut out);
        assert_eq!(s.now(), 4000);

        let slot = s.enqueue(vec![0.1; 240]).unwrap();
        assert_eq!(slot.start, 4000 + 1200);
    }

    #[test]
    fn test_start_is_never_in_the_past() {
        let mut s = scheduler();
        let mut out = vec![0.0; 333];
        for _ in 0..5 {
            s.render(&mut out);
            let now = s.now();
            let slot = s.enqueue(vec![0.0; 100]).unwrap();
            assert!(slot.start >= now);
        }
    }

    #[test]
    fn test_render_plays_samples_in_order() {
        let mut s = PlaybackScheduler::new(24_000, Duration::ZERO);
        s.enqueue(vec![1.0, 2.0]);
        s.enqueue(vec![3.0]);

        let mut out = vec![0.0; 5];
        s.render(&mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 0.0, 0.0]);
        assert!(s.is_idle());
    }

    #[test]
    fn test_render_splits_chunks_across_callbacks() {
        let mut s = PlaybackScheduler::new(24_000, Duration::ZERO);
        s.enqueue(vec![1.0, 2.0, 3.0, 4.0]);

        let mut out = vec![0.0; 3];
        s.render(&mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
        s.render(&mut out);
        assert_eq!(out, vec![4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut s = scheduler();
        assert!(s.enqueue(Vec::new()).is_none());
        assert!(s.next_start().is_none());
    }

    #[test]
    fn test_queue_pending_and_clear() {
        let queue = PlaybackQueue::new(scheduler());
        queue.enqueue(AudioFrame::new(vec![0.0; 2400], 24_000)).unwrap();
        // 50 ms lookahead plus 100 ms of audio
        assert_eq!(queue.pending(), Duration::from_millis(150));

        queue.clear();
        assert!(queue.is_idle());
        assert_eq!(queue.pending(), Duration::ZERO);
    }

    #[test]
    fn test_queue_adapts_sample_rate() {
        let queue = PlaybackQueue::new(PlaybackScheduler::new(24_000, Duration::ZERO));
        let slot = queue
            .enqueue(AudioFrame::new(vec![0.1; 4800], 48_000))
            .unwrap()
            .unwrap();
        assert!(slot.len > 2300 && slot.len <= 2400, "len {}", slot.len);
    }
}
