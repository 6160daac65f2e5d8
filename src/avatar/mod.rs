//! Talking-head animation driven by live audio
//!
//! ```text
//! output tap ──analyse─┐
//!                      ├─▶ LipSyncSource ─▶ VisemeSynthesizer ─┐
//! capture tap ─analyse─┘                                       ├─▶ AvatarFrame (watch)
//!                                  idle_pose(t) ───────────────┘
//! ```
//!
//! Both taps are analysed once per frame, so spectral smoothing runs at the
//! animation rate whatever block size the audio devices use.

mod pose;
pub mod viseme;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use pose::{HeadPose, idle_pose};
pub use viseme::{VisemeState, VisemeSynthesizer};

use crate::voice::spectrum::DEFAULT_FFT_SIZE;
use crate::voice::{SpectrumAnalyser, SpectrumFeed, SpectrumSnapshot, VolumeMeter};
use crate::{Error, Result};

/// Output energy above which `Auto` considers the voice to be speaking
const SPEAKING_THRESHOLD: f32 = 0.02;

/// Which audio drives the mouth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LipSyncSource {
    /// The synthesized voice
    #[default]
    Output,
    /// The user's microphone
    Capture,
    /// The voice while it is audible, otherwise the microphone
    Auto,
}

impl LipSyncSource {
    /// Whether a capture spectrum tap is needed
    #[must_use]
    pub const fn uses_capture(self) -> bool {
        matches!(self, Self::Capture | Self::Auto)
    }
}

impl FromStr for LipSyncSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "output" | "voice" => Ok(Self::Output),
            "capture" | "mic" | "microphone" => Ok(Self::Capture),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Config(format!("unknown lip-sync source: {other}"))),
        }
    }
}

/// One rendered animation frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AvatarFrame {
    /// Seconds since the driver started
    pub elapsed_secs: f32,
    pub visemes: VisemeState,
    pub pose: HeadPose,
    /// Microphone loudness in 0..1
    pub input_volume: f32,
    /// Playback energy in 0..1
    pub output_volume: f32,
}

/// Live audio taps and readouts the animation polls each frame
#[derive(Debug, Clone)]
pub struct AvatarInputs {
    pub output: SpectrumFeed,
    pub capture: Option<SpectrumFeed>,
    pub input_volume: VolumeMeter,
}

/// Pick the spectrum that drives the mouth this frame
fn select(
    source: LipSyncSource,
    output: Arc<SpectrumSnapshot>,
    capture: Option<Arc<SpectrumSnapshot>>,
) -> Arc<SpectrumSnapshot> {
    match (source, capture) {
        (LipSyncSource::Capture, Some(capture)) => capture,
        (LipSyncSource::Auto, Some(capture)) if output.average_energy() <= SPEAKING_THRESHOLD => {
            capture
        }
        _ => output,
    }
}

/// Drives the synthesizer at the animation rate
pub struct AvatarDriver {
    synth: VisemeSynthesizer,
    inputs: AvatarInputs,
    output_analyser: SpectrumAnalyser,
    capture_analyser: Option<SpectrumAnalyser>,
    source: LipSyncSource,
    fps: u32,
}

impl AvatarDriver {
    #[must_use]
    pub fn new(inputs: AvatarInputs, source: LipSyncSource, fps: u32) -> Self {
        let capture_analyser = inputs
            .capture
            .as_ref()
            .map(|_| SpectrumAnalyser::new(DEFAULT_FFT_SIZE));
        Self {
            synth: VisemeSynthesizer::new(),
            inputs,
            output_analyser: SpectrumAnalyser::new(DEFAULT_FFT_SIZE),
            capture_analyser,
            source,
            fps: fps.max(1),
        }
    }

    /// Replace the synthesizer, e.g. with a seeded one
    #[must_use]
    pub fn with_synthesizer(mut self, synth: VisemeSynthesizer) -> Self {
        self.synth = synth;
        self
    }

    /// Analyse the taps and compute one frame
    pub fn frame(&mut self, elapsed_secs: f32, dt: f32) -> AvatarFrame {
        let output = self.output_analyser.refresh(&self.inputs.output);
        let capture = match (&mut self.capture_analyser, &self.inputs.capture) {
            (Some(analyser), Some(feed)) => Some(analyser.refresh(feed)),
            _ => None,
        };
        let output_volume = output.average_energy();
        let snapshot = select(self.source, output, capture);

        AvatarFrame {
            elapsed_secs,
            visemes: self.synth.step(&snapshot, dt),
            pose: idle_pose(elapsed_secs),
            input_volume: self.inputs.input_volume.get(),
            output_volume,
        }
    }

    /// Run on a tokio interval, publishing every frame
    ///
    /// The task ends once every receiver is dropped.
    #[must_use]
    pub fn spawn(mut self) -> (watch::Receiver<AvatarFrame>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(AvatarFrame::default());
        let period = Duration::from_secs(1) / self.fps;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let started = Instant::now();
            let mut last = started;

            loop {
                let now = interval.tick().await;
                let dt = now.duration_since(last).as_secs_f32();
                last = now;

                let frame = self.frame(now.duration_since(started).as_secs_f32(), dt);
                if tx.send(frame).is_err() {
                    tracing::debug!("animation stopped, no viewers");
                    break;
                }
            }
        });

        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn band_snapshot(band: std::ops::RangeInclusive<usize>) -> Arc<SpectrumSnapshot> {
        let mut bins = vec![0u8; 1024];
        for b in &mut bins[band] {
            *b = 255;
        }
        Arc::new(SpectrumSnapshot::new(bins))
    }

    /// One analysis window of a steady tone
    #[allow(clippy::cast_precision_loss)]
    fn tone(freq: f32, rate: u32) -> Vec<f32> {
        (0..DEFAULT_FFT_SIZE)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn driver(source: LipSyncSource) -> (AvatarDriver, AvatarInputs) {
        let inputs = AvatarInputs {
            output: SpectrumFeed::new(DEFAULT_FFT_SIZE, 24_000),
            capture: Some(SpectrumFeed::new(DEFAULT_FFT_SIZE, 48_000)),
            input_volume: VolumeMeter::new(),
        };
        let synth = VisemeSynthesizer::with_rng(StdRng::seed_from_u64(1));
        (
            AvatarDriver::new(inputs.clone(), source, 60).with_synthesizer(synth),
            inputs,
        )
    }

    fn speak_into(feed: Option<&SpectrumFeed>, freq: f32) {
        let feed = feed.unwrap();
        feed.tap().write(&tone(freq, feed.tap().sample_rate()));
    }

    #[test]
    fn test_parse_lip_sync_source() {
        assert_eq!("output".parse::<LipSyncSource>().unwrap(), LipSyncSource::Output);
        assert_eq!("Capture".parse::<LipSyncSource>().unwrap(), LipSyncSource::Capture);
        assert_eq!(" auto ".parse::<LipSyncSource>().unwrap(), LipSyncSource::Auto);
        assert!("speaker".parse::<LipSyncSource>().is_err());
    }

    #[test]
    fn test_select() {
        let voice = band_snapshot(viseme::HIGH_MID_BAND);
        let mic = band_snapshot(viseme::LOW_MID_BAND);
        let quiet = Arc::new(SpectrumSnapshot::silent(1024));

        let picked = select(LipSyncSource::Output, Arc::clone(&quiet), Some(Arc::clone(&mic)));
        assert!(Arc::ptr_eq(&picked, &quiet));
        let picked = select(LipSyncSource::Capture, Arc::clone(&voice), Some(Arc::clone(&mic)));
        assert!(Arc::ptr_eq(&picked, &mic));
        let picked = select(LipSyncSource::Capture, Arc::clone(&voice), None);
        assert!(Arc::ptr_eq(&picked, &voice));

        let picked = select(LipSyncSource::Auto, Arc::clone(&quiet), Some(Arc::clone(&mic)));
        assert!(Arc::ptr_eq(&picked, &mic));
        let picked = select(LipSyncSource::Auto, Arc::clone(&voice), Some(Arc::clone(&mic)));
        assert!(Arc::ptr_eq(&picked, &voice));
    }

    #[test]
    fn test_output_source_ignores_microphone() {
        let (mut driver, inputs) = driver(LipSyncSource::Output);
        speak_into(inputs.capture.as_ref(), 300.0);
        let frame = driver.frame(0.1, 0.1);
        assert!(frame.visemes.jaw_open.abs() < f32::EPSILON);
        assert!(frame.output_volume.abs() < f32::EPSILON);
    }

    #[test]
    fn test_capture_source_follows_microphone() {
        let (mut driver, inputs) = driver(LipSyncSource::Capture);
        speak_into(inputs.capture.as_ref(), 300.0);
        inputs.input_volume.set(0.7);

        let mut frame = driver.frame(0.0, 0.0);
        for i in 1..=10u8 {
            frame = driver.frame(f32::from(i) / 60.0, 1.0 / 60.0);
        }
        assert!(frame.visemes.jaw_open > 0.0);
        assert!((frame.input_volume - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_auto_prefers_audible_output() {
        let (mut driver, inputs) = driver(LipSyncSource::Auto);
        speak_into(inputs.capture.as_ref(), 300.0);
        // silent output: falls back to the microphone
        let mut frame = driver.frame(0.0, 0.0);
        for i in 1..=10u8 {
            frame = driver.frame(f32::from(i) / 60.0, 1.0 / 60.0);
        }
        assert!(frame.visemes.jaw_open > 0.0);
        assert!(frame.visemes.smile.abs() < f32::EPSILON);

        // broadband voice on the output takes over once audible
        let mut rng = StdRng::seed_from_u64(3);
        let voice: Vec<f32> = (0..DEFAULT_FFT_SIZE).map(|_| rng.gen_range(-0.9..0.9)).collect();
        inputs.output.tap().write(&voice);
        for i in 11..=40u8 {
            frame = driver.frame(f32::from(i) / 60.0, 1.0 / 60.0);
        }
        assert!(frame.output_volume > SPEAKING_THRESHOLD);
        assert!(frame.visemes.smile > frame.visemes.jaw_open);
        assert!((inputs.output.volume() - frame.output_volume).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_spawned_driver_publishes_frames() {
        let (driver, _inputs) = driver(LipSyncSource::Output);
        let (mut rx, handle) = driver.spawn();

        rx.changed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().elapsed_secs > 0.0);

        drop(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
