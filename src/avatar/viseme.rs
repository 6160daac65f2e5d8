//! Spectral viseme synthesis
//!
//! Each animation frame reads one spectrum snapshot, reduces four frequency
//! bands to mouth-shape targets, resolves which shape dominates, and eases
//! the rendered channels toward those targets.
//!
//! Bands are given as bin ranges of a 2048-point analysis at 24 kHz and are
//! rescaled to whatever rate and resolution a snapshot was taken at, so a
//! 48 kHz microphone tap lands in the same frequency ranges as the voice.

use std::ops::{Range, RangeInclusive};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::voice::SpectrumSnapshot;
use crate::voice::spectrum::REFERENCE_SAMPLE_RATE;

/// Bin count the band ranges are expressed in
const REFERENCE_BINS: u64 = 1024;

/// Bass and fundamental; drives pucker
pub const LOW_BAND: RangeInclusive<usize> = 4..=13;
/// First vocal formant; drives jaw-open
pub const LOW_MID_BAND: RangeInclusive<usize> = 14..=39;
/// Second formant and consonants; drives smile
pub const HIGH_MID_BAND: RangeInclusive<usize> = 70..=139;
/// Sibilants
pub const HIGH_BAND: RangeInclusive<usize> = 180..=249;

const NOISE_GATE: f32 = 0.1;
const GAMMA: f32 = 2.5;
const MAX_TRAVEL: f32 = 0.6;
const HIGH_MID_BOOST: f32 = 1.3;
const LOW_BOOST: f32 = 1.2;

const SPREAD_THRESHOLD: f32 = 0.2;
const SPREAD_TAKEOVER: f32 = 0.5;
const PUCKER_THRESHOLD: f32 = 0.2;
const PUCKER_MAX_SPREAD: f32 = 0.3;
const SUPPRESSED_JAW: f32 = 0.3;
const ROUNDED_FROM_PUCKER: f32 = 0.7;

const OPEN_RATE: f32 = 90.0;
const CLOSE_RATE: f32 = 100.0;
const BLINK_CHANCE: f64 = 0.005;
const BLINK_RECOVERY_RATE: f32 = 10.0;

/// Distance below which a channel snaps onto its target
const SETTLE_EPSILON: f32 = 1e-4;

/// Mouth-shape and eyelid intensities, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VisemeState {
    pub jaw_open: f32,
    pub smile: f32,
    pub pucker: f32,
    pub rounded: f32,
    pub sibilant: f32,
    pub eyes_closed: f32,
}

impl VisemeState {
    /// Channel values under their conventional morph-target names
    #[must_use]
    pub const fn morph_targets(&self) -> [(&'static str, f32); 6] {
        [
            ("viseme_aa", self.jaw_open),
            ("viseme_E", self.smile),
            ("viseme_U", self.pucker),
            ("viseme_O", self.rounded),
            ("viseme_SS", self.sibilant),
            ("eyesClosed", self.eyes_closed),
        ]
    }

    fn mouth_mut(&mut self) -> [&mut f32; 5] {
        [
            &mut self.jaw_open,
            &mut self.smile,
            &mut self.pucker,
            &mut self.rounded,
            &mut self.sibilant,
        ]
    }

    const fn mouth(&self) -> [f32; 5] {
        [self.jaw_open, self.smile, self.pucker, self.rounded, self.sibilant]
    }
}

/// Bins of `snapshot` covering the same frequencies as reference `band`
#[allow(clippy::cast_possible_truncation)]
fn scaled_band(snapshot: &SpectrumSnapshot, band: &RangeInclusive<usize>) -> Range<usize> {
    let rate = u64::from(snapshot.sample_rate());
    if rate == 0 {
        return 0..0;
    }
    // bin * (reference Hz per bin) / (snapshot Hz per bin), rounded
    let num = u64::from(REFERENCE_SAMPLE_RATE) * snapshot.len() as u64;
    let den = rate * REFERENCE_BINS;
    let scale = |bin: usize| ((2 * bin as u64 * num + den) / (2 * den)) as usize;

    let start = scale(*band.start());
    let end = scale(*band.end() + 1).max(start);
    start..end
}

/// Mean energy of a band, normalized to 0..1
///
/// Bins past the end of the snapshot are ignored.
#[allow(clippy::cast_precision_loss)]
fn band_energy(snapshot: &SpectrumSnapshot, band: &RangeInclusive<usize>) -> f32 {
    let bins = snapshot.bins();
    let range = scaled_band(snapshot, band);
    let end = range.end.min(bins.len());
    let Some(slice) = bins.get(range.start..end) else {
        return 0.0;
    };
    if slice.is_empty() {
        return 0.0;
    }
    let sum: u32 = slice.iter().map(|&b| u32::from(b)).sum();
    sum as f32 / slice.len() as f32 / 255.0
}

/// Noise gate then gamma curve
fn shape(energy: f32) -> f32 {
    if energy < NOISE_GATE {
        0.0
    } else {
        energy.powf(GAMMA)
    }
}

/// Per-frame targets for the mouth channels
///
/// Pure function of one snapshot; nothing carries over between frames.
#[must_use]
pub fn mouth_targets(snapshot: &SpectrumSnapshot) -> VisemeState {
    let low = (shape(band_energy(snapshot, &LOW_BAND)) * LOW_BOOST).min(MAX_TRAVEL);
    let low_mid = shape(band_energy(snapshot, &LOW_MID_BAND)).min(MAX_TRAVEL);
    let high_mid = (shape(band_energy(snapshot, &HIGH_MID_BAND)) * HIGH_MID_BOOST).min(MAX_TRAVEL);
    let high = shape(band_energy(snapshot, &HIGH_BAND)).min(MAX_TRAVEL);

    let mut jaw_open = low_mid;
    let mut smile = high_mid;

    if high_mid > SPREAD_THRESHOLD {
        jaw_open *= SUPPRESSED_JAW;
    }
    if high_mid > SPREAD_TAKEOVER {
        jaw_open = 0.0;
    }
    if low > PUCKER_THRESHOLD && high_mid < PUCKER_MAX_SPREAD {
        jaw_open *= SUPPRESSED_JAW;
        smile = 0.0;
    }

    VisemeState {
        jaw_open,
        smile,
        pucker: low,
        rounded: low * ROUNDED_FROM_PUCKER,
        sibilant: high,
        eyes_closed: 0.0,
    }
}

/// Frame-rate independent exponential approach of `current` to `target`
#[must_use]
pub fn damp(current: f32, target: f32, lambda: f32, dt: f32) -> f32 {
    (target - current).mul_add(1.0 - (-lambda * dt).exp(), current)
}

/// Stateful synthesizer owning the rendered viseme channels
pub struct VisemeSynthesizer<R = StdRng> {
    state: VisemeState,
    rng: R,
}

impl VisemeSynthesizer<StdRng> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for VisemeSynthesizer<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> VisemeSynthesizer<R> {
    /// Use a specific random source for blinks
    pub const fn with_rng(rng: R) -> Self {
        Self {
            state: VisemeState {
                jaw_open: 0.0,
                smile: 0.0,
                pucker: 0.0,
                rounded: 0.0,
                sibilant: 0.0,
                eyes_closed: 0.0,
            },
            rng,
        }
    }

    /// Current rendered values
    #[must_use]
    pub const fn state(&self) -> VisemeState {
        self.state
    }

    /// Advance one animation frame of `dt` seconds
    pub fn step(&mut self, snapshot: &SpectrumSnapshot, dt: f32) -> VisemeState {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        let targets = mouth_targets(snapshot);

        for (current, target) in self.state.mouth_mut().into_iter().zip(targets.mouth()) {
            let rate = if target > *current { OPEN_RATE } else { CLOSE_RATE };
            let next = damp(*current, target, rate, dt);
            *current = if (next - target).abs() < SETTLE_EPSILON {
                target
            } else {
                next
            };
        }

        self.state.eyes_closed = if self.rng.gen_bool(BLINK_CHANCE) {
            1.0
        } else {
            let next = damp(self.state.eyes_closed, 0.0, BLINK_RECOVERY_RATE, dt);
            if next < SETTLE_EPSILON { 0.0 } else { next }
        };

        self.state
    }
}
