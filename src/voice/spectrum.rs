//! Frequency analysis of a live audio path
//!
//! [`SpectrumAnalyser`] follows the byte-spectrum semantics of a Web Audio
//! `AnalyserNode`: Blackman window, time smoothing, then a decibel range
//! mapped onto 0..=255.
//!
//! The work is split across threads. Audio callbacks only copy samples into
//! a preallocated [`SampleTap`]; the animation loop runs the analyser once
//! per frame and publishes the result into a [`SnapshotCell`] that any
//! number of readers can poll. Smoothing therefore advances per rendered
//! frame regardless of the device block size.
//!
//! ```text
//! audio callback ──write──▶ SampleTap ──analyse (per frame)──▶ SnapshotCell ──▶ readers
//! ```

use std::sync::{Arc, Mutex, RwLock};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Default FFT size (1024 bins)
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Rate a snapshot is assumed to come from when none is given
pub const REFERENCE_SAMPLE_RATE: u32 = 24_000;

const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Per-bin energy magnitudes on a 0..=255 scale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumSnapshot {
    bins: Vec<u8>,
    sample_rate: u32,
}

impl SpectrumSnapshot {
    /// Snapshot of audio at [`REFERENCE_SAMPLE_RATE`]
    #[must_use]
    pub const fn new(bins: Vec<u8>) -> Self {
        Self::at_rate(bins, REFERENCE_SAMPLE_RATE)
    }

    /// Snapshot of audio sampled at `sample_rate`
    #[must_use]
    pub const fn at_rate(bins: Vec<u8>, sample_rate: u32) -> Self {
        Self { bins, sample_rate }
    }

    /// All-zero snapshot with `len` bins
    #[must_use]
    pub fn silent(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    #[must_use]
    pub fn bins(&self) -> &[u8] {
        &self.bins
    }

    /// Rate of the audio the bins were computed from
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Width of one bin in Hz
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bin_hz(&self) -> f32 {
        if self.bins.is_empty() {
            return 0.0;
        }
        self.sample_rate as f32 / (2 * self.bins.len()) as f32
    }

    /// Mean energy across all bins, normalized to 0..1
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_energy(&self) -> f32 {
        if self.bins.is_empty() {
            return 0.0;
        }
        let sum: u32 = self.bins.iter().map(|&b| u32::from(b)).sum();
        sum as f32 / self.bins.len() as f32 / 255.0
    }
}

/// Single-writer, multi-reader cell holding the latest complete snapshot
///
/// Readers always get a whole snapshot. The writer never waits: if a reader
/// holds the lock at publish time the update is skipped and the next frame
/// publishes instead.
#[derive(Debug, Clone)]
pub struct SnapshotCell {
    inner: Arc<RwLock<Arc<SpectrumSnapshot>>>,
}

impl SnapshotCell {
    #[must_use]
    pub fn new(bin_count: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(SpectrumSnapshot::silent(bin_count)))),
        }
    }

    /// Publish a snapshot; returns false if it was skipped due to contention
    pub fn publish(&self, snapshot: impl Into<Arc<SpectrumSnapshot>>) -> bool {
        match self.inner.try_write() {
            Ok(mut slot) => {
                *slot = snapshot.into();
                true
            }
            Err(_) => false,
        }
    }

    /// Latest published snapshot
    #[must_use]
    pub fn latest(&self) -> Arc<SpectrumSnapshot> {
        self.inner
            .read()
            .map_or_else(|poisoned| Arc::clone(&poisoned.into_inner()), |s| Arc::clone(&s))
    }

    /// Normalized average energy of the latest snapshot
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.latest().average_energy()
    }

    /// Reset to silence
    pub fn clear(&self) {
        let len = self.latest().len();
        if let Ok(mut slot) = self.inner.write() {
            *slot = Arc::new(SpectrumSnapshot::silent(len));
        }
    }
}

struct TapRing {
    samples: Vec<f32>,
    write_pos: usize,
}

/// Fixed-size ring of the most recent samples on an audio path
///
/// Written from real-time callbacks: [`SampleTap::write`] never blocks and
/// never allocates. When the reader holds the lock the block is skipped,
/// which only costs the analyser a little history.
#[derive(Clone)]
pub struct SampleTap {
    ring: Arc<Mutex<TapRing>>,
    sample_rate: u32,
}

impl std::fmt::Debug for SampleTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleTap")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl SampleTap {
    /// Ring holding `capacity` samples of audio at `sample_rate`
    #[must_use]
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            ring: Arc::new(Mutex::new(TapRing {
                samples: vec![0.0; capacity.max(1)],
                write_pos: 0,
            })),
            sample_rate,
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append samples; returns false if the block was skipped
    pub fn write(&self, samples: &[f32]) -> bool {
        let Ok(mut ring) = self.ring.try_lock() else {
            return false;
        };
        let TapRing { samples: buf, write_pos } = &mut *ring;
        let len = buf.len();
        // only the tail can survive in the ring
        let samples = &samples[samples.len().saturating_sub(len)..];
        for &s in samples {
            buf[*write_pos] = s;
            *write_pos = (*write_pos + 1) % len;
        }
        true
    }

    /// Copy the most recent samples into `out`, oldest first
    ///
    /// If `out` is longer than the ring the front is zero-filled.
    pub fn copy_latest(&self, out: &mut [f32]) {
        let ring = self
            .ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let len = ring.samples.len();
        let take = out.len().min(len);
        let pad = out.len() - take;
        out[..pad].fill(0.0);
        let start = (ring.write_pos + len - take) % len;
        for (i, slot) in out[pad..].iter_mut().enumerate() {
            *slot = ring.samples[(start + i) % len];
        }
    }

    /// Forget all history
    pub fn clear(&self) {
        let mut ring = self
            .ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.samples.fill(0.0);
        ring.write_pos = 0;
    }
}

/// A tapped audio path: raw samples in, published snapshots out
#[derive(Debug, Clone)]
pub struct SpectrumFeed {
    tap: SampleTap,
    cell: SnapshotCell,
}

impl SpectrumFeed {
    /// Feed sized for `fft_size`-point analysis of audio at `sample_rate`
    #[must_use]
    pub fn new(fft_size: usize, sample_rate: u32) -> Self {
        Self {
            tap: SampleTap::new(fft_size, sample_rate),
            cell: SnapshotCell::new(fft_size / 2),
        }
    }

    /// Writer side, for the audio callback
    #[must_use]
    pub const fn tap(&self) -> &SampleTap {
        &self.tap
    }

    /// Reader side
    #[must_use]
    pub const fn cell(&self) -> &SnapshotCell {
        &self.cell
    }

    /// Normalized average energy of the latest analysed frame
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.cell.volume()
    }

    /// Reset both the sample history and the published snapshot
    pub fn clear(&self) {
        self.tap.clear();
        self.cell.clear();
    }
}

/// Byte-spectrum analyser; each call to [`SpectrumAnalyser::analyse`] is one
/// smoothing step
pub struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    frame: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    /// Create an analyser with the given FFT size (rounded up to a power of two)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                0.08f32.mul_add(
                    (4.0 * std::f32::consts::PI * x).cos(),
                    0.5f32.mul_add(-(2.0 * std::f32::consts::PI * x).cos(), 0.42),
                )
            })
            .collect();

        Self {
            fft,
            fft_size,
            window,
            frame: vec![0.0; fft_size],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    /// Number of frequency bins per snapshot
    #[must_use]
    pub const fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Analyse the last `fft_size` samples of `samples`
    ///
    /// Shorter input is treated as preceded by silence.
    #[must_use]
    pub fn analyse(&mut self, samples: &[f32], sample_rate: u32) -> SpectrumSnapshot {
        let take = samples.len().min(self.fft_size);
        let pad = self.fft_size - take;
        self.frame[..pad].fill(0.0);
        self.frame[pad..].copy_from_slice(&samples[samples.len() - take..]);
        self.transform(sample_rate)
    }

    /// Analyse the current contents of `feed` and publish the result
    pub fn refresh(&mut self, feed: &SpectrumFeed) -> Arc<SpectrumSnapshot> {
        feed.tap.copy_latest(&mut self.frame);
        let snapshot = Arc::new(self.transform(feed.tap.sample_rate()));
        feed.cell.publish(Arc::clone(&snapshot));
        snapshot
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn transform(&mut self, sample_rate: u32) -> SpectrumSnapshot {
        for ((slot, &sample), &w) in self.scratch.iter_mut().zip(&self.frame).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let bins = self
            .smoothed
            .iter_mut()
            .zip(&self.scratch)
            .map(|(smoothed, c)| {
                let magnitude = c.norm() * scale;
                *smoothed = SMOOTHING_TIME_CONSTANT
                    .mul_add(*smoothed, (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude);
                if *smoothed <= 0.0 {
                    return 0;
                }
                let db = 20.0 * smoothed.log10();
                (255.0 / range * (db - MIN_DECIBELS)).floor().clamp(0.0, 255.0) as u8
            })
            .collect();

        SpectrumSnapshot::at_rate(bins, sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    fn peak(snapshot: &SpectrumSnapshot) -> (usize, u8) {
        snapshot
            .bins()
            .iter()
            .copied()
            .enumerate()
            .max_by_key(|(_, b)| *b)
            .unwrap()
    }

    #[test]
    fn test_silence_is_all_zero() {
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        let snapshot = analyser.analyse(&vec![0.0; DEFAULT_FFT_SIZE], 24_000);
        assert_eq!(snapshot.len(), 1024);
        assert!(snapshot.bins().iter().all(|&b| b == 0));
        assert!(snapshot.average_energy().abs() < f32::EPSILON);
    }

    #[test]
    fn test_tone_peaks_in_expected_bin() {
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        // 24 kHz / 2048 = 11.72 Hz per bin; 1500 Hz lands in bin 128
        let tone = sine(1500.0, 24_000.0, DEFAULT_FFT_SIZE, 0.8);
        let mut snapshot = SpectrumSnapshot::silent(0);
        for _ in 0..20 {
            snapshot = analyser.analyse(&tone, 24_000);
        }

        let (bin, level) = peak(&snapshot);
        assert!((127..=129).contains(&bin), "peak at bin {bin}");
        assert!(level > 200);
        assert!(snapshot.bins()[900] < level);
        assert_eq!(snapshot.sample_rate(), 24_000);
    }

    #[test]
    fn test_smoothing_advances_once_per_analysis() {
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        let feed = SpectrumFeed::new(DEFAULT_FFT_SIZE, 24_000);

        // quiet enough that the peak stays below the 255 ceiling
        let tone = sine(1500.0, 24_000.0, DEFAULT_FFT_SIZE, 0.05);
        feed.tap().write(&tone);
        let mut steady = analyser.refresh(&feed);
        for _ in 0..60 {
            steady = analyser.refresh(&feed);
        }
        let (bin, before) = peak(&steady);
        assert!(before < 255 && before > 100, "steady peak {before}");

        // many small callback blocks between two animation frames
        for block in vec![0.0; DEFAULT_FFT_SIZE].chunks(128) {
            assert!(feed.tap().write(block));
        }
        let after = analyser.refresh(&feed).bins()[bin];

        // one step of 0.8 smoothing is -1.94 dB, about 7 steps on the byte scale
        let drop = before - after;
        assert!((6..=8).contains(&drop), "dropped {drop} from {before}");
        assert_eq!(feed.cell().latest().bins()[bin], after);
    }

    #[test]
    fn test_tap_keeps_latest_samples_in_order() {
        let tap = SampleTap::new(4, 16_000);
        assert!(tap.write(&[1.0, 2.0, 3.0]));
        assert!(tap.write(&[4.0, 5.0]));

        let mut out = [0.0; 4];
        tap.copy_latest(&mut out);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);

        let mut wide = [9.0; 6];
        tap.copy_latest(&mut wide);
        assert_eq!(wide, [0.0, 0.0, 2.0, 3.0, 4.0, 5.0]);

        // a block longer than the ring keeps only its tail
        tap.write(&[10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        tap.copy_latest(&mut out);
        assert_eq!(out, [12.0, 13.0, 14.0, 15.0]);

        tap.clear();
        tap.copy_latest(&mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_snapshot_carries_rate() {
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        let snapshot = analyser.analyse(&[0.0; 16], 48_000);
        assert_eq!(snapshot.sample_rate(), 48_000);
        assert!((snapshot.bin_hz() - 23.4375).abs() < 1e-4);
        assert!((SpectrumSnapshot::silent(1024).bin_hz() - 11.71875).abs() < 1e-4);
    }

    #[test]
    fn test_cell_publishes_latest() {
        let cell = SnapshotCell::new(4);
        assert!(cell.volume().abs() < f32::EPSILON);

        assert!(cell.publish(SpectrumSnapshot::new(vec![255, 255, 0, 0])));
        assert!((cell.volume() - 0.5).abs() < 1e-6);

        cell.clear();
        assert_eq!(cell.latest().bins(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_reader_never_sees_partial_snapshot() {
        let cell = SnapshotCell::new(1024);
        let reader = cell.clone();

        let writer = std::thread::spawn(move || {
            for i in 0..500u32 {
                let value = u8::try_from(i % 256).unwrap();
                cell.publish(SpectrumSnapshot::new(vec![value; 1024]));
            }
        });

        for _ in 0..500 {
            let snap = reader.latest();
            let first = snap.bins()[0];
            assert!(snap.bins().iter().all(|&b| b == first));
        }
        writer.join().unwrap();
    }
}
