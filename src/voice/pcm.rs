//! Linear PCM wire format
//!
//! Mono 16-bit signed little-endian samples, base64 transported inside JSON
//! control messages. Tagged on the wire with `audio/pcm;rate=<R>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// MIME prefix shared by every PCM payload
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// A mono block of linear PCM samples in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// MIME type announcing this frame's rate
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("{PCM_MIME_PREFIX};rate={}", self.sample_rate)
    }

    /// Duration of the frame in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Encode as base64 PCM16
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(encode_pcm16(&self.samples))
    }

    /// Decode a base64 PCM16 payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid base64
    pub fn from_base64(data: &str, sample_rate: u32) -> Result<Self> {
        let bytes = STANDARD.decode(data)?;
        Ok(Self::new(decode_pcm16(&bytes), sample_rate))
    }
}

/// Convert f32 samples to PCM16 little-endian bytes
///
/// Samples are clamped to [-1, 1] before quantization and never wrap.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let q = (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

/// Convert PCM16 little-endian bytes to f32 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Box-filter decimation from `input_rate` to `target_rate`
///
/// Each output sample averages `ratio = input_rate / target_rate` consecutive
/// inputs. The output length is `round(len / ratio)`. The filter is local to
/// the block: no state carries over between calls.
///
/// # Errors
///
/// Returns `UnsupportedRate` if `input_rate < target_rate`
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn downsample(buffer: &[f32], input_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if input_rate == target_rate {
        return Ok(buffer.to_vec());
    }
    if input_rate < target_rate || target_rate == 0 {
        return Err(Error::UnsupportedRate {
            input: input_rate,
            target: target_rate,
        });
    }

    let ratio = f64::from(input_rate) / f64::from(target_rate);
    let out_len = (buffer.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    let mut offset = 0usize;
    for i in 0..out_len {
        let next = (((i + 1) as f64) * ratio).round() as usize;
        let end = next.min(buffer.len());
        let window = buffer.get(offset..end).unwrap_or_default();
        let avg = if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f32>() / window.len() as f32
        };
        out.push(avg);
        offset = next;
    }

    Ok(out)
}

/// Parse the rate out of a `audio/pcm;rate=<R>` MIME type
#[must_use]
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    if !mime_type.starts_with(PCM_MIME_PREFIX) {
        return None;
    }
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// Root-mean-square energy of a block
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
