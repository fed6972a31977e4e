//! Pure sample-format transforms between capture, wire and playback
//!
//! The Realtime API speaks PCM16 mono (little-endian), base64-encoded inside
//! JSON frames. Devices speak normalized `f32`. Nothing in here does I/O.
//!
//! # Format
//!
//! ```text
//! f32 [-1.0, 1.0] ──clamp × 32767──▶ i16 LE bytes ──base64──▶ wire text
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use super::AudioError;

/// Scale factor between normalized floats and PCM16
const PCM16_SCALE: f32 = i16::MAX as f32;

/// Convert normalized float samples to PCM16 little-endian bytes.
///
/// Each sample is clamped to `[-1, 1]`, scaled by 32767 and truncated.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| float_sample_to_i16(s).to_le_bytes())
        .collect()
}

/// Convert PCM16 little-endian bytes back to normalized float samples.
///
/// Fails on an odd byte count (a truncated sample).
pub fn pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>, AudioError> {
    Ok(bytes_to_samples(bytes)?
        .into_iter()
        .map(|s| s as f32 / PCM16_SCALE)
        .collect())
}

fn float_sample_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16
}

/// Serialize PCM16 samples as little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Parse little-endian bytes into PCM16 samples
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::Decode(format!(
            "PCM16 payload has odd length ({} bytes)",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode raw bytes as standard base64 text for the wire
pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 wire text into raw bytes
pub fn base64_to_bytes(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// Average interleaved frames down to a single channel
pub fn mix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    let channels = channels as usize;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Converter chunk length, in milliseconds of input
const CONVERTER_CHUNK_MS: u32 = 20;

/// Streaming sample-rate converter for mono `f32` audio
///
/// Wraps a rubato cubic resampler with a fixed input chunk. Input that does
/// not fill a chunk is held until the next call or [`RateConverter::flush`].
/// Matching rates pass samples through untouched.
pub struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    chunk: usize,
    pending: Vec<f32>,
    consumed: u64,
    produced: u64,
}

impl RateConverter {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, AudioError> {
        if source_rate == 0 || target_rate == 0 {
            return Err(AudioError::Resample(format!(
                "invalid sample rate (source: {}, target: {})",
                source_rate, target_rate
            )));
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let chunk = (source_rate * CONVERTER_CHUNK_MS / 1000).max(1) as usize;
        let resampler = if source_rate == target_rate {
            None
        } else {
            let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk, 1)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            ratio,
            chunk,
            pending: Vec::with_capacity(chunk * 2),
            consumed: 0,
            produced: 0,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Convert every whole chunk available; the remainder waits
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        self.consumed += samples.len() as u64;

        let mut out = Vec::new();
        let mut start = 0;
        while self.pending.len() - start >= self.chunk {
            let input: [&[f32]; 1] = [&self.pending[start..start + self.chunk]];
            let converted = resampler
                .process(&input[..], None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if let Some(channel) = converted.first() {
                out.extend_from_slice(channel);
            }
            start += self.chunk;
        }
        self.pending.drain(..start);

        self.produced += out.len() as u64;
        Ok(out)
    }

    /// Convert the held remainder, trimming the zero padding
    pub fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let input: [&[f32]; 1] = [&self.pending[..]];
        let converted = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        self.pending.clear();

        let expected = (self.consumed as f64 * self.ratio).round() as u64;
        let room = expected.saturating_sub(self.produced) as usize;
        let mut out = converted.into_iter().next().unwrap_or_default();
        out.truncate(room);

        self.produced += out.len() as u64;
        Ok(out)
    }
}

/// Resample a complete buffer in one go
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, AudioError> {
    let mut converter = RateConverter::new(source_rate, target_rate)?;
    let mut out = converter.process(samples)?;
    out.extend(converter.flush()?);
    Ok(out)
}
