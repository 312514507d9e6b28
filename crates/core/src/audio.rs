//! Audio sample types and PCM utilities
//!
//! Everything downstream of the gateway runs on 16 kHz mono PCM16
//! (little-endian). Client audio arrives at whatever rate the socket header
//! declares and is converted here.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Supported inbound sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - Telephony
    Hz8000,
    /// 16kHz - Standard speech recognition
    #[default]
    Hz16000,
    /// 22.05kHz
    Hz22050,
    /// 44.1kHz - CD quality
    Hz44100,
    /// 48kHz - Browser capture default
    Hz48000,
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Get samples per millisecond
    pub fn samples_per_ms(&self) -> usize {
        self.as_u32() as usize / 1000
    }

    /// Parse the rate declared in a binary frame header
    pub fn from_hz(hz: u32) -> Result<Self> {
        match hz {
            8000 => Ok(SampleRate::Hz8000),
            16000 => Ok(SampleRate::Hz16000),
            22050 => Ok(SampleRate::Hz22050),
            44100 => Ok(SampleRate::Hz44100),
            48000 => Ok(SampleRate::Hz48000),
            other => Err(CoreError::MalformedFrame(format!(
                "unsupported sample rate {other} Hz"
            ))),
        }
    }
}

/// The rate every segment job carries
pub const TARGET_SAMPLE_RATE: SampleRate = SampleRate::Hz16000;

/// VAD frame length in milliseconds
pub const FRAME_MS: usize = 10;

/// Samples per VAD frame at the target rate
pub const FRAME_SAMPLES: usize = 160;

/// Bytes per VAD frame (PCM16)
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Decode PCM16 little-endian bytes to normalized f32 samples
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            sample as f32 / 32768.0
        })
        .collect()
}

/// Encode normalized f32 samples to PCM16 little-endian bytes
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let clamped = sample.clamp(-1.0, 1.0);
            let pcm16 = (clamped * 32767.0) as i16;
            pcm16.to_le_bytes()
        })
        .collect()
}

/// Duration in milliseconds of a PCM16 byte span at the given rate
pub fn pcm16_duration_ms(byte_len: usize, rate: SampleRate) -> u64 {
    (byte_len / 2) as u64 * 1000 / rate.as_u32() as u64
}

/// RMS energy of a sample slice in decibels
pub fn energy_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return -96.0; // Minimum dB (silence)
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();

    if rms > 0.0 {
        20.0 * rms.log10()
    } else {
        -96.0
    }
}

/// Streaming resampler from an inbound rate to the 16 kHz target.
///
/// Uses Rubato's FFT resampler over fixed chunks, carrying the remainder
/// between calls so arbitrary-length socket frames come out gap-free. Input
/// shorter than one chunk stays buffered until the next call.
pub struct StreamResampler {
    inner: Option<rubato::FftFixedIn<f64>>,
    pending: Vec<f64>,
    chunk_size: usize,
    from: SampleRate,
}

impl StreamResampler {
    /// Chunk size fed to the FFT resampler
    const CHUNK: usize = 1024;

    pub fn new(from: SampleRate) -> Result<Self> {
        if from == TARGET_SAMPLE_RATE {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                chunk_size: Self::CHUNK,
                from,
            });
        }

        let inner = rubato::FftFixedIn::<f64>::new(
            from.as_u32() as usize,
            TARGET_SAMPLE_RATE.as_u32() as usize,
            Self::CHUNK,
            2,
            1,
        )
        .map_err(|e| CoreError::Resample(e.to_string()))?;

        Ok(Self {
            inner: Some(inner),
            pending: Vec::with_capacity(Self::CHUNK * 2),
            chunk_size: Self::CHUNK,
            from,
        })
    }

    /// Source rate this resampler was built for
    pub fn source_rate(&self) -> SampleRate {
        self.from
    }

    /// Push samples, returning whatever full chunks produced at 16 kHz
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        use rubato::Resampler;

        let Some(inner) = self.inner.as_mut() else {
            // Already at the target rate
            return Ok(samples.to_vec());
        };

        self.pending.extend(samples.iter().map(|&s| s as f64));

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f64> = self.pending.drain(..self.chunk_size).collect();
            let output = inner
                .process(&[chunk], None)
                .map_err(|e| CoreError::Resample(e.to_string()))?;
            out.extend(output[0].iter().map(|&s| s as f32));
        }

        Ok(out)
    }

    /// Flush the carry buffer, zero-padding the final chunk.
    ///
    /// Call once when the socket closes so the tail of the last utterance is
    /// not lost.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        use rubato::Resampler;

        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let produced = self.pending.len();
        self.pending.resize(self.chunk_size, 0.0);
        let chunk: Vec<f64> = self.pending.drain(..).collect();
        let output = inner
            .process(&[chunk], None)
            .map_err(|e| CoreError::Resample(e.to_string()))?;

        // Keep only the part that corresponds to real input
        let ratio = TARGET_SAMPLE_RATE.as_u32() as f64 / self.from.as_u32() as f64;
        let keep = ((produced as f64 * ratio) as usize).min(output[0].len());
        Ok(output[0][..keep].iter().map(|&s| s as f32).collect())
    }
}
