pub mod augment;
pub mod decode;
pub mod resample;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to probe audio file: {0}")]
    Probe(String),
    #[error("Audio file contains no decodable track")]
    NoTrack,
    #[error("Track missing sample rate")]
    MissingSampleRate,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Audio clip is empty")]
    Empty,
    #[error("Audio clip contains non-finite samples")]
    NonFinite,
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Mono waveform plus its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Downmix interleaved multi-channel samples to mono by averaging.
    pub fn from_interleaved(interleaved: &[f32], channels: usize, sample_rate: u32) -> Self {
        let samples = if channels <= 1 {
            interleaved.to_vec()
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Reject clips that cannot be analyzed: empty, zero rate, NaN/inf samples.
    pub fn validate(&self) -> Result<(), ReadError> {
        if self.samples.is_empty() || self.sample_rate == 0 {
            return Err(ReadError::Empty);
        }
        if self.samples.iter().any(|s| !s.is_finite()) {
            return Err(ReadError::NonFinite);
        }
        Ok(())
    }
}
