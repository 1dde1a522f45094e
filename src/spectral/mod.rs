pub mod analyzer;
pub mod mel;
pub mod resynth;
pub mod stft;
pub mod transform;

pub use analyzer::{ExtractError, SpectralAnalyzer};
pub use resynth::{InversionError, ResynthesisOptions, SpectralResynthesizer};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exponent applied to STFT magnitudes before mel projection (power spectrogram).
pub const SPECTROGRAM_POWER: f32 = 2.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("n_mels must be positive")]
    ZeroMels,
    #[error("n_fft must be at least 2 (got {0})")]
    FftTooSmall(usize),
    #[error("at least one hop length is required")]
    NoHopLengths,
    #[error("hop lengths must be positive")]
    ZeroHop,
    #[error("duplicate hop length {0}")]
    DuplicateHop(usize),
    #[error("target_length must be positive")]
    ZeroTargetLength,
    #[error("sample_rate must be positive")]
    ZeroSampleRate,
}

/// Parameters of the multi-scale mel analysis. Part of every cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub n_mels: usize,
    pub n_fft: usize,
    /// One mel grid per hop length, concatenated in this order.
    pub hop_lengths: Vec<usize>,
    /// Common time-axis length every grid is aligned to.
    pub target_length: usize,
    pub sample_rate: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            n_mels: 128,
            n_fft: 2048,
            hop_lengths: vec![512, 1024],
            target_length: 256,
            sample_rate: 16000,
        }
    }
}

impl ExtractionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_mels == 0 {
            return Err(ConfigError::ZeroMels);
        }
        if self.n_fft < 2 {
            return Err(ConfigError::FftTooSmall(self.n_fft));
        }
        if self.hop_lengths.is_empty() {
            return Err(ConfigError::NoHopLengths);
        }
        for (i, &hop) in self.hop_lengths.iter().enumerate() {
            if hop == 0 {
                return Err(ConfigError::ZeroHop);
            }
            if self.hop_lengths[..i].contains(&hop) {
                return Err(ConfigError::DuplicateHop(hop));
            }
        }
        if self.target_length == 0 {
            return Err(ConfigError::ZeroTargetLength);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        Ok(())
    }

    /// Stable textual form used for hashing. Field order is fixed; hop order is preserved.
    pub fn canonical(&self) -> String {
        let hops: Vec<String> = self.hop_lengths.iter().map(|h| h.to_string()).collect();
        format!(
            "n_mels={};n_fft={};hop_lengths={};target_length={};sample_rate={}",
            self.n_mels,
            self.n_fft,
            hops.join(","),
            self.target_length,
            self.sample_rate
        )
    }

    /// Linear-frequency bin count for `n_fft`.
    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }
}

/// Multi-scale mel tensor, row-major `[scale][mel][frame]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    pub scales: usize,
    pub n_mels: usize,
    pub frames: usize,
    pub data: Vec<f32>,
}

impl FeatureTensor {
    pub fn zeros(scales: usize, n_mels: usize, frames: usize) -> Self {
        Self {
            scales,
            n_mels,
            frames,
            data: vec![0.0; scales * n_mels * frames],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.scales, self.n_mels, self.frames]
    }

    /// One channel per hop length.
    pub fn channel_count(&self) -> usize {
        self.scales
    }

    /// Rows along the concatenated feature axis.
    pub fn feature_rows(&self) -> usize {
        self.scales * self.n_mels
    }

    pub fn is_consistent(&self) -> bool {
        self.scales
            .checked_mul(self.n_mels)
            .and_then(|n| n.checked_mul(self.frames))
            .is_some_and(|n| n == self.data.len())
    }

    fn offset(&self, scale: usize, mel: usize, frame: usize) -> usize {
        (scale * self.n_mels + mel) * self.frames + frame
    }

    pub fn get(&self, scale: usize, mel: usize, frame: usize) -> Option<f32> {
        if scale >= self.scales || mel >= self.n_mels || frame >= self.frames {
            return None;
        }
        Some(self.data[self.offset(scale, mel, frame)])
    }

    /// Copy out a single hop's grid as a `[mel][frame]` spectrogram.
    pub fn scale(&self, scale: usize) -> Option<Spectrogram> {
        if scale >= self.scales {
            return None;
        }
        let start = self.offset(scale, 0, 0);
        let end = start + self.n_mels * self.frames;
        Some(Spectrogram {
            bins: self.n_mels,
            frames: self.frames,
            data: self.data[start..end].to_vec(),
        })
    }
}

/// Single time-frequency grid, row-major `[bin][frame]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub bins: usize,
    pub frames: usize,
    pub data: Vec<f32>,
}

impl Spectrogram {
    pub fn new(bins: usize, frames: usize, data: Vec<f32>) -> Result<Self, InversionError> {
        if bins * frames != data.len() {
            return Err(InversionError::DataLength {
                expected: bins * frames,
                actual: data.len(),
            });
        }
        Ok(Self { bins, frames, data })
    }

    pub fn get(&self, bin: usize, frame: usize) -> f32 {
        self.data[bin * self.frames + frame]
    }

    /// Column view: all bins at one frame.
    pub fn frame(&self, frame: usize) -> Vec<f32> {
        (0..self.bins).map(|b| self.get(b, frame)).collect()
    }
}
