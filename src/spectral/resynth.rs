//! Mel tensor → waveform: pseudo-inverse mel projection followed by
//! Griffin-Lim phase reconstruction with momentum.
//!
//! Output is not bit-exact across seeds or platforms. Compare results by
//! spectral distance, not sample equality.

use super::transform::{TransformCache, TransformKey};
use super::{ConfigError, ExtractionConfig, Spectrogram, SPECTROGRAM_POWER};
use crate::audio::AudioClip;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InversionError {
    #[error("expected {expected} frequency bins, got {actual}")]
    BinMismatch { expected: usize, actual: usize },
    #[error("spectrogram data length {actual} does not match its shape ({expected})")]
    DataLength { expected: usize, actual: usize },
    #[error("need at least 2 frames to resynthesize, got {0}")]
    TooFewFrames(usize),
    #[error("invalid extraction config: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid resynthesis options: {0}")]
    Options(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResynthesisOptions {
    /// Griffin-Lim iterations. Trades quality for latency only.
    pub n_iter: usize,
    /// 0 disables the momentum term (plain Griffin-Lim).
    pub momentum: f32,
    /// Synthesis hop; `None` means `n_fft / 2`.
    pub hop_length: Option<usize>,
    /// Seed for the random initial phase.
    pub seed: u64,
}

impl Default for ResynthesisOptions {
    fn default() -> Self {
        Self {
            n_iter: 32,
            momentum: 0.99,
            hop_length: None,
            seed: 0,
        }
    }
}

impl ResynthesisOptions {
    fn validate(&self) -> Result<(), InversionError> {
        if self.n_iter == 0 {
            return Err(InversionError::Options("n_iter must be positive".into()));
        }
        if self.hop_length == Some(0) {
            return Err(InversionError::Options("hop_length must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(InversionError::Options(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SpectralResynthesizer {
    transforms: TransformCache,
    options: ResynthesisOptions,
}

impl SpectralResynthesizer {
    pub fn new(options: ResynthesisOptions) -> Self {
        Self {
            transforms: TransformCache::new(),
            options,
        }
    }

    /// Invert a `[mel][frame]` power spectrogram produced with `config`.
    pub fn resynthesize(
        &mut self,
        mel: &Spectrogram,
        config: &ExtractionConfig,
    ) -> Result<AudioClip, InversionError> {
        config.validate()?;
        check_shape(mel, config.n_mels)?;

        let key = TransformKey::from(config);
        let inverse = self.transforms.inverse(key);
        let n_freqs = config.n_freqs();

        let mut mel_frame = vec![0.0f32; config.n_mels];
        let mut linear = vec![0.0f32; n_freqs];
        let mut magnitude = vec![vec![0.0f32; n_freqs]; mel.frames];
        for (t, column) in magnitude.iter_mut().enumerate() {
            for (m, slot) in mel_frame.iter_mut().enumerate() {
                *slot = mel.get(m, t);
            }
            inverse.apply(&mel_frame, &mut linear);
            for (dst, &p) in column.iter_mut().zip(linear.iter()) {
                *dst = p.max(0.0).powf(1.0 / SPECTROGRAM_POWER);
            }
        }

        self.griffin_lim(&magnitude, config)
    }

    /// Invert a `[freq][frame]` linear-frequency magnitude spectrogram.
    pub fn resynthesize_linear(
        &mut self,
        magnitude: &Spectrogram,
        config: &ExtractionConfig,
    ) -> Result<AudioClip, InversionError> {
        config.validate()?;
        check_shape(magnitude, config.n_freqs())?;

        let frames: Vec<Vec<f32>> = (0..magnitude.frames)
            .map(|t| magnitude.frame(t).into_iter().map(|m| m.max(0.0)).collect())
            .collect();
        self.griffin_lim(&frames, config)
    }

    fn griffin_lim(
        &mut self,
        magnitude: &[Vec<f32>],
        config: &ExtractionConfig,
    ) -> Result<AudioClip, InversionError> {
        self.options.validate()?;

        let hop = self.options.hop_length.unwrap_or((config.n_fft / 2).max(1));
        let frames = magnitude.len();
        let length = hop * (frames - 1);
        let params = self.transforms.params(TransformKey::from(config));
        let stft = &params.stft;

        let mut rng = StdRng::seed_from_u64(self.options.seed);
        let mut angles: Vec<Vec<Complex<f32>>> = magnitude
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .map(|_| Complex::from_polar(1.0, rng.gen_range(0.0..2.0 * PI)))
                    .collect()
            })
            .collect();
        let mut previous: Option<Vec<Vec<Complex<f32>>>> = None;
        let alpha = self.options.momentum / (1.0 + self.options.momentum);

        for _ in 0..self.options.n_iter {
            let inverse = stft.istft(&apply_magnitude(magnitude, &angles), hop, length);
            let rebuilt = stft.stft(&inverse, hop, Some(frames));

            for (t, frame) in angles.iter_mut().enumerate() {
                for (bin, angle) in frame.iter_mut().enumerate() {
                    let mut next = rebuilt
                        .get(t)
                        .map(|f| f[bin])
                        .unwrap_or_else(|| Complex::new(0.0, 0.0));
                    if let Some(prev) = &previous {
                        next -= prev[t][bin] * alpha;
                    }
                    let norm = next.norm();
                    *angle = if norm > 1e-16 {
                        next / norm
                    } else {
                        Complex::new(1.0, 0.0)
                    };
                }
            }
            previous = Some(rebuilt);
        }

        let samples = stft.istft(&apply_magnitude(magnitude, &angles), hop, length);
        Ok(AudioClip::new(samples, config.sample_rate))
    }
}

fn check_shape(spec: &Spectrogram, expected_bins: usize) -> Result<(), InversionError> {
    if spec.bins != expected_bins {
        return Err(InversionError::BinMismatch {
            expected: expected_bins,
            actual: spec.bins,
        });
    }
    if spec.bins * spec.frames != spec.data.len() {
        return Err(InversionError::DataLength {
            expected: spec.bins * spec.frames,
            actual: spec.data.len(),
        });
    }
    if spec.frames < 2 {
        return Err(InversionError::TooFewFrames(spec.frames));
    }
    Ok(())
}

fn apply_magnitude(magnitude: &[Vec<f32>], angles: &[Vec<Complex<f32>>]) -> Vec<Vec<Complex<f32>>> {
    magnitude
        .iter()
        .zip(angles.iter())
        .map(|(mag, ang)| mag.iter().zip(ang.iter()).map(|(&m, &a)| a * m).collect())
        .collect()
}

/// Spectral convergence `‖S − |STFT(y)|‖ / ‖S‖` of a waveform against a target magnitude.
pub fn spectral_convergence(
    target: &[Vec<f32>],
    samples: &[f32],
    n_fft: usize,
    hop: usize,
) -> f32 {
    let plan = super::stft::StftPlan::new(n_fft);
    let estimate = plan.power_frames(samples, hop, 1.0, Some(target.len()));
    let mut diff = 0.0f64;
    let mut norm = 0.0f64;
    for (t, frame) in target.iter().enumerate() {
        for (bin, &s) in frame.iter().enumerate() {
            let e = estimate.get(t).map(|f| f[bin]).unwrap_or(0.0);
            diff += ((s - e) as f64).powi(2);
            norm += (s as f64).powi(2);
        }
    }
    if norm == 0.0 {
        return 0.0;
    }
    (diff / norm).sqrt() as f32
}
