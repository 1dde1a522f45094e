use super::transform::{TransformCache, TransformKey};
use super::{ConfigError, ExtractionConfig, FeatureTensor, SPECTROGRAM_POWER};
use crate::audio::resample::resample_to;
use crate::audio::{AudioClip, ReadError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Read error: {0}")]
    Read(#[from] ReadError),
    #[error("Invalid extraction config: {0}")]
    Config(#[from] ConfigError),
}

/// Waveform → multi-scale mel tensor.
///
/// One mel power spectrogram per hop length, all sharing `n_mels`/`n_fft`.
/// Grids are start-aligned to `target_length` frames: frames past the target
/// are dropped, shorter grids are zero-padded on the right. Scales are stacked
/// in `hop_lengths` order.
#[derive(Default)]
pub struct SpectralAnalyzer {
    transforms: TransformCache,
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(
        &mut self,
        clip: &AudioClip,
        config: &ExtractionConfig,
    ) -> Result<FeatureTensor, ExtractError> {
        config.validate()?;
        clip.validate()?;

        let resampled;
        let clip = if clip.sample_rate != config.sample_rate {
            log::debug!(
                "Resampling {} Hz → {} Hz before analysis",
                clip.sample_rate,
                config.sample_rate
            );
            resampled = resample_to(clip, config.sample_rate);
            &resampled
        } else {
            clip
        };

        let params = self.transforms.params(TransformKey::from(config));
        let n_mels = config.n_mels;
        let target = config.target_length;
        let scales = config.hop_lengths.len();

        let mut tensor = FeatureTensor::zeros(scales, n_mels, target);
        let mut mel_frame = vec![0.0f32; n_mels];

        for (scale, &hop) in config.hop_lengths.iter().enumerate() {
            let native = params.stft.frame_count(clip.samples.len(), hop);
            let power =
                params
                    .stft
                    .power_frames(&clip.samples, hop, SPECTROGRAM_POWER, Some(target));

            for (t, frame) in power.iter().enumerate() {
                params.filterbank.apply(frame, &mut mel_frame);
                for (m, &value) in mel_frame.iter().enumerate() {
                    tensor.data[(scale * n_mels + m) * target + t] = value;
                }
            }

            log::trace!(
                "hop {}: {} native frames aligned to {}",
                hop,
                native,
                target
            );
        }

        Ok(tensor)
    }
}
