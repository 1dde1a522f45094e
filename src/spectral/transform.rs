use super::mel::{MelFilterbank, MelInverse};
use super::stft::StftPlan;
use super::ExtractionConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything that determines the precomputed transform parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformKey {
    pub n_fft: usize,
    pub n_mels: usize,
    pub sample_rate: u32,
}

impl From<&ExtractionConfig> for TransformKey {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            n_fft: config.n_fft,
            n_mels: config.n_mels,
            sample_rate: config.sample_rate,
        }
    }
}

pub struct TransformParams {
    pub stft: StftPlan,
    pub filterbank: MelFilterbank,
}

/// Per-owner memo of FFT plans, filterbanks and pseudo-inverses.
/// Each worker builds one and reuses it across its whole shard.
#[derive(Default)]
pub struct TransformCache {
    params: HashMap<TransformKey, Arc<TransformParams>>,
    inverses: HashMap<TransformKey, Arc<MelInverse>>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(&mut self, key: TransformKey) -> Arc<TransformParams> {
        self.params
            .entry(key)
            .or_insert_with(|| {
                log::debug!(
                    "Building transform params (n_fft={}, n_mels={}, sr={})",
                    key.n_fft,
                    key.n_mels,
                    key.sample_rate
                );
                Arc::new(TransformParams {
                    stft: StftPlan::new(key.n_fft),
                    filterbank: MelFilterbank::new(key.n_mels, key.n_fft, key.sample_rate),
                })
            })
            .clone()
    }

    pub fn inverse(&mut self, key: TransformKey) -> Arc<MelInverse> {
        if let Some(inv) = self.inverses.get(&key) {
            return inv.clone();
        }
        let inv = Arc::new(self.params(key).filterbank.pseudo_inverse());
        self.inverses.insert(key, inv.clone());
        inv
    }
}
