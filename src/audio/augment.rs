//! Deterministic training-time augmentation.
//!
//! The RNG is seeded per stem (from the cache key), so an augmented entry is
//! reproducible and two workers computing the same key produce the same tensor.

use super::AudioClip;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Maximum gain jitter in dB, applied symmetrically.
const MAX_GAIN_DB: f32 = 3.0;

/// White noise level relative to the clip's peak, in dB.
const NOISE_FLOOR_DB: f32 = -40.0;

pub fn augment(clip: &AudioClip, seed: u64) -> AudioClip {
    let mut rng = StdRng::seed_from_u64(seed);

    let gain_db: f32 = rng.gen_range(-MAX_GAIN_DB..=MAX_GAIN_DB);
    let gain = db_to_amplitude(gain_db);

    let peak = clip.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    let noise_amp = peak * db_to_amplitude(NOISE_FLOOR_DB);

    let samples = clip
        .samples
        .iter()
        .map(|&s| {
            let noise = if noise_amp > 0.0 {
                rng.gen_range(-noise_amp..=noise_amp)
            } else {
                0.0
            };
            (s * gain + noise).clamp(-1.0, 1.0)
        })
        .collect();

    AudioClip::new(samples, clip.sample_rate)
}

fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}
