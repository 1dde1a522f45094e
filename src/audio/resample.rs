use super::AudioClip;

/// Resample a mono clip to `target_rate` using linear interpolation.
pub fn resample_to(clip: &AudioClip, target_rate: u32) -> AudioClip {
    if clip.sample_rate == 0 || target_rate == 0 || clip.sample_rate == target_rate {
        return clip.clone();
    }

    let src = &clip.samples;
    if src.is_empty() {
        return AudioClip::new(Vec::new(), target_rate);
    }

    let ratio = target_rate as f64 / clip.sample_rate as f64;
    let new_len = ((src.len() as f64) * ratio).ceil() as usize;
    let last = src.len() - 1;

    let samples = (0..new_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let lower = pos.floor() as usize;
            if lower >= last {
                src[last]
            } else {
                let frac = (pos - lower as f64) as f32;
                src[lower] * (1.0 - frac) + src[lower + 1] * frac
            }
        })
        .collect();

    AudioClip::new(samples, target_rate)
}
