//! Centred short-time Fourier transform and its overlap-add inverse.
//!
//! Frames are centred on `t * hop`: the signal is reflect-padded by `n_fft / 2`
//! on both sides, so a signal of `len` samples yields `1 + len / hop` frames.
//! The window is a periodic Hann of length `n_fft`.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub struct StftPlan {
    n_fft: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl StftPlan {
    pub fn new(n_fft: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            n_fft,
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    /// Positive-frequency bins including DC and (for even sizes) Nyquist.
    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn frame_count(&self, len: usize, hop: usize) -> usize {
        1 + len / hop
    }

    /// Complex spectrum of one centred frame: `[bin]`.
    fn frame_spectrum(&self, samples: &[f32], frame: usize, hop: usize, buffer: &mut [Complex<f32>]) {
        let pad = (self.n_fft / 2) as isize;
        let start = (frame * hop) as isize - pad;
        for (i, slot) in buffer.iter_mut().enumerate() {
            let src = reflect_index(start + i as isize, samples.len());
            *slot = Complex::new(samples[src] * self.window[i], 0.0);
        }
        self.forward.process(buffer);
    }

    /// Complex STFT, `[frame][bin]`. Only the first `max_frames` frames are computed.
    pub fn stft(&self, samples: &[f32], hop: usize, max_frames: Option<usize>) -> Vec<Vec<Complex<f32>>> {
        if samples.is_empty() {
            return Vec::new();
        }
        let mut frames = self.frame_count(samples.len(), hop);
        if let Some(limit) = max_frames {
            frames = frames.min(limit);
        }

        let n_freqs = self.n_freqs();
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];
        (0..frames)
            .map(|t| {
                self.frame_spectrum(samples, t, hop, &mut buffer);
                buffer[..n_freqs].to_vec()
            })
            .collect()
    }

    /// `|X|^power` per frame, `[frame][bin]`.
    pub fn power_frames(
        &self,
        samples: &[f32],
        hop: usize,
        power: f32,
        max_frames: Option<usize>,
    ) -> Vec<Vec<f32>> {
        self.stft(samples, hop, max_frames)
            .into_iter()
            .map(|frame| frame.iter().map(|c| c.norm().powf(power)).collect())
            .collect()
    }

    /// Overlap-add inverse. Output has exactly `length` samples.
    pub fn istft(&self, frames: &[Vec<Complex<f32>>], hop: usize, length: usize) -> Vec<f32> {
        let n = self.n_fft;
        let n_freqs = self.n_freqs();
        let pad = n / 2;
        let padded_len = n + hop * frames.len().saturating_sub(1);

        let mut output = vec![0.0f32; padded_len];
        let mut window_sum = vec![0.0f32; padded_len];
        let mut buffer = vec![Complex::new(0.0, 0.0); n];
        let scale = 1.0 / n as f32;

        for (t, frame) in frames.iter().enumerate() {
            fill_hermitian(frame, n_freqs, &mut buffer);
            self.inverse.process(&mut buffer);

            let start = t * hop;
            for (i, &w) in self.window.iter().enumerate() {
                output[start + i] += buffer[i].re * scale * w;
                window_sum[start + i] += w * w;
            }
        }

        for (sample, &ws) in output.iter_mut().zip(window_sum.iter()) {
            if ws > 1e-11 {
                *sample /= ws;
            }
        }

        let mut trimmed: Vec<f32> = output.into_iter().skip(pad).take(length).collect();
        trimmed.resize(length, 0.0);
        trimmed
    }
}

/// Rebuild a full conjugate-symmetric spectrum from its positive half.
fn fill_hermitian(half: &[Complex<f32>], n_freqs: usize, buffer: &mut [Complex<f32>]) {
    let n = buffer.len();
    for k in 0..n {
        buffer[k] = if k < n_freqs {
            half[k]
        } else {
            half[n - k].conj()
        };
    }
    // DC and Nyquist carry no imaginary part in a real signal
    buffer[0].im = 0.0;
    if n % 2 == 0 {
        buffer[n / 2].im = 0.0;
    }
}

/// Map an index outside `0..len` back inside by mirror reflection (edge sample not repeated).
fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let j = i.rem_euclid(period);
    if j >= len as isize {
        (period - j) as usize
    } else {
        j as usize
    }
}

pub fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / size as f32).cos())
        .collect()
}
