//! HTK mel filterbank and its regularised pseudo-inverse.

/// Triangular filters over the continuous bin frequencies `k * sr / n_fft`,
/// unnormalised, spanning 0 Hz to Nyquist.
pub struct MelFilterbank {
    n_mels: usize,
    n_freqs: usize,
    /// Row-major `[mel][freq]`.
    weights: Vec<f32>,
    /// Nonzero span of each filter, `start..end`.
    spans: Vec<(usize, usize)>,
}

impl MelFilterbank {
    pub fn new(n_mels: usize, n_fft: usize, sample_rate: u32) -> Self {
        let n_freqs = n_fft / 2 + 1;
        let nyquist = sample_rate as f64 / 2.0;

        let mel_max = hz_to_mel(nyquist);
        let f_pts: Vec<f64> = (0..n_mels + 2)
            .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
            .collect();

        let bin_hz = |k: usize| {
            if n_freqs > 1 {
                nyquist * k as f64 / (n_freqs - 1) as f64
            } else {
                0.0
            }
        };

        let mut weights = vec![0.0f32; n_mels * n_freqs];
        let mut spans = Vec::with_capacity(n_mels);
        for m in 0..n_mels {
            let (left, center, right) = (f_pts[m], f_pts[m + 1], f_pts[m + 2]);
            let mut start = n_freqs;
            let mut end = 0;
            for k in 0..n_freqs {
                let f = bin_hz(k);
                let down = (f - left) / (center - left);
                let up = (right - f) / (right - center);
                let w = down.min(up).max(0.0);
                if w > 0.0 {
                    weights[m * n_freqs + k] = w as f32;
                    start = start.min(k);
                    end = k + 1;
                }
            }
            spans.push(if start < end { (start, end) } else { (0, 0) });
        }

        Self {
            n_mels,
            n_freqs,
            weights,
            spans,
        }
    }

    pub fn n_freqs(&self) -> usize {
        self.n_freqs
    }

    pub fn weight(&self, mel: usize, freq: usize) -> f32 {
        self.weights[mel * self.n_freqs + freq]
    }

    /// Project one linear-frequency frame onto the mel axis.
    pub fn apply(&self, frame: &[f32], out: &mut [f32]) {
        for (m, slot) in out.iter_mut().enumerate().take(self.n_mels) {
            let (start, end) = self.spans[m];
            let row = &self.weights[m * self.n_freqs..(m + 1) * self.n_freqs];
            *slot = (start..end).map(|k| row[k] * frame[k]).sum();
        }
    }

    /// `M⁺ = Mᵀ (M Mᵀ + λI)⁻¹`, with λ a small multiple of the mean Gram diagonal
    /// so empty or near-duplicate filters stay solvable.
    pub fn pseudo_inverse(&self) -> MelInverse {
        let (nm, nf) = (self.n_mels, self.n_freqs);

        let mut gram = vec![0.0f64; nm * nm];
        for i in 0..nm {
            for j in i..nm {
                let (si, ei) = self.spans[i];
                let (sj, ej) = self.spans[j];
                let (lo, hi) = (si.max(sj), ei.min(ej));
                let dot: f64 = (lo..hi.max(lo))
                    .map(|k| self.weight(i, k) as f64 * self.weight(j, k) as f64)
                    .sum();
                gram[i * nm + j] = dot;
                gram[j * nm + i] = dot;
            }
        }

        let mean_diag = (0..nm).map(|i| gram[i * nm + i]).sum::<f64>() / nm as f64;
        let ridge = (mean_diag * 1e-6).max(1e-10);
        for i in 0..nm {
            gram[i * nm + i] += ridge;
        }

        let chol = cholesky(&gram, nm);

        // Column c of (G + λI)⁻¹ solves G x = e_c; the Gram matrix is symmetric so rows = columns.
        let mut gram_inv = vec![0.0f64; nm * nm];
        let mut e = vec![0.0f64; nm];
        for c in 0..nm {
            e.iter_mut().for_each(|v| *v = 0.0);
            e[c] = 1.0;
            let x = cholesky_solve(&chol, nm, &e);
            for r in 0..nm {
                gram_inv[r * nm + c] = x[r];
            }
        }

        // matrix[k][m] = Σ_j M[j][k] · G⁻¹[j][m]
        let mut matrix = vec![0.0f32; nf * nm];
        for k in 0..nf {
            for m in 0..nm {
                let mut acc = 0.0f64;
                for j in 0..nm {
                    let w = self.weight(j, k);
                    if w != 0.0 {
                        acc += w as f64 * gram_inv[j * nm + m];
                    }
                }
                matrix[k * nm + m] = acc as f32;
            }
        }

        MelInverse {
            n_mels: nm,
            n_freqs: nf,
            matrix,
        }
    }
}

/// Maps a mel frame back to an approximate linear-frequency frame.
pub struct MelInverse {
    n_mels: usize,
    n_freqs: usize,
    /// Row-major `[freq][mel]`.
    matrix: Vec<f32>,
}

impl MelInverse {
    pub fn n_freqs(&self) -> usize {
        self.n_freqs
    }

    /// Least-norm solution; may contain small negative values.
    pub fn apply(&self, mel: &[f32], out: &mut [f32]) {
        for (k, slot) in out.iter_mut().enumerate().take(self.n_freqs) {
            let row = &self.matrix[k * self.n_mels..(k + 1) * self.n_mels];
            *slot = row.iter().zip(mel.iter()).map(|(a, b)| a * b).sum();
        }
    }
}

/// Lower-triangular factor of a symmetric positive-definite matrix.
fn cholesky(a: &[f64], n: usize) -> Vec<f64> {
    let mut l = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                l[i * n + i] = sum.max(1e-300).sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    l
}

fn cholesky_solve(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    // L y = b
    let mut y = vec![0.0f64; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * y[k];
        }
        y[i] = sum / l[i * n + i];
    }
    // Lᵀ x = y
    let mut x = vec![0.0f64; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in i + 1..n {
            sum -= l[k * n + i] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}
