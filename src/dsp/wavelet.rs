//! Wavelet analysis: Daubechies-4 DWT, wavelet-packet decomposition with
//! best-basis search, Morlet CWT and a band-limited Stockwell transform.

use rustfft::num_complex::Complex64;

use super::fft::{fft_forward, fft_inverse};

/// db4 decomposition lowpass filter (8 taps).
const DB4_LO: [f64; 8] = [
    -0.010597401784997278,
    0.032883011666982945,
    0.030841381835986965,
    -0.187034811718881140,
    -0.027983769416983850,
    0.630880767929590400,
    0.714846570552541500,
    0.230377813308855230,
];

fn db4_hi() -> [f64; 8] {
    let mut hi = [0.0; 8];
    for (k, h) in hi.iter_mut().enumerate() {
        let v = DB4_LO[DB4_LO.len() - 1 - k];
        *h = if k % 2 == 0 { -v } else { v };
    }
    hi
}

fn symmetric_extend(signal: &[f64], pad: usize) -> Vec<f64> {
    let n = signal.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    for i in 0..pad {
        out.push(signal[(pad - 1 - i).min(n - 1)]);
    }
    out.extend_from_slice(signal);
    for i in 0..pad {
        out.push(signal[n - 1 - i.min(n - 1)]);
    }
    out
}

/// One analysis step: returns (approximation, detail), each about half the
/// input length. Symmetric boundary handling.
pub fn dwt_step(signal: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let l = DB4_LO.len();
    let n = signal.len();
    if n < 2 {
        return (signal.to_vec(), Vec::new());
    }
    let hi = db4_hi();
    let ext = symmetric_extend(signal, l - 1);
    let out_len = (n + l - 1) / 2;
    let mut approx = Vec::with_capacity(out_len);
    let mut detail = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let base = 2 * i + 1 + (l - 1);
        let mut lo_acc = 0.0;
        let mut hi_acc = 0.0;
        for k in 0..l {
            let v = ext[base - k];
            lo_acc += DB4_LO[k] * v;
            hi_acc += hi[k] * v;
        }
        approx.push(lo_acc);
        detail.push(hi_acc);
    }
    (approx, detail)
}

/// Multi-level db4 decomposition. Returns (final approximation, details from
/// level 1 (finest) upward). Stops early when the signal gets shorter than
/// the filter.
pub fn wavedec(signal: &[f32], max_levels: usize) -> (Vec<f64>, Vec<Vec<f64>>) {
    let mut current: Vec<f64> = signal.iter().map(|&v| v as f64).collect();
    let mut details = Vec::new();
    for _ in 0..max_levels {
        if current.len() < DB4_LO.len() {
            break;
        }
        let (approx, detail) = dwt_step(&current);
        details.push(detail);
        current = approx;
    }
    (current, details)
}

/// Node of a wavelet-packet tree, identified by (level, position).
#[derive(Clone, Debug)]
pub struct PacketNode {
    pub level: usize,
    pub position: usize,
    pub coeffs: Vec<f64>,
}

impl PacketNode {
    pub fn energy(&self) -> f64 {
        self.coeffs.iter().map(|c| c * c).sum()
    }

    /// Normalized Shannon entropy of the squared coefficients, in nats.
    pub fn shannon_cost(&self) -> f64 {
        let total = self.energy();
        if total <= f64::EPSILON {
            return 0.0;
        }
        -self
            .coeffs
            .iter()
            .map(|c| {
                let p = c * c / total;
                if p > 0.0 {
                    p * p.ln()
                } else {
                    0.0
                }
            })
            .sum::<f64>()
    }
}

/// Full wavelet-packet decomposition to `depth`, breadth-first.
pub fn wavelet_packet(signal: &[f32], depth: usize) -> Vec<Vec<PacketNode>> {
    let root = PacketNode {
        level: 0,
        position: 0,
        coeffs: signal.iter().map(|&v| v as f64).collect(),
    };
    let mut levels = vec![vec![root]];
    for level in 1..=depth {
        let mut next = Vec::new();
        for node in &levels[level - 1] {
            if node.coeffs.len() < DB4_LO.len() {
                continue;
            }
            let (approx, detail) = dwt_step(&node.coeffs);
            next.push(PacketNode {
                level,
                position: node.position * 2,
                coeffs: approx,
            });
            next.push(PacketNode {
                level,
                position: node.position * 2 + 1,
                coeffs: detail,
            });
        }
        if next.is_empty() {
            break;
        }
        levels.push(next);
    }
    levels
}

/// Coifman-Wickerhauser best-basis search over the packet tree: a node is
/// split iff its children's summed Shannon cost is strictly lower. Returns
/// the chosen leaf nodes and the total cost of the basis.
pub fn best_basis(levels: &[Vec<PacketNode>]) -> (Vec<(usize, usize)>, f64) {
    if levels.is_empty() {
        return (Vec::new(), 0.0);
    }
    let depth = levels.len() - 1;
    // cost[(level, position)] = best achievable cost of that subtree,
    // keep[(level, position)] = whether the node itself is kept as a leaf.
    let mut best_cost: std::collections::HashMap<(usize, usize), f64> =
        std::collections::HashMap::new();
    let mut kept: std::collections::HashMap<(usize, usize), bool> =
        std::collections::HashMap::new();

    for node in &levels[depth] {
        best_cost.insert((node.level, node.position), node.shannon_cost());
        kept.insert((node.level, node.position), true);
    }
    for level in (0..depth).rev() {
        for node in &levels[level] {
            let own = node.shannon_cost();
            let children = (
                best_cost.get(&(level + 1, node.position * 2)),
                best_cost.get(&(level + 1, node.position * 2 + 1)),
            );
            match children {
                (Some(&l), Some(&r)) if l + r < own => {
                    best_cost.insert((level, node.position), l + r);
                    kept.insert((level, node.position), false);
                }
                _ => {
                    best_cost.insert((level, node.position), own);
                    kept.insert((level, node.position), true);
                }
            }
        }
    }

    // Walk down from the root collecting kept leaves.
    let mut leaves = Vec::new();
    let mut stack = vec![(0usize, 0usize)];
    while let Some((level, position)) = stack.pop() {
        match kept.get(&(level, position)) {
            Some(true) => leaves.push((level, position)),
            Some(false) => {
                stack.push((level + 1, position * 2));
                stack.push((level + 1, position * 2 + 1));
            }
            None => {}
        }
    }
    leaves.sort_unstable();
    let total = best_cost.get(&(0, 0)).copied().unwrap_or(0.0);
    (leaves, total)
}

/// Morlet continuous wavelet row at center frequency `freq` (Hz), ω₀ = 6.
/// Returns the complex time series (same length as the signal).
pub fn morlet_cwt(signal: &[f32], freq: f64, fs: f64, omega0: f64) -> Vec<Complex64> {
    let n = signal.len();
    if n == 0 || freq <= 0.0 {
        return Vec::new();
    }
    // Scale so the wavelet's center frequency lands on `freq`.
    let scale = omega0 * fs / (2.0 * std::f64::consts::PI * freq);
    let norm = std::f64::consts::PI.powf(-0.25) / scale.sqrt();

    // FFT-domain convolution at full signal length.
    let size = (2 * n).next_power_of_two();
    let mut sig_buf = vec![Complex64::new(0.0, 0.0); size];
    for (i, &v) in signal.iter().enumerate() {
        sig_buf[i] = Complex64::new(v as f64, 0.0);
    }
    let mut ker_buf = vec![Complex64::new(0.0, 0.0); size];
    let half = (5.0 * scale).ceil() as isize;
    for t in -half..=half {
        let x = t as f64 / scale;
        let w = norm * (-0.5 * x * x).exp();
        let ker = Complex64::from_polar(w, omega0 * x);
        // Center the kernel at index 0 (circular).
        let idx = ((t % size as isize) + size as isize) % size as isize;
        ker_buf[idx as usize] = ker.conj();
    }
    fft_forward(&mut sig_buf);
    fft_forward(&mut ker_buf);
    for (s, k) in sig_buf.iter_mut().zip(&ker_buf) {
        *s *= k;
    }
    fft_inverse(&mut sig_buf);
    sig_buf.truncate(n);
    sig_buf
}

/// Stockwell transform rows for integer frequencies within `[lo, hi]` Hz.
/// Each row is the complex time-frequency series at that frequency.
pub fn stockwell_band(signal: &[f32], fs: f64, lo: f64, hi: f64) -> Vec<(f64, Vec<Complex64>)> {
    let n = signal.len();
    if n < 4 {
        return Vec::new();
    }
    let mut spectrum: Vec<Complex64> = signal
        .iter()
        .map(|&v| Complex64::new(v as f64, 0.0))
        .collect();
    fft_forward(&mut spectrum);

    let bin_hz = fs / n as f64;
    let lo_bin = (lo / bin_hz).ceil().max(1.0) as usize;
    let hi_bin = ((hi / bin_hz).floor() as usize).min(n / 2);
    let mut rows = Vec::new();
    for f_bin in lo_bin..=hi_bin {
        // Voice at frequency bin f: IFFT of X[f + α] · exp(−2π²α²/f²).
        let mut voice = vec![Complex64::new(0.0, 0.0); n];
        for (alpha, v) in voice.iter_mut().enumerate() {
            let a = if alpha <= n / 2 {
                alpha as f64
            } else {
                alpha as f64 - n as f64
            };
            let gauss = (-2.0 * std::f64::consts::PI.powi(2) * a * a
                / (f_bin as f64 * f_bin as f64))
                .exp();
            let src = (f_bin + alpha) % n;
            *v = spectrum[src] * gauss;
        }
        fft_inverse(&mut voice);
        // fft_inverse already divides by n; undo that so rows carry spectral
        // amplitude comparable across frequencies.
        for v in voice.iter_mut() {
            *v *= n as f64;
        }
        rows.push((f_bin as f64 * bin_hz, voice));
    }
    rows
}
