//! IIR filtering: biquad notches, Butterworth designs in second-order
//! sections, zero-phase application, and Savitzky-Golay smoothing.

use std::collections::HashMap;
use std::sync::Mutex;

use nalgebra::DMatrix;
use once_cell::sync::Lazy;
use rustfft::num_complex::Complex64;

use crate::error::{EngineError, Result};

/// One second-order section, coefficients normalized so a0 = 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    /// RBJ cookbook notch at `f0` Hz with quality factor `q`.
    pub fn notch(f0: f64, fs: f64, q: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * f0 / fs;
        let alpha = omega.sin() / (2.0 * q);
        let cos_w = omega.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: 1.0 / a0,
            b1: -2.0 * cos_w / a0,
            b2: 1.0 / a0,
            a1: -2.0 * cos_w / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// DC gain H(1).
    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Steady-state DF2T state for a unit constant input (sosfilt_zi).
    fn unit_zi(&self) -> [f64; 2] {
        let h = self.dc_gain();
        let z2 = self.b2 - self.a2 * h;
        let z1 = self.b1 - self.a1 * h + z2;
        [z1, z2]
    }

    /// Complex frequency response at normalized angular frequency `w`.
    fn response(&self, w: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -w);
        let z2 = z1 * z1;
        (self.b0 + self.b1 * z1 + self.b2 * z2) / (1.0 + self.a1 * z1 + self.a2 * z2)
    }
}

/// A cascade of second-order sections.
#[derive(Clone, Debug)]
pub struct Sos {
    sections: Vec<Biquad>,
}

impl Sos {
    pub fn from_sections(sections: Vec<Biquad>) -> Self {
        Self { sections }
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Causal forward pass (Direct Form II transposed), zero initial state.
    pub fn filter(&self, signal: &[f32]) -> Vec<f32> {
        let mut out: Vec<f64> = signal.iter().map(|&v| v as f64).collect();
        for s in &self.sections {
            let mut z1 = 0.0f64;
            let mut z2 = 0.0f64;
            for v in out.iter_mut() {
                let x = *v;
                let y = s.b0 * x + z1;
                z1 = s.b1 * x - s.a1 * y + z2;
                z2 = s.b2 * x - s.a2 * y;
                *v = y;
            }
        }
        out.into_iter().map(|v| v as f32).collect()
    }

    /// Zero-phase forward-backward pass with odd-reflection padding and
    /// steady-state initial conditions, matching sosfiltfilt semantics.
    pub fn filtfilt(&self, signal: &[f32]) -> Vec<f32> {
        let n = signal.len();
        if n < 2 {
            return signal.to_vec();
        }
        let padlen = (6 * self.sections.len()).min(n - 1).max(1);

        // Odd extension about both endpoints.
        let mut ext: Vec<f64> = Vec::with_capacity(n + 2 * padlen);
        let first = signal[0] as f64;
        let last = signal[n - 1] as f64;
        for i in (1..=padlen).rev() {
            ext.push(2.0 * first - signal[i] as f64);
        }
        ext.extend(signal.iter().map(|&v| v as f64));
        for i in 1..=padlen {
            ext.push(2.0 * last - signal[n - 1 - i] as f64);
        }

        self.filter_with_zi(&mut ext);
        ext.reverse();
        self.filter_with_zi(&mut ext);
        ext.reverse();

        ext[padlen..padlen + n].iter().map(|&v| v as f32).collect()
    }

    fn filter_with_zi(&self, data: &mut [f64]) {
        if data.is_empty() {
            return;
        }
        let x0 = data[0];
        // Input to section k is x0 scaled by the DC gains of the sections
        // before it.
        let mut section_input = x0;
        for s in &self.sections {
            let zi = s.unit_zi();
            let mut z1 = zi[0] * section_input;
            let mut z2 = zi[1] * section_input;
            for v in data.iter_mut() {
                let x = *v;
                let y = s.b0 * x + z1;
                z1 = s.b1 * x - s.a1 * y + z2;
                z2 = s.b2 * x - s.a2 * y;
                *v = y;
            }
            section_input *= s.dc_gain();
        }
    }

    /// Magnitude response at `freq` Hz for sampling rate `fs`.
    pub fn magnitude_at(&self, freq: f64, fs: f64) -> f64 {
        let w = 2.0 * std::f64::consts::PI * freq / fs;
        self.sections
            .iter()
            .map(|s| s.response(w).norm())
            .product()
    }

    fn scale_first_section(&mut self, gain: f64) {
        if let Some(first) = self.sections.first_mut() {
            first.b0 *= gain;
            first.b1 *= gain;
            first.b2 *= gain;
        }
    }
}

/// Normalized Butterworth lowpass prototype poles (ωc = 1).
fn butter_prototype(order: usize) -> Vec<Complex64> {
    (0..order)
        .map(|k| {
            let theta =
                std::f64::consts::PI * (2.0 * k as f64 + order as f64 + 1.0) / (2.0 * order as f64);
            Complex64::from_polar(1.0, theta)
        })
        .collect()
}

fn prewarp(freq: f64, fs: f64) -> f64 {
    2.0 * fs * (std::f64::consts::PI * freq / fs).tan()
}

fn bilinear(pole: Complex64, fs: f64) -> Complex64 {
    let fs2 = 2.0 * fs;
    (Complex64::new(fs2, 0.0) + pole) / (Complex64::new(fs2, 0.0) - pole)
}

/// Groups digital poles into conjugate-pair sections with the given numerator
/// applied to every full section (`b_full`) and a first-order numerator for a
/// leftover real pole (`b_single`).
fn sections_from_poles(
    poles: &[Complex64],
    b_full: [f64; 3],
    b_single: [f64; 3],
) -> Vec<Biquad> {
    let tol = 1e-8;
    let mut sections = Vec::new();
    let mut reals: Vec<f64> = poles
        .iter()
        .filter(|p| p.im.abs() <= tol)
        .map(|p| p.re)
        .collect();
    let complex_upper: Vec<Complex64> = poles
        .iter()
        .filter(|p| p.im > tol)
        .copied()
        .collect();

    for p in complex_upper {
        // Denominator from the conjugate pair: 1 - 2 Re(p) z⁻¹ + |p|² z⁻².
        sections.push(Biquad {
            b0: b_full[0],
            b1: b_full[1],
            b2: b_full[2],
            a1: -2.0 * p.re,
            a2: p.norm_sqr(),
        });
    }
    while reals.len() >= 2 {
        if let (Some(p1), Some(p2)) = (reals.pop(), reals.pop()) {
            sections.push(Biquad {
                b0: b_full[0],
                b1: b_full[1],
                b2: b_full[2],
                a1: -(p1 + p2),
                a2: p1 * p2,
            });
        }
    }
    if let Some(p) = reals.pop() {
        sections.push(Biquad {
            b0: b_single[0],
            b1: b_single[1],
            b2: b_single[2],
            a1: -p,
            a2: 0.0,
        });
    }
    sections
}

/// Butterworth bandpass of the given prototype order between `lo` and `hi`
/// Hz. The digital filter has twice the prototype order.
pub fn butter_bandpass(order: usize, lo: f64, hi: f64, fs: f64) -> Result<Sos> {
    if lo <= 0.0 {
        return Err(EngineError::BadParameter(
            "bandpass low edge must be greater than zero".into(),
        ));
    }
    if hi >= fs / 2.0 {
        return Err(EngineError::BadParameter(
            "bandpass high edge must stay below Nyquist".into(),
        ));
    }
    if lo >= hi {
        return Err(EngineError::BadParameter(
            "bandpass edges must satisfy lo < hi".into(),
        ));
    }
    let order = order.max(1);
    let wl = prewarp(lo, fs);
    let wh = prewarp(hi, fs);
    let w0 = (wl * wh).sqrt();
    let bw = wh - wl;

    let mut digital_poles = Vec::with_capacity(order * 2);
    for p in butter_prototype(order) {
        // Each prototype pole maps to the two roots of s² − p·BW·s + ω0² = 0.
        let pb = p * bw;
        let disc = (pb * pb - Complex64::new(4.0 * w0 * w0, 0.0)).sqrt();
        digital_poles.push(bilinear((pb + disc) / 2.0, fs));
        digital_poles.push(bilinear((pb - disc) / 2.0, fs));
    }

    // N zeros at z = 1 and N at z = −1: each section carries 1 − z⁻².
    let mut sos = Sos::from_sections(sections_from_poles(
        &digital_poles,
        [1.0, 0.0, -1.0],
        [1.0, -1.0, 0.0],
    ));
    let center = (lo * hi).sqrt();
    let gain = sos.magnitude_at(center, fs);
    if gain > 0.0 {
        sos.scale_first_section(1.0 / gain);
    }
    Ok(sos)
}

pub fn butter_lowpass(order: usize, cutoff: f64, fs: f64) -> Result<Sos> {
    if cutoff <= 0.0 || cutoff >= fs / 2.0 {
        return Err(EngineError::BadParameter(
            "lowpass cutoff must lie inside (0, Nyquist)".into(),
        ));
    }
    let order = order.max(1);
    let wc = prewarp(cutoff, fs);
    let poles: Vec<Complex64> = butter_prototype(order)
        .into_iter()
        .map(|p| bilinear(p * wc, fs))
        .collect();
    let mut sos = Sos::from_sections(sections_from_poles(
        &poles,
        [1.0, 2.0, 1.0],
        [1.0, 1.0, 0.0],
    ));
    let gain = sos.magnitude_at(0.0, fs);
    if gain > 0.0 {
        sos.scale_first_section(1.0 / gain);
    }
    Ok(sos)
}

pub fn butter_highpass(order: usize, cutoff: f64, fs: f64) -> Result<Sos> {
    if cutoff <= 0.0 || cutoff >= fs / 2.0 {
        return Err(EngineError::BadParameter(
            "highpass cutoff must lie inside (0, Nyquist)".into(),
        ));
    }
    let order = order.max(1);
    let wc = prewarp(cutoff, fs);
    let poles: Vec<Complex64> = butter_prototype(order)
        .into_iter()
        .map(|p| bilinear(Complex64::new(wc, 0.0) / p, fs))
        .collect();
    let mut sos = Sos::from_sections(sections_from_poles(
        &poles,
        [1.0, -2.0, 1.0],
        [1.0, -1.0, 0.0],
    ));
    let gain = sos.magnitude_at(fs / 2.0, fs);
    if gain > 0.0 {
        sos.scale_first_section(1.0 / gain);
    }
    Ok(sos)
}

type NotchKey = (u64, u64, u64);

static NOTCH_CACHE: Lazy<Mutex<HashMap<NotchKey, Biquad>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Cached notch biquad keyed by (frequency, fs, Q).
pub fn cached_notch(f0: f64, fs: f64, q: f64) -> Biquad {
    let key = (
        (f0 * 1000.0).round() as u64,
        (fs * 1000.0).round() as u64,
        (q * 1000.0).round() as u64,
    );
    let mut cache = NOTCH_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    *cache.entry(key).or_insert_with(|| Biquad::notch(f0, fs, q))
}

/// Zero-phase notch cascade at every requested frequency below Nyquist.
pub fn notch_filtfilt(signal: &[f32], freqs: &[f32], fs: f64, q: f64) -> Vec<f32> {
    let sections: Vec<Biquad> = freqs
        .iter()
        .filter(|&&f| (f as f64) < fs / 2.0 && f > 0.0)
        .map(|&f| cached_notch(f as f64, fs, q))
        .collect();
    if sections.is_empty() {
        return signal.to_vec();
    }
    Sos::from_sections(sections).filtfilt(signal)
}

/// Savitzky-Golay smoothing with mirrored edges. `window` is forced odd and
/// at least `polyorder + 2`.
pub fn savgol_smooth(signal: &[f32], window: usize, polyorder: usize) -> Vec<f32> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut window = window.max(polyorder + 2);
    if window % 2 == 0 {
        window += 1;
    }
    if window > n {
        window = if n % 2 == 0 { n.saturating_sub(1) } else { n };
        if window <= polyorder {
            return signal.to_vec();
        }
    }
    let half = window / 2;

    // Least-squares projection row for the window center:
    // h = eᵀ_center · A (AᵀA)⁻¹ Aᵀ with A the Vandermonde over -half..=half.
    let a = DMatrix::from_fn(window, polyorder + 1, |r, c| {
        (r as f64 - half as f64).powi(c as i32)
    });
    let ata = a.transpose() * &a;
    let coeffs = match ata.try_inverse() {
        Some(inv) => {
            let proj = &a * inv * a.transpose();
            proj.row(half).transpose()
        }
        None => return signal.to_vec(),
    };

    let mirrored = |idx: isize| -> f64 {
        let m = n as isize;
        let i = if idx < 0 {
            -idx
        } else if idx >= m {
            2 * (m - 1) - idx
        } else {
            idx
        };
        signal[i.clamp(0, m - 1) as usize] as f64
    };

    (0..n as isize)
        .map(|i| {
            let mut acc = 0.0f64;
            for k in 0..window as isize {
                acc += coeffs[(k as usize, 0)] * mirrored(i + k - half as isize);
            }
            acc as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize, amp: f64) -> Vec<f32> {
        (0..n)
            .map(|i| (amp * (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin()) as f32)
            .collect()
    }

    fn rms(data: &[f32]) -> f64 {
        (data.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / data.len() as f64).sqrt()
    }

    #[test]
    fn notch_attenuates_line_frequency_only() {
        let fs = 250.0;
        let line = sine(50.0, fs, 1000, 10.0);
        let alpha = sine(10.0, fs, 1000, 10.0);
        let filtered_line = notch_filtfilt(&line, &[50.0], fs, 30.0);
        let filtered_alpha = notch_filtfilt(&alpha, &[50.0], fs, 30.0);
        assert!(rms(&filtered_line) < 0.1 * rms(&line));
        assert!(rms(&filtered_alpha) > 0.95 * rms(&alpha));
    }

    #[test]
    fn bandpass_passes_band_and_rejects_stopband() {
        let fs = 250.0;
        let sos = butter_bandpass(4, 0.5, 40.0, fs).unwrap();
        assert!(sos.magnitude_at(10.0, fs) > 0.95);
        assert!(sos.magnitude_at(80.0, fs) < 0.05);
        assert!(sos.magnitude_at(0.05, fs) < 0.2);
    }

    #[test]
    fn bandpass_rejects_bad_edges() {
        assert!(butter_bandpass(4, 0.0, 40.0, 250.0).is_err());
        assert!(butter_bandpass(4, 1.0, 125.0, 250.0).is_err());
        assert!(butter_bandpass(4, 30.0, 10.0, 250.0).is_err());
    }

    #[test]
    fn filtfilt_is_zero_phase_on_symmetric_input() {
        // A symmetric pulse must stay symmetric through filtfilt.
        let fs = 250.0;
        let n = 501;
        let center = n / 2;
        let signal: Vec<f32> = (0..n)
            .map(|i| {
                let d = (i as f64 - center as f64) / 20.0;
                (-d * d).exp() as f32
            })
            .collect();
        let sos = butter_bandpass(4, 0.5, 40.0, fs).unwrap();
        let out = sos.filtfilt(&signal);
        for k in 1..center {
            let diff = (out[center - k] - out[center + k]).abs();
            assert!(diff < 1e-3, "asymmetry {diff} at lag {k}");
        }
    }

    #[test]
    fn filtfilt_preserves_in_band_tone() {
        let fs = 250.0;
        let signal = sine(10.0, fs, 1000, 5.0);
        let sos = butter_bandpass(4, 0.5, 40.0, fs).unwrap();
        let out = sos.filtfilt(&signal);
        let mid_rms = rms(&out[200..800]);
        assert!((mid_rms - rms(&signal[200..800])).abs() / rms(&signal[200..800]) < 0.05);
    }

    #[test]
    fn lowpass_and_highpass_split_spectrum() {
        let fs = 250.0;
        let low_tone = sine(2.0, fs, 1000, 1.0);
        let high_tone = sine(60.0, fs, 1000, 1.0);
        let lp = butter_lowpass(4, 5.0, fs).unwrap();
        let hp = butter_highpass(4, 20.0, fs).unwrap();
        assert!(rms(&lp.filtfilt(&low_tone)) > 0.9);
        assert!(rms(&lp.filtfilt(&high_tone)) < 0.05);
        assert!(rms(&hp.filtfilt(&high_tone)) > 0.9);
        assert!(rms(&hp.filtfilt(&low_tone)) < 0.05);
    }

    #[test]
    fn notch_cache_returns_identical_coefficients() {
        let a = cached_notch(50.0, 250.0, 30.0);
        let b = cached_notch(50.0, 250.0, 30.0);
        assert_eq!(a, b);
    }

    #[test]
    fn savgol_tracks_smooth_signal() {
        let fs = 100.0;
        let clean = sine(2.0, fs, 200, 10.0);
        let smoothed = savgol_smooth(&clean, 11, 3);
        for (c, s) in clean.iter().zip(&smoothed).skip(10).take(180) {
            assert!((c - s).abs() < 0.5);
        }
    }
}
