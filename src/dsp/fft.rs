//! Spectral estimation built on rustfft: Hann-windowed Welch averaging,
//! single-segment periodograms and band integration.

use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;

/// Periodic Hann window of length `n`.
pub fn hann(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n as f64).cos()))
        .collect()
}

pub fn fft_forward(buffer: &mut [Complex64]) {
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(buffer.len());
    fft.process(buffer);
}

pub fn fft_inverse(buffer: &mut [Complex64]) {
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_inverse(buffer.len());
    fft.process(buffer);
    let scale = 1.0 / buffer.len() as f64;
    for v in buffer.iter_mut() {
        *v *= scale;
    }
}

/// One-sided Welch power spectral density with Hann window and 50% overlap.
/// Returns (frequencies, density); density units are signal²/Hz.
pub fn welch_psd(signal: &[f32], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    let spectra = welch_segments(signal, nperseg);
    finish_psd(spectra, signal.len().min(nperseg), fs, |x| x.norm_sqr())
}

/// One-sided Welch cross spectral density between two equal-length signals.
pub fn welch_csd(x: &[f32], y: &[f32], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<Complex64>) {
    let n = x.len().min(y.len());
    if n < 4 {
        return (vec![0.0], vec![Complex64::new(0.0, 0.0)]);
    }
    let nperseg = nperseg.min(n).max(2);
    let step = (nperseg / 2).max(1);
    let window = hann(nperseg);
    let u: f64 = window.iter().map(|w| w * w).sum::<f64>() * fs;

    let mut acc = vec![Complex64::new(0.0, 0.0); nperseg];
    let mut segments = 0usize;
    let mut start = 0usize;
    while start + nperseg <= n {
        let sx = windowed_segment(&x[start..start + nperseg], &window);
        let sy = windowed_segment(&y[start..start + nperseg], &window);
        let mut bx = sx;
        let mut by = sy;
        fft_forward(&mut bx);
        fft_forward(&mut by);
        for i in 0..nperseg {
            acc[i] += bx[i].conj() * by[i];
        }
        segments += 1;
        start += step;
    }
    if segments == 0 {
        // Signal shorter than one segment: single zero-padded segment.
        let window = hann(n.max(2));
        let mut bx = windowed_segment(&x[..n], &window);
        let mut by = windowed_segment(&y[..n], &window);
        fft_forward(&mut bx);
        fft_forward(&mut by);
        let u: f64 = window.iter().map(|w| w * w).sum::<f64>() * fs;
        let half = n.max(2) / 2 + 1;
        let freqs: Vec<f64> = (0..half).map(|i| i as f64 * fs / n.max(2) as f64).collect();
        let mut csd = Vec::with_capacity(half);
        for i in 0..half {
            let mut v = bx[i].conj() * by[i] / u;
            if i != 0 && !(n.max(2) % 2 == 0 && i == half - 1) {
                v *= 2.0;
            }
            csd.push(v);
        }
        return (freqs, csd);
    }

    let half = nperseg / 2 + 1;
    let freqs: Vec<f64> = (0..half).map(|i| i as f64 * fs / nperseg as f64).collect();
    let mut csd = Vec::with_capacity(half);
    for i in 0..half {
        let mut v = acc[i] / (segments as f64 * u);
        if i != 0 && !(nperseg % 2 == 0 && i == half - 1) {
            v *= 2.0;
        }
        csd.push(v);
    }
    (freqs, csd)
}

/// Single-segment Hann periodogram, one-sided.
pub fn periodogram(signal: &[f32], fs: f64) -> (Vec<f64>, Vec<f64>) {
    welch_psd(signal, fs, signal.len().max(2))
}

fn welch_segments(signal: &[f32], nperseg: usize) -> (Vec<Vec<Complex64>>, Vec<f64>) {
    let n = signal.len();
    let nperseg = nperseg.min(n).max(2);
    let step = (nperseg / 2).max(1);
    let window = hann(nperseg);

    let mut spectra = Vec::new();
    let mut start = 0usize;
    while start + nperseg <= n {
        let mut seg = windowed_segment(&signal[start..start + nperseg], &window);
        fft_forward(&mut seg);
        spectra.push(seg);
        start += step;
    }
    if spectra.is_empty() {
        let mut seg = windowed_segment(signal, &window);
        seg.resize(nperseg, Complex64::new(0.0, 0.0));
        fft_forward(&mut seg);
        spectra.push(seg);
    }
    (spectra, window)
}

fn finish_psd(
    (spectra, window): (Vec<Vec<Complex64>>, Vec<f64>),
    nperseg: usize,
    fs: f64,
    power: impl Fn(&Complex64) -> f64,
) -> (Vec<f64>, Vec<f64>) {
    let nperseg = nperseg.max(2);
    let u: f64 = window.iter().map(|w| w * w).sum::<f64>() * fs;
    let half = nperseg / 2 + 1;
    let freqs: Vec<f64> = (0..half).map(|i| i as f64 * fs / nperseg as f64).collect();
    let mut psd = vec![0.0f64; half];
    for seg in &spectra {
        for i in 0..half {
            psd[i] += power(&seg[i]);
        }
    }
    let segments = spectra.len() as f64;
    for (i, v) in psd.iter_mut().enumerate() {
        *v /= segments * u;
        if i != 0 && !(nperseg % 2 == 0 && i == half - 1) {
            *v *= 2.0;
        }
    }
    (freqs, psd)
}

/// Mean-detrended, Hann-weighted complex segment.
fn windowed_segment(signal: &[f32], window: &[f64]) -> Vec<Complex64> {
    let n = signal.len();
    let mean = if n > 0 {
        signal.iter().map(|&v| v as f64).sum::<f64>() / n as f64
    } else {
        0.0
    };
    signal
        .iter()
        .zip(window)
        .map(|(&v, &w)| Complex64::new((v as f64 - mean) * w, 0.0))
        .collect()
}

/// Composite Simpson integration over uniformly spaced samples. Falls back to
/// a trapezoid for the final interval when the sample count is even.
pub fn simpson(y: &[f64], dx: f64) -> f64 {
    let n = y.len();
    if n < 2 {
        return 0.0;
    }
    if n == 2 {
        return dx * (y[0] + y[1]) / 2.0;
    }
    let odd_count = if n % 2 == 1 { n } else { n - 1 };
    let mut sum = y[0] + y[odd_count - 1];
    for (i, &v) in y.iter().enumerate().take(odd_count - 1).skip(1) {
        sum += if i % 2 == 1 { 4.0 * v } else { 2.0 * v };
    }
    let mut total = sum * dx / 3.0;
    if n % 2 == 0 {
        total += dx * (y[n - 2] + y[n - 1]) / 2.0;
    }
    total
}

/// Integrated band power over `[lo, hi]` Hz from a PSD.
pub fn band_power(freqs: &[f64], psd: &[f64], lo: f64, hi: f64) -> f64 {
    let band: Vec<(f64, f64)> = freqs
        .iter()
        .zip(psd)
        .filter(|(f, _)| **f >= lo && **f <= hi)
        .map(|(f, p)| (*f, *p))
        .collect();
    if band.len() < 2 {
        return band.first().map(|(_, p)| *p).unwrap_or(0.0);
    }
    let dx = band[1].0 - band[0].0;
    let values: Vec<f64> = band.iter().map(|(_, p)| *p).collect();
    simpson(&values, dx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amp * (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin() as f32)
            .collect()
    }

    #[test]
    fn welch_peak_lands_on_the_tone() {
        let fs = 250.0;
        let signal = sine(10.0, fs, 1000, 30.0);
        let (freqs, psd) = welch_psd(&signal, fs, 500);
        let peak = psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| freqs[i])
            .unwrap();
        assert!((peak - 10.0).abs() <= 0.5, "peak at {peak}");
    }

    #[test]
    fn welch_total_power_approximates_variance() {
        // Parseval: integrated density ≈ signal variance for a pure tone.
        let fs = 250.0;
        let signal = sine(10.0, fs, 2000, 2.0);
        let (freqs, psd) = welch_psd(&signal, fs, 500);
        let dx = freqs[1] - freqs[0];
        let total = simpson(&psd, dx);
        let var = 2.0f64 * 2.0 / 2.0; // amp²/2
        assert!((total - var).abs() / var < 0.15, "total {total}");
    }

    #[test]
    fn simpson_integrates_a_parabola_exactly() {
        // ∫₀⁴ x² dx = 64/3 with dx = 1.
        let y: Vec<f64> = (0..=4).map(|x| (x * x) as f64).collect();
        assert!((simpson(&y, 1.0) - 64.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn band_power_concentrates_around_tone() {
        let fs = 250.0;
        let signal = sine(10.0, fs, 2000, 30.0);
        let (freqs, psd) = welch_psd(&signal, fs, 500);
        let alpha = band_power(&freqs, &psd, 8.0, 13.0);
        let total = band_power(&freqs, &psd, 0.5, 100.0);
        assert!(alpha / total > 0.9);
    }

    #[test]
    fn csd_of_identical_signals_is_real_psd() {
        let fs = 100.0;
        let signal = sine(7.0, fs, 500, 1.0);
        let (freqs, psd) = welch_psd(&signal, fs, 100);
        let (freqs2, csd) = welch_csd(&signal, &signal, fs, 100);
        assert_eq!(freqs.len(), freqs2.len());
        for (p, c) in psd.iter().zip(&csd) {
            assert!((p - c.re).abs() < 1e-9);
            assert!(c.im.abs() < 1e-9);
        }
    }
}
