//! Analytic-signal computation and instantaneous quantities.

use rustfft::num_complex::Complex64;

use super::fft::{fft_forward, fft_inverse};

/// Analytic signal via the frequency-domain Hilbert transformer.
pub fn analytic(signal: &[f32]) -> Vec<Complex64> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut buf: Vec<Complex64> = signal
        .iter()
        .map(|&v| Complex64::new(v as f64, 0.0))
        .collect();
    fft_forward(&mut buf);
    // Zero negative frequencies, double positive ones; DC and Nyquist stay.
    let half = n / 2;
    for (i, v) in buf.iter_mut().enumerate() {
        if i == 0 || (n % 2 == 0 && i == half) {
            continue;
        } else if i < half || (n % 2 == 1 && i <= half) {
            *v *= 2.0;
        } else {
            *v = Complex64::new(0.0, 0.0);
        }
    }
    fft_inverse(&mut buf);
    buf
}

pub fn envelope(signal: &[f32]) -> Vec<f32> {
    analytic(signal).iter().map(|c| c.norm() as f32).collect()
}

pub fn instantaneous_phase(signal: &[f32]) -> Vec<f64> {
    analytic(signal).iter().map(|c| c.arg()).collect()
}

pub fn unwrap_phase(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let mut offset = 0.0f64;
    for (i, &p) in phase.iter().enumerate() {
        if i > 0 {
            let d = p - phase[i - 1];
            if d > std::f64::consts::PI {
                offset -= 2.0 * std::f64::consts::PI;
            } else if d < -std::f64::consts::PI {
                offset += 2.0 * std::f64::consts::PI;
            }
        }
        out.push(p + offset);
    }
    out
}

/// Instantaneous frequency in Hz from the unwrapped phase derivative;
/// length is `signal.len() - 1`.
pub fn instantaneous_frequency(signal: &[f32], fs: f64) -> Vec<f64> {
    let unwrapped = unwrap_phase(&instantaneous_phase(signal));
    unwrapped
        .windows(2)
        .map(|w| (w[1] - w[0]) * fs / (2.0 * std::f64::consts::PI))
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

    #[test]
    fn envelope_of_a_tone_is_its_amplitude() {
        let signal = sine(10.0, 250.0, 1000, 3.0);
        let env = envelope(&signal);
        // Away from the edges, the envelope hugs the amplitude.
        for &v in &env[100..900] {
            assert!((v - 3.0).abs() < 0.15, "envelope {v}");
        }
    }

    #[test]
    fn instantaneous_frequency_tracks_the_tone() {
        let fs = 250.0;
        let signal = sine(12.0, fs, 1000, 1.0);
        let freq = instantaneous_frequency(&signal, fs);
        let mid = &freq[100..880];
        let mean = mid.iter().sum::<f64>() / mid.len() as f64;
        assert!((mean - 12.0).abs() < 0.3, "mean inst freq {mean}");
    }

    #[test]
    fn unwrap_removes_jumps() {
        let phase: Vec<f64> = (0..100)
            .map(|i| {
                let p = 0.3 * i as f64;
                (p + std::f64::consts::PI).rem_euclid(2.0 * std::f64::consts::PI)
                    - std::f64::consts::PI
            })
            .collect();
        let unwrapped = unwrap_phase(&phase);
        for w in unwrapped.windows(2) {
            assert!((w[1] - w[0] - 0.3).abs() < 1e-9);
        }
    }
}
