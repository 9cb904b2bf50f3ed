//! Frequency-domain features from Welch spectra: band powers, spectral
//! shape, ratios and per-band Hilbert phase statistics.

use ndarray::Array2;
use rayon::prelude::*;

use crate::dsp::filter::butter_bandpass;
use crate::dsp::hilbert::instantaneous_phase;
use crate::dsp::stats::distribution_entropy;
use crate::dsp::{band_power, simpson, welch_psd};
use crate::types::FeatureBundle;

pub const BANDS: [(&str, f64, f64); 6] = [
    ("delta", 0.5, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma_low", 30.0, 50.0),
    ("gamma_high", 50.0, 100.0),
];

const SPECTRAL_ENTROPY_GATE: f32 = 0.6;
const PHASE_ENTROPY_BINS: usize = 20;

struct ChannelSpectrum {
    band_powers: Vec<f64>,
    total_power: f64,
    peak_frequency: f64,
    centroid: f64,
    bandwidth: f64,
    edge_95: f64,
    spectral_entropy: f64,
}

fn channel_spectrum(row: &[f32], fs: f64) -> ChannelSpectrum {
    let nperseg = ((2.0 * fs) as usize).min(row.len()).max(8);
    let (freqs, psd) = welch_psd(row, fs, nperseg);
    let cap = (fs / 2.0).min(100.0);

    // Restrict to the analysis range before shape statistics.
    let in_range: Vec<(f64, f64)> = freqs
        .iter()
        .zip(&psd)
        .filter(|(f, _)| **f >= 0.5 && **f <= cap)
        .map(|(f, p)| (*f, *p))
        .collect();

    let band_powers: Vec<f64> = BANDS
        .iter()
        .map(|(_, lo, hi)| {
            if *lo >= cap {
                0.0
            } else {
                band_power(&freqs, &psd, *lo, (*hi).min(cap)).max(0.0)
            }
        })
        .collect();

    let total_power = if in_range.len() >= 2 {
        let dx = in_range[1].0 - in_range[0].0;
        simpson(&in_range.iter().map(|(_, p)| *p).collect::<Vec<_>>(), dx).max(0.0)
    } else {
        0.0
    };

    let peak_frequency = in_range
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(f, _)| *f)
        .unwrap_or(0.0);

    let psd_sum: f64 = in_range.iter().map(|(_, p)| *p).sum();
    let centroid = if psd_sum > 0.0 {
        in_range.iter().map(|(f, p)| f * p).sum::<f64>() / psd_sum
    } else {
        0.0
    };
    let bandwidth = if psd_sum > 0.0 {
        (in_range
            .iter()
            .map(|(f, p)| (f - centroid).powi(2) * p)
            .sum::<f64>()
            / psd_sum)
            .sqrt()
    } else {
        0.0
    };

    let mut edge_95 = 0.0;
    if psd_sum > 0.0 {
        let mut cumulative = 0.0;
        for (f, p) in &in_range {
            cumulative += p;
            if cumulative >= 0.95 * psd_sum {
                edge_95 = *f;
                break;
            }
        }
    }

    let spectral_entropy = if psd_sum > 0.0 {
        let dist: Vec<f64> = in_range.iter().map(|(_, p)| p / psd_sum).collect();
        distribution_entropy(&dist)
    } else {
        0.0
    };

    ChannelSpectrum {
        band_powers,
        total_power,
        peak_frequency,
        centroid,
        bandwidth,
        edge_95,
        spectral_entropy,
    }
}

/// Circular mean and histogram entropy of the instantaneous phase within one
/// band.
fn phase_features(row: &[f32], fs: f64, lo: f64, hi: f64) -> Option<(f32, f32)> {
    let sos = butter_bandpass(4, lo, hi, fs).ok()?;
    let banded = sos.filtfilt(row);
    let phase = instantaneous_phase(&banded);
    if phase.is_empty() {
        return None;
    }
    let (mut sin_sum, mut cos_sum) = (0.0f64, 0.0f64);
    for &p in &phase {
        sin_sum += p.sin();
        cos_sum += p.cos();
    }
    let circular_mean = sin_sum.atan2(cos_sum) as f32;

    let mut counts = vec![0usize; PHASE_ENTROPY_BINS];
    let bin_width = 2.0 * std::f64::consts::PI / PHASE_ENTROPY_BINS as f64;
    for &p in &phase {
        let idx = (((p + std::f64::consts::PI) / bin_width) as usize)
            .min(PHASE_ENTROPY_BINS - 1);
        counts[idx] += 1;
    }
    let total = phase.len() as f64;
    let dist: Vec<f64> = counts.iter().map(|&c| c as f64 / total).collect();
    Some((circular_mean, distribution_entropy(&dist) as f32))
}

pub fn extract(data: &Array2<f32>, sampling_rate: f32, quality_score: f32) -> FeatureBundle {
    let channels = data.nrows();
    let fs = sampling_rate as f64;

    let spectra: Vec<ChannelSpectrum> = (0..channels)
        .into_par_iter()
        .map(|ch| {
            let row: Vec<f32> = data.row(ch).iter().copied().collect();
            channel_spectrum(&row, fs)
        })
        .collect();

    let mut bundle = FeatureBundle::new();
    for (b, (name, _, _)) in BANDS.iter().enumerate() {
        let absolute: Vec<f32> = spectra.iter().map(|s| s.band_powers[b] as f32).collect();
        let relative: Vec<f32> = spectra
            .iter()
            .map(|s| {
                if s.total_power > 0.0 {
                    (s.band_powers[b] / s.total_power) as f32
                } else {
                    0.0
                }
            })
            .collect();
        bundle.insert(format!("{name}_power"), absolute);
        bundle.insert(format!("{name}_relative_power"), relative);
    }
    bundle.insert(
        "total_power".into(),
        spectra.iter().map(|s| s.total_power as f32).collect(),
    );
    bundle.insert(
        "peak_frequency".into(),
        spectra.iter().map(|s| s.peak_frequency as f32).collect(),
    );
    bundle.insert(
        "spectral_centroid".into(),
        spectra.iter().map(|s| s.centroid as f32).collect(),
    );
    bundle.insert(
        "spectral_bandwidth".into(),
        spectra.iter().map(|s| s.bandwidth as f32).collect(),
    );
    bundle.insert(
        "spectral_edge_95".into(),
        spectra.iter().map(|s| s.edge_95 as f32).collect(),
    );

    // Band ratios, guarded against silent channels.
    let band_index = |name: &str| BANDS.iter().position(|(n, _, _)| *n == name).unwrap_or(0);
    let ratio = |num: usize, den: usize| -> Vec<f32> {
        spectra
            .iter()
            .map(|s| (s.band_powers[num] / (s.band_powers[den] + 1e-10)) as f32)
            .collect()
    };
    let (delta, theta, alpha, beta) = (
        band_index("delta"),
        band_index("theta"),
        band_index("alpha"),
        band_index("beta"),
    );
    bundle.insert("theta_alpha_ratio".into(), ratio(theta, alpha));
    bundle.insert("theta_beta_ratio".into(), ratio(theta, beta));
    bundle.insert("alpha_beta_ratio".into(), ratio(alpha, beta));
    bundle.insert(
        "slow_fast_ratio".into(),
        spectra
            .iter()
            .map(|s| {
                ((s.band_powers[delta] + s.band_powers[theta])
                    / (s.band_powers[alpha] + s.band_powers[beta] + 1e-10))
                    as f32
            })
            .collect(),
    );

    if quality_score > SPECTRAL_ENTROPY_GATE {
        bundle.insert(
            "spectral_entropy".into(),
            spectra.iter().map(|s| s.spectral_entropy as f32).collect(),
        );
    }

    // Hemispheric asymmetry per band over the front/back montage split.
    if channels >= 4 {
        let half = channels / 2;
        for (b, (name, _, _)) in BANDS.iter().enumerate() {
            let left: f64 = spectra[..half].iter().map(|s| s.band_powers[b]).sum();
            let right: f64 = spectra[half..].iter().map(|s| s.band_powers[b]).sum();
            let asymmetry = (left - right) / (left + right + 1e-10);
            bundle.insert(format!("{name}_asymmetry"), vec![asymmetry as f32]);
        }
    }

    // Per-band phase structure from the analytic signal.
    let nyquist = fs / 2.0;
    for (name, lo, hi) in BANDS {
        if hi >= nyquist {
            continue;
        }
        let phases: Option<Vec<(f32, f32)>> = (0..channels)
            .into_par_iter()
            .map(|ch| {
                let row: Vec<f32> = data.row(ch).iter().copied().collect();
                phase_features(&row, fs, lo, hi)
            })
            .collect();
        if let Some(phases) = phases {
            bundle.insert(
                format!("{name}_phase_mean"),
                phases.iter().map(|p| p.0).collect(),
            );
            bundle.insert(
                format!("{name}_phase_entropy"),
                phases.iter().map(|p| p.1).collect(),
            );
        }
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn alpha_matrix(channels: usize, n: usize) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(31);
        Array2::from_shape_fn((channels, n), |(_, i)| {
            let alpha =
                30.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0).sin() as f32;
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen_range(0.0..1.0);
            let noise =
                ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32;
            alpha + 2.0 * noise
        })
    }

    #[test]
    fn alpha_tone_peaks_in_the_alpha_band() {
        let data = alpha_matrix(8, 500);
        let bundle = extract(&data, 250.0, 1.0);
        for ch in 0..8 {
            let peak = bundle["peak_frequency"][ch];
            assert!((9.5..=10.5).contains(&peak), "peak {peak}");
            let relative = bundle["alpha_relative_power"][ch];
            assert!(relative > 0.6, "alpha relative {relative}");
        }
    }

    #[test]
    fn relative_powers_sum_below_one() {
        let data = alpha_matrix(4, 500);
        let bundle = extract(&data, 250.0, 1.0);
        for ch in 0..4 {
            let sum: f32 = BANDS
                .iter()
                .map(|(name, _, _)| bundle[&format!("{name}_relative_power")][ch])
                .sum();
            assert!(sum <= 1.1, "sum {sum}");
        }
    }

    #[test]
    fn spectral_entropy_is_gated() {
        let data = alpha_matrix(4, 500);
        assert!(!extract(&data, 250.0, 0.5).contains_key("spectral_entropy"));
        assert!(extract(&data, 250.0, 0.9).contains_key("spectral_entropy"));
    }

    #[test]
    fn tone_has_lower_spectral_entropy_than_noise() {
        let tone = alpha_matrix(2, 500);
        let mut rng = StdRng::seed_from_u64(32);
        let noise = Array2::from_shape_fn((2, 500), |_| rng.gen_range(-30.0f32..30.0));
        let tone_entropy = extract(&tone, 250.0, 1.0)["spectral_entropy"][0];
        let noise_entropy = extract(&noise, 250.0, 1.0)["spectral_entropy"][0];
        assert!(noise_entropy > tone_entropy);
    }

    #[test]
    fn band_ratios_favor_alpha_for_an_alpha_tone() {
        let data = alpha_matrix(2, 500);
        let bundle = extract(&data, 250.0, 1.0);
        assert!(bundle["alpha_beta_ratio"][0] > 2.0);
        assert!(bundle["theta_alpha_ratio"][0] < 0.5);
    }

    #[test]
    fn phase_features_exist_for_in_nyquist_bands() {
        let data = alpha_matrix(2, 500);
        let bundle = extract(&data, 250.0, 1.0);
        assert!(bundle.contains_key("alpha_phase_mean"));
        assert!(bundle.contains_key("alpha_phase_entropy"));
        assert_eq!(bundle["alpha_phase_entropy"].len(), 2);
    }

    #[test]
    fn asymmetry_reflects_lateralized_power()  {
        let mut data = alpha_matrix(8, 500);
        // Attenuate the back half of the montage.
        for ch in 4..8 {
            for i in 0..500 {
                data[[ch, i]] *= 0.2;
            }
        }
        let bundle = extract(&data, 250.0, 1.0);
        assert!(bundle["alpha_asymmetry"][0] > 0.3);
    }
}
