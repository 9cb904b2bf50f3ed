//! Time-frequency features: discrete wavelets, wavelet packets, Morlet CWT,
//! Hilbert envelope dynamics, Stockwell band energies and a simplified
//! Hilbert-Huang decomposition.

use std::collections::BTreeMap;

use ndarray::Array2;
use rayon::prelude::*;

use crate::dsp::filter::{butter_bandpass, butter_highpass, butter_lowpass};
use crate::dsp::hilbert::{analytic, instantaneous_frequency};
use crate::dsp::stats::{mean, pearson, skewness, std_dev};
use crate::dsp::wavelet::{best_basis, morlet_cwt, stockwell_band, wavedec, wavelet_packet};
use crate::types::FeatureBundle;

const DWT_MAX_LEVELS: usize = 5;
const PACKET_DEPTH: usize = 4;
const CWT_QUALITY_GATE: f32 = 0.7;
const MORLET_OMEGA0: f64 = 6.0;

const STOCKWELL_BANDS: [(&str, f64, f64); 5] = [
    ("delta", 0.5, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma", 30.0, 50.0),
];

fn coefficient_entropy(coeffs: &[f64]) -> f32 {
    let total: f64 = coeffs.iter().map(|c| c * c).sum();
    if total <= f64::EPSILON {
        return 0.0;
    }
    -coeffs
        .iter()
        .map(|c| {
            let p = c * c / total;
            if p > 0.0 {
                p * p.ln()
            } else {
                0.0
            }
        })
        .sum::<f64>() as f32
}

fn channel_features(
    row: &[f32],
    fs: f64,
    morlet_frequencies: &[f32],
    quality_score: f32,
) -> BTreeMap<String, f32> {
    let mut out = BTreeMap::new();

    // Multi-level DWT energies.
    let (approx, details) = wavedec(row, DWT_MAX_LEVELS);
    let levels = details.len();
    if levels > 0 {
        let approx_energy: f64 = approx.iter().map(|c| c * c).sum();
        let mut total_energy = approx_energy;
        out.insert(
            format!("dwt_approx_{levels}_energy"),
            approx_energy as f32,
        );
        out.insert(format!("dwt_approx_{levels}_std"), {
            let v: Vec<f32> = approx.iter().map(|&c| c as f32).collect();
            std_dev(&v)
        });
        out.insert(
            format!("dwt_approx_{levels}_entropy"),
            coefficient_entropy(&approx),
        );
        for (i, detail) in details.iter().enumerate() {
            let level = i + 1;
            let energy: f64 = detail.iter().map(|c| c * c).sum();
            total_energy += energy;
            out.insert(format!("dwt_detail_{level}_energy"), energy as f32);
            out.insert(format!("dwt_detail_{level}_std"), {
                let v: Vec<f32> = detail.iter().map(|&c| c as f32).collect();
                std_dev(&v)
            });
            out.insert(
                format!("dwt_detail_{level}_entropy"),
                coefficient_entropy(detail),
            );
        }
        if total_energy > f64::EPSILON {
            out.insert(
                format!("dwt_approx_{levels}_rel_energy"),
                (approx_energy / total_energy) as f32,
            );
            for (i, detail) in details.iter().enumerate() {
                let level = i + 1;
                let energy: f64 = detail.iter().map(|c| c * c).sum();
                out.insert(
                    format!("dwt_detail_{level}_rel_energy"),
                    (energy / total_energy) as f32,
                );
            }
        }
    }

    // Wavelet packets with best-basis entropy.
    let tree = wavelet_packet(row, PACKET_DEPTH);
    if let Some(leaves) = tree.last() {
        let energies: Vec<f32> = leaves.iter().map(|n| n.energy() as f32).collect();
        if !energies.is_empty() {
            out.insert("wp_energy_mean".into(), mean(&energies));
            out.insert("wp_energy_std".into(), std_dev(&energies));
        }
    }
    let (basis, cost) = best_basis(&tree);
    if !basis.is_empty() {
        out.insert("wp_best_basis_entropy".into(), cost as f32);
    }

    // Morlet rows at the configured center frequencies.
    if quality_score > CWT_QUALITY_GATE {
        for &freq in morlet_frequencies {
            if (freq as f64) >= fs / 2.0 || freq <= 0.0 {
                continue;
            }
            let cwt = morlet_cwt(row, freq as f64, fs, MORLET_OMEGA0);
            if cwt.is_empty() {
                continue;
            }
            let amplitudes: Vec<f32> = cwt.iter().map(|c| c.norm() as f32).collect();
            let power =
                cwt.iter().map(|c| c.norm_sqr()).sum::<f64>() / cwt.len() as f64;
            let (mut sin_sum, mut cos_sum) = (0.0f64, 0.0f64);
            for c in &cwt {
                let p = c.arg();
                sin_sum += p.sin();
                cos_sum += p.cos();
            }
            let consistency =
                ((sin_sum / cwt.len() as f64).powi(2) + (cos_sum / cwt.len() as f64).powi(2))
                    .sqrt();
            let tag = freq.round() as i64;
            out.insert(format!("morlet_{tag}hz_power"), power as f32);
            out.insert(format!("morlet_{tag}hz_amplitude_std"), std_dev(&amplitudes));
            out.insert(
                format!("morlet_{tag}hz_phase_consistency"),
                consistency as f32,
            );
        }
    }

    // Broadband Hilbert dynamics.
    let analytic_signal = analytic(row);
    if !analytic_signal.is_empty() {
        let amplitude: Vec<f32> = analytic_signal.iter().map(|c| c.norm() as f32).collect();
        out.insert("hilbert_amplitude_mean".into(), mean(&amplitude));
        out.insert("hilbert_amplitude_std".into(), std_dev(&amplitude));
        out.insert("hilbert_amplitude_skew".into(), skewness(&amplitude));
        let inst_freq: Vec<f32> = instantaneous_frequency(row, fs)
            .into_iter()
            .map(|f| f as f32)
            .collect();
        if !inst_freq.is_empty() {
            out.insert("hilbert_freq_mean".into(), mean(&inst_freq));
            out.insert("hilbert_freq_std".into(), std_dev(&inst_freq));
            out.insert(
                "hilbert_amp_freq_correlation".into(),
                pearson(&amplitude[..inst_freq.len()], &inst_freq),
            );
        }
    }

    // Stockwell band power and time-frequency entropy.
    for (name, lo, hi) in STOCKWELL_BANDS {
        if lo >= fs / 2.0 {
            continue;
        }
        let rows = stockwell_band(row, fs, lo, hi.min(fs / 2.0 - 1.0));
        if rows.is_empty() {
            continue;
        }
        let magnitudes: Vec<f64> = rows
            .iter()
            .flat_map(|(_, voice)| voice.iter().map(|c| c.norm_sqr()))
            .collect();
        let power = magnitudes.iter().sum::<f64>() / magnitudes.len() as f64;
        let total: f64 = magnitudes.iter().sum();
        let entropy = if total > f64::EPSILON {
            -magnitudes
                .iter()
                .map(|&v| {
                    let p = v / total;
                    if p > 0.0 {
                        p * p.ln()
                    } else {
                        0.0
                    }
                })
                .sum::<f64>()
        } else {
            0.0
        };
        out.insert(format!("stockwell_{name}_power"), power as f32);
        out.insert(format!("stockwell_{name}_complexity"), entropy as f32);
    }

    // Simplified Hilbert-Huang: three banded "IMFs".
    hht_features(row, fs, &mut out);
    out
}

/// Three-band surrogate for empirical mode decomposition: slow (<5 Hz),
/// mid (5–20 Hz) and fast (>20 Hz) components.
fn hht_features(row: &[f32], fs: f64, out: &mut BTreeMap<String, f32>) {
    let nyquist = fs / 2.0;
    if nyquist <= 25.0 || row.len() < 32 {
        return;
    }
    let imfs: Vec<Vec<f32>> = [
        butter_lowpass(4, 5.0, fs).map(|s| s.filtfilt(row)),
        butter_bandpass(4, 5.0, 20.0, fs).map(|s| s.filtfilt(row)),
        butter_highpass(4, 20.0, fs).map(|s| s.filtfilt(row)),
    ]
    .into_iter()
    .flatten()
    .collect();
    if imfs.len() != 3 {
        return;
    }
    let energies: Vec<f64> = imfs
        .iter()
        .map(|imf| imf.iter().map(|&v| (v as f64).powi(2)).sum())
        .collect();
    let total: f64 = energies.iter().sum();
    if total <= f64::EPSILON {
        return;
    }
    for (i, energy) in energies.iter().enumerate() {
        out.insert(
            format!("hhs_imf_{}_energy_ratio", i + 1),
            (energy / total) as f32,
        );
    }

    // Marginal spectrum: amplitude-weighted instantaneous-frequency
    // histogram across the IMFs; the peak bin is the dominant rhythm.
    let bins = nyquist.floor() as usize;
    let mut marginal = vec![0.0f64; bins.max(1)];
    for imf in &imfs {
        let amplitude: Vec<f64> = analytic(imf).iter().map(|c| c.norm()).collect();
        for (i, f) in instantaneous_frequency(imf, fs).into_iter().enumerate() {
            if f.is_finite() && f >= 0.0 {
                let idx = (f as usize).min(marginal.len() - 1);
                marginal[idx] += amplitude[i];
            }
        }
    }
    let peak = marginal
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as f32 + 0.5)
        .unwrap_or(0.0);
    out.insert("hhs_marginal_spectrum_peak".into(), peak);
}

pub fn extract(
    data: &Array2<f32>,
    sampling_rate: f32,
    morlet_frequencies: &[f32],
    quality_score: f32,
) -> FeatureBundle {
    let channels = data.nrows();
    let fs = sampling_rate as f64;
    let per_channel: Vec<BTreeMap<String, f32>> = (0..channels)
        .into_par_iter()
        .map(|ch| {
            let row: Vec<f32> = data.row(ch).iter().copied().collect();
            channel_features(&row, fs, morlet_frequencies, quality_score)
        })
        .collect();

    let mut bundle = FeatureBundle::new();
    if let Some(first) = per_channel.first() {
        for key in first.keys() {
            let values: Vec<f32> = per_channel
                .iter()
                .map(|m| m.get(key).copied().unwrap_or(0.0))
                .collect();
            bundle.insert(key.clone(), values);
        }
    }
    bundle
}
