//! Time-domain features: distribution moments, amplitude descriptors and,
//! when the window is clean enough, nonlinear complexity measures.

use std::collections::BTreeMap;

use ndarray::Array2;
use rayon::prelude::*;

use crate::dsp::hilbert::envelope;
use crate::dsp::stats::{
    histogram_entropy, kurtosis, mad, mean, peak_to_peak, percentile, rms, skewness, std_dev,
    variance, zero_crossings,
};
use crate::types::FeatureBundle;

/// Complexity features are only worth computing on reasonably clean data.
const COMPLEXITY_QUALITY_GATE: f32 = 0.7;
/// Pattern cap for the entropy estimators.
const ENTROPY_MAX_PATTERNS: usize = 100;
const HURST_MAX_LAG: usize = 100;
const HIGUCHI_K_MAX: usize = 10;

pub fn extract(data: &Array2<f32>, sampling_rate: f32, quality_score: f32) -> FeatureBundle {
    let channels = data.nrows();
    let per_channel: Vec<BTreeMap<&'static str, f32>> = (0..channels)
        .into_par_iter()
        .map(|ch| {
            let row: Vec<f32> = data.row(ch).iter().copied().collect();
            channel_features(&row, sampling_rate, quality_score)
        })
        .collect();

    let mut bundle = FeatureBundle::new();
    if let Some(first) = per_channel.first() {
        for key in first.keys() {
            let values: Vec<f32> = per_channel
                .iter()
                .map(|m| m.get(key).copied().unwrap_or(0.0))
                .collect();
            bundle.insert((*key).to_string(), values);
        }
    }
    bundle
}

fn channel_features(
    row: &[f32],
    sampling_rate: f32,
    quality_score: f32,
) -> BTreeMap<&'static str, f32> {
    let mut out = BTreeMap::new();
    let n = row.len();
    if n == 0 {
        return out;
    }
    let duration_s = n as f32 / sampling_rate;

    let m = mean(row);
    let sd = std_dev(row);
    let p25 = percentile(row, 25.0);
    let p75 = percentile(row, 75.0);
    out.insert("mean", m);
    out.insert("std", sd);
    out.insert("variance", variance(row));
    out.insert("skewness", skewness(row));
    out.insert("kurtosis", kurtosis(row));
    out.insert("percentile_25", p25);
    out.insert("percentile_75", p75);
    out.insert("iqr", p75 - p25);
    out.insert("mad", mad(row));
    out.insert("cv", sd / (m.abs() + 1e-10));
    out.insert("rms", rms(row));
    out.insert("peak_to_peak", peak_to_peak(row));
    out.insert(
        "max_abs_amplitude",
        row.iter().fold(0.0f32, |acc, &v| acc.max(v.abs())),
    );
    out.insert(
        "mean_abs_amplitude",
        mean(&row.iter().map(|v| v.abs()).collect::<Vec<_>>()),
    );

    out.insert("histogram_entropy", histogram_entropy(row, 50));

    let env = envelope(row);
    out.insert("envelope_mean", mean(&env));
    out.insert("envelope_std", std_dev(&env));
    out.insert("envelope_skew", skewness(&env));

    let (first_zero, ac_10ms, ac_50ms) = autocorrelation_features(row, sampling_rate);
    out.insert("autocorr_first_zero", first_zero);
    out.insert("autocorr_10ms", ac_10ms);
    out.insert("autocorr_50ms", ac_50ms);

    if quality_score > COMPLEXITY_QUALITY_GATE {
        let (activity, mobility, complexity) = hjorth(row);
        out.insert("hjorth_activity", activity);
        out.insert("hjorth_mobility", mobility);
        out.insert("hjorth_complexity", complexity);

        let r = 0.2 * sd;
        out.insert("sample_entropy", sample_entropy(row, 2, r));
        out.insert("approx_entropy", approximate_entropy(row, 2, r));
        out.insert("hurst_exponent", hurst_exponent(row));
        out.insert("fractal_dimension", higuchi_fd(row));
        out.insert(
            "zero_crossing_rate",
            zero_crossings(row) as f32 / duration_s,
        );
        out.insert(
            "line_length",
            row.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f32>() / duration_s,
        );
        out.insert("nonlinear_energy", nonlinear_energy(row));
    }
    out
}

pub fn hjorth(row: &[f32]) -> (f32, f32, f32) {
    let activity = variance(row);
    if row.len() < 3 || activity <= f32::EPSILON {
        return (activity, 0.0, 0.0);
    }
    let d1: Vec<f32> = row.windows(2).map(|w| w[1] - w[0]).collect();
    let d2: Vec<f32> = d1.windows(2).map(|w| w[1] - w[0]).collect();
    let var_d1 = variance(&d1);
    let var_d2 = variance(&d2);
    let mobility = (var_d1 / activity).sqrt();
    let complexity = if var_d1 > f32::EPSILON {
        (var_d2 / var_d1).sqrt() / mobility.max(1e-12)
    } else {
        0.0
    };
    (activity, mobility, complexity)
}

fn chebyshev_match(a: &[f32], b: &[f32], r: f32) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() <= r)
}

/// Sample entropy with template length `m`, bounded at 100 starting
/// patterns to keep the cost predictable per window.
pub fn sample_entropy(row: &[f32], m: usize, r: f32) -> f32 {
    let n = row.len().min(ENTROPY_MAX_PATTERNS + m + 1);
    if n <= m + 1 || r <= 0.0 {
        return 0.0;
    }
    let count = |len: usize| -> usize {
        let templates = n - len;
        let mut matches = 0usize;
        for i in 0..templates {
            for j in (i + 1)..templates {
                if chebyshev_match(&row[i..i + len], &row[j..j + len], r) {
                    matches += 1;
                }
            }
        }
        matches
    };
    let b = count(m);
    let a = count(m + 1);
    if a == 0 || b == 0 {
        return 0.0;
    }
    -((a as f32 / b as f32).ln())
}

pub fn approximate_entropy(row: &[f32], m: usize, r: f32) -> f32 {
    let n = row.len().min(ENTROPY_MAX_PATTERNS + m + 1);
    if n <= m + 1 || r <= 0.0 {
        return 0.0;
    }
    let phi = |len: usize| -> f32 {
        let templates = n - len + 1;
        let mut total = 0.0f32;
        for i in 0..templates {
            let mut matches = 0usize;
            for j in 0..templates {
                if chebyshev_match(&row[i..i + len], &row[j..j + len], r) {
                    matches += 1;
                }
            }
            total += ((matches as f32) / templates as f32).max(1e-12).ln();
        }
        total / templates as f32
    };
    phi(m) - phi(m + 1)
}

/// Hurst exponent by rescaled-range analysis over lags 2..=100.
pub fn hurst_exponent(row: &[f32]) -> f32 {
    let n = row.len();
    if n < 20 {
        return 0.5;
    }
    let max_lag = HURST_MAX_LAG.min(n / 2);
    let mut log_lag = Vec::new();
    let mut log_rs = Vec::new();
    for lag in 2..=max_lag {
        let segments = n / lag;
        if segments == 0 {
            break;
        }
        let mut rs_acc = 0.0f64;
        let mut rs_count = 0usize;
        for seg in 0..segments {
            let chunk = &row[seg * lag..(seg + 1) * lag];
            let m = mean(chunk) as f64;
            let mut cum = 0.0f64;
            let mut min_c = f64::INFINITY;
            let mut max_c = f64::NEG_INFINITY;
            let mut sq = 0.0f64;
            for &v in chunk {
                let d = v as f64 - m;
                cum += d;
                min_c = min_c.min(cum);
                max_c = max_c.max(cum);
                sq += d * d;
            }
            let s = (sq / lag as f64).sqrt();
            if s > 1e-12 {
                rs_acc += (max_c - min_c) / s;
                rs_count += 1;
            }
        }
        if rs_count > 0 {
            log_lag.push((lag as f32).ln());
            log_rs.push(((rs_acc / rs_count as f64) as f32).max(1e-12).ln());
        }
    }
    if log_lag.len() < 2 {
        return 0.5;
    }
    // Slope of log(R/S) against log(lag).
    let pairs: Vec<f32> = log_rs.clone();
    let mx = mean(&log_lag);
    let my = mean(&pairs);
    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for (x, y) in log_lag.iter().zip(&pairs) {
        num += (x - mx) * (y - my);
        den += (x - mx) * (x - mx);
    }
    if den <= f32::EPSILON {
        0.5
    } else {
        (num / den).clamp(0.0, 1.0)
    }
}

/// Higuchi fractal dimension with k up to 10.
pub fn higuchi_fd(row: &[f32]) -> f32 {
    let n = row.len();
    if n < HIGUCHI_K_MAX * 2 {
        return 1.0;
    }
    let mut log_k = Vec::new();
    let mut log_l = Vec::new();
    for k in 1..=HIGUCHI_K_MAX {
        let mut lengths = Vec::new();
        for start in 0..k {
            let points = (n - start - 1) / k;
            if points < 1 {
                continue;
            }
            let mut length = 0.0f64;
            for i in 1..=points {
                length +=
                    (row[start + i * k] as f64 - row[start + (i - 1) * k] as f64).abs();
            }
            let norm = (n as f64 - 1.0) / (points as f64 * k as f64);
            lengths.push(length * norm / k as f64);
        }
        if !lengths.is_empty() {
            let avg = lengths.iter().sum::<f64>() / lengths.len() as f64;
            if avg > 1e-12 {
                log_k.push(((1.0 / k as f64).ln()) as f32);
                log_l.push((avg.ln()) as f32);
            }
        }
    }
    if log_k.len() < 2 {
        return 1.0;
    }
    let mx = mean(&log_k);
    let my = mean(&log_l);
    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for (x, y) in log_k.iter().zip(&log_l) {
        num += (x - mx) * (y - my);
        den += (x - mx) * (x - mx);
    }
    if den <= f32::EPSILON {
        1.0
    } else {
        (num / den).clamp(1.0, 2.0)
    }
}

pub fn nonlinear_energy(row: &[f32]) -> f32 {
    if row.len() < 3 {
        return 0.0;
    }
    let values: Vec<f32> = (1..row.len() - 1)
        .map(|i| row[i] * row[i] - row[i + 1] * row[i - 1])
        .collect();
    mean(&values)
}

fn autocorrelation_features(row: &[f32], sampling_rate: f32) -> (f32, f32, f32) {
    let n = row.len();
    if n < 4 {
        return (0.0, 0.0, 0.0);
    }
    let m = mean(row) as f64;
    let denom: f64 = row.iter().map(|&v| (v as f64 - m).powi(2)).sum();
    if denom <= 1e-12 {
        return (0.0, 0.0, 0.0);
    }
    let ac = |lag: usize| -> f32 {
        if lag >= n {
            return 0.0;
        }
        let num: f64 = (0..n - lag)
            .map(|i| (row[i] as f64 - m) * (row[i + lag] as f64 - m))
            .sum();
        (num / denom) as f32
    };
    let mut first_zero = 0.0f32;
    for lag in 1..n {
        if ac(lag) <= 0.0 {
            first_zero = lag as f32 / sampling_rate;
            break;
        }
    }
    let lag_10ms = ((0.01 * sampling_rate).round() as usize).max(1);
    let lag_50ms = ((0.05 * sampling_rate).round() as usize).max(1);
    (first_zero, ac(lag_10ms), ac(lag_50ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sine_matrix(freq: f64, fs: f64, channels: usize, n: usize, amp: f64) -> Array2<f32> {
        Array2::from_shape_fn((channels, n), |(_, i)| {
            (amp * (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin()) as f32
        })
    }

    #[test]
    fn basic_features_have_channel_length() {
        let data = sine_matrix(10.0, 250.0, 4, 500, 30.0);
        let bundle = extract(&data, 250.0, 1.0);
        assert_eq!(bundle["mean"].len(), 4);
        assert_eq!(bundle["rms"].len(), 4);
        // 30 µV sine → RMS ≈ 21.2.
        for &v in &bundle["rms"] {
            assert!((v - 21.2).abs() < 0.5, "rms {v}");
        }
    }

    #[test]
    fn complexity_features_are_gated_on_quality() {
        let data = sine_matrix(10.0, 250.0, 2, 500, 30.0);
        let low_quality = extract(&data, 250.0, 0.5);
        assert!(!low_quality.contains_key("sample_entropy"));
        let high_quality = extract(&data, 250.0, 0.9);
        assert!(high_quality.contains_key("sample_entropy"));
        assert!(high_quality.contains_key("hjorth_mobility"));
    }

    #[test]
    fn zero_crossing_rate_matches_tone_frequency() {
        let data = sine_matrix(10.0, 250.0, 1, 500, 30.0);
        let bundle = extract(&data, 250.0, 1.0);
        // A 10 Hz tone crosses zero 20 times per second.
        let zcr = bundle["zero_crossing_rate"][0];
        assert!((zcr - 20.0).abs() <= 1.0, "zcr {zcr}");
    }

    #[test]
    fn hjorth_mobility_scales_with_frequency() {
        let slow: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f64::consts::PI * 2.0 * i as f64 / 250.0).sin() as f32)
            .collect();
        let fast: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f64::consts::PI * 30.0 * i as f64 / 250.0).sin() as f32)
            .collect();
        let (_, mob_slow, _) = hjorth(&slow);
        let (_, mob_fast, _) = hjorth(&fast);
        assert!(mob_fast > mob_slow * 5.0);
    }

    #[test]
    fn entropy_separates_noise_from_tone() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(9);
        let tone: Vec<f32> = (0..400)
            .map(|i| (2.0 * std::f64::consts::PI * 5.0 * i as f64 / 250.0).sin() as f32)
            .collect();
        let noise: Vec<f32> = (0..400).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let se_tone = sample_entropy(&tone, 2, 0.2 * std_dev(&tone));
        let se_noise = sample_entropy(&noise, 2, 0.2 * std_dev(&noise));
        assert!(se_noise > se_tone, "tone {se_tone} noise {se_noise}");
    }

    #[test]
    fn hurst_detects_persistence() {
        // A trending (integrated) series is persistent → H near 1; white
        // noise sits near 0.5.
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(10);
        let mut walk = Vec::with_capacity(1000);
        let mut acc = 0.0f32;
        for _ in 0..1000 {
            acc += rng.gen_range(-1.0..1.0);
            walk.push(acc);
        }
        let h_walk = hurst_exponent(&walk);
        let noise: Vec<f32> = (0..1000).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let h_noise = hurst_exponent(&noise);
        assert!(h_walk > 0.8, "walk H {h_walk}");
        assert!((h_noise - 0.5).abs() < 0.2, "noise H {h_noise}");
    }

    #[test]
    fn higuchi_ranks_noise_above_tone() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(11);
        let tone: Vec<f32> = (0..500)
            .map(|i| (2.0 * std::f64::consts::PI * 3.0 * i as f64 / 250.0).sin() as f32)
            .collect();
        let noise: Vec<f32> = (0..500).map(|_| rng.gen_range(-1.0..1.0)).collect();
        assert!(higuchi_fd(&noise) > higuchi_fd(&tone));
    }
}
