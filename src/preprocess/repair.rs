//! Bad-channel detection and interpolation.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::config::ProcessorConfig;
use crate::dsp::stats::{kurtosis, mean, pearson, rms, std_dev, variance};
use crate::error::Result;

/// Channels flatter than this are dead (µV).
pub const FLATLINE_STD_UV: f32 = 0.5;
/// Channels louder than this are broken or unplugged (µV RMS).
pub const NOISE_RMS_UV: f32 = 100.0;
/// Variance z-score beyond which a channel is an outlier.
const VARIANCE_Z_MAX: f32 = 3.0;
/// Minimum mean |correlation| with the other channels.
const CORRELATION_MIN: f32 = 0.4;
/// Clipping: this share of samples pinned near an extreme.
const CLIPPING_FRACTION: f32 = 0.10;
/// χ²(4 dof) at 97.5%, the envelope cut for channel summary vectors.
const ENVELOPE_CHI2: f64 = 11.14;

/// Flags channels that fail any statistical health check.
pub fn detect_bad_channels(data: &Array2<f32>) -> Vec<usize> {
    let channels = data.nrows();
    let samples = data.ncols();
    if channels == 0 || samples == 0 {
        return Vec::new();
    }
    let rows: Vec<Vec<f32>> = (0..channels)
        .map(|ch| data.row(ch).iter().copied().collect())
        .collect();

    let variances: Vec<f32> = rows.iter().map(|r| variance(r)).collect();
    let var_mean = mean(&variances);
    let var_std = std_dev(&variances);

    let mut bad = Vec::new();
    for ch in 0..channels {
        let row = &rows[ch];
        let std = std_dev(row);

        if std < FLATLINE_STD_UV {
            bad.push(ch);
            continue;
        }
        if rms(row) > NOISE_RMS_UV {
            bad.push(ch);
            continue;
        }
        if var_std > f32::EPSILON && (variances[ch] - var_mean) / var_std > VARIANCE_Z_MAX {
            bad.push(ch);
            continue;
        }
        if is_clipping(row) {
            bad.push(ch);
            continue;
        }
        if channels > 2 {
            let mean_corr = (0..channels)
                .filter(|&other| other != ch)
                .map(|other| pearson(row, &rows[other]).abs())
                .sum::<f32>()
                / (channels - 1) as f32;
            if mean_corr < CORRELATION_MIN {
                bad.push(ch);
                continue;
            }
        }
    }

    // Covariance-envelope outliers on per-channel summary vectors.
    for ch in envelope_outliers(&rows) {
        if !bad.contains(&ch) {
            bad.push(ch);
        }
    }
    bad.sort_unstable();
    bad
}

pub fn is_clipping(row: &[f32]) -> bool {
    let lo = row.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = hi - lo;
    if !range.is_finite() || range <= f32::EPSILON {
        return false;
    }
    let margin = 0.05 * range;
    let pinned = row
        .iter()
        .filter(|&&v| v <= lo + margin || v >= hi - margin)
        .count();
    pinned as f32 / row.len() as f32 >= CLIPPING_FRACTION
}

/// Mahalanobis-distance outliers over (log variance, RMS, peak-to-peak,
/// kurtosis) channel summaries. Needs enough channels for a covariance
/// estimate.
fn envelope_outliers(rows: &[Vec<f32>]) -> Vec<usize> {
    let channels = rows.len();
    const DIM: usize = 4;
    if channels < 2 * DIM {
        return Vec::new();
    }
    let summaries: Vec<[f64; DIM]> = rows
        .iter()
        .map(|r| {
            [
                (variance(r) as f64 + 1e-12).ln(),
                rms(r) as f64,
                crate::dsp::stats::peak_to_peak(r) as f64,
                kurtosis(r) as f64,
            ]
        })
        .collect();
    let mut centroid = [0.0f64; DIM];
    for s in &summaries {
        for d in 0..DIM {
            centroid[d] += s[d] / channels as f64;
        }
    }
    let mut cov = DMatrix::<f64>::zeros(DIM, DIM);
    for s in &summaries {
        for i in 0..DIM {
            for j in 0..DIM {
                cov[(i, j)] += (s[i] - centroid[i]) * (s[j] - centroid[j]) / channels as f64;
            }
        }
    }
    for d in 0..DIM {
        cov[(d, d)] += 1e-9;
    }
    let Some(inv) = cov.try_inverse() else {
        return Vec::new();
    };
    summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            let delta = DVector::from_iterator(DIM, (0..DIM).map(|d| s[d] - centroid[d]));
            let d2 = (delta.transpose() * &inv * &delta)[(0, 0)];
            d2 > ENVELOPE_CHI2
        })
        .map(|(ch, _)| ch)
        .collect()
}

/// Thin-plate radial basis value.
fn tps(r: f64) -> f64 {
    if r <= 1e-12 {
        0.0
    } else {
        r * r * r.ln()
    }
}

/// Spline weights mapping good-channel values to one bad channel, from 2-D
/// projected electrode positions.
fn spline_weights(
    positions: &[[f32; 3]],
    good: &[usize],
    bad_channel: usize,
) -> Option<Vec<f64>> {
    let g = good.len();
    if g < 3 {
        return None;
    }
    let proj = |ch: usize| -> (f64, f64) {
        (positions[ch][0] as f64, positions[ch][1] as f64)
    };
    let mut k = DMatrix::<f64>::zeros(g, g);
    for i in 0..g {
        for j in 0..g {
            let (xi, yi) = proj(good[i]);
            let (xj, yj) = proj(good[j]);
            k[(i, j)] = tps(((xi - xj).powi(2) + (yi - yj).powi(2)).sqrt());
        }
        k[(i, i)] += 1e-9;
    }
    let inv = k.try_inverse()?;
    let (xb, yb) = proj(bad_channel);
    let phi = DVector::from_iterator(
        g,
        good.iter().map(|&ch| {
            let (x, y) = proj(ch);
            tps(((xb - x).powi(2) + (yb - y).powi(2)).sqrt())
        }),
    );
    let weights = inv * phi;
    Some(weights.iter().copied().collect())
}

fn interpolation_is_sane(candidate: &[f32], original: &[f32]) -> bool {
    if candidate.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let std = std_dev(candidate);
    if std < FLATLINE_STD_UV || std > 2.0 * NOISE_RMS_UV {
        return false;
    }
    // A result bitwise equal to the input repaired nothing.
    candidate
        .iter()
        .zip(original)
        .any(|(a, b)| a.to_bits() != b.to_bits())
}

/// Replaces bad channels in place. Uses spherical-spline weights over the
/// 2-D projected montage when positions are known, otherwise the average of
/// the three nearest good channels by index. Returns the channels actually
/// repaired.
pub fn interpolate_channels(
    data: &mut Array2<f32>,
    bad: &[usize],
    config: &ProcessorConfig,
) -> Vec<usize> {
    let channels = data.nrows();
    let samples = data.ncols();
    let good: Vec<usize> = (0..channels).filter(|ch| !bad.contains(ch)).collect();
    if good.is_empty() {
        return Vec::new();
    }
    let original = data.clone();
    let mut repaired = Vec::new();

    for &ch in bad {
        if ch >= channels {
            continue;
        }
        let original_row: Vec<f32> = original.row(ch).iter().copied().collect();

        let spline = config
            .channel_positions
            .as_ref()
            .filter(|p| p.len() == channels)
            .and_then(|positions| spline_weights(positions, &good, ch))
            .map(|weights| {
                (0..samples)
                    .map(|s| {
                        weights
                            .iter()
                            .zip(&good)
                            .map(|(w, &g)| w * original[[g, s]] as f64)
                            .sum::<f64>() as f32
                    })
                    .collect::<Vec<f32>>()
            })
            .filter(|candidate| interpolation_is_sane(candidate, &original_row));

        let candidate = spline.or_else(|| {
            // Nearest three good channels by montage index.
            let mut by_distance: Vec<usize> = good.clone();
            by_distance.sort_by_key(|&g| (g as isize - ch as isize).unsigned_abs());
            let nearest: Vec<usize> = by_distance.into_iter().take(3).collect();
            if nearest.is_empty() {
                return None;
            }
            let averaged: Vec<f32> = (0..samples)
                .map(|s| {
                    nearest
                        .iter()
                        .map(|&g| original[[g, s]])
                        .sum::<f32>()
                        / nearest.len() as f32
                })
                .collect();
            interpolation_is_sane(&averaged, &original_row).then_some(averaged)
        });

        if let Some(values) = candidate {
            for (s, &v) in values.iter().enumerate() {
                data[[ch, s]] = v;
            }
            repaired.push(ch);
        }
    }
    repaired
}

/// Full repair stage: detect, interpolate, report.
pub fn repair_stage(
    data: &Array2<f32>,
    config: &ProcessorConfig,
) -> Result<(Array2<f32>, Vec<usize>, Vec<usize>)> {
    let bad = detect_bad_channels(data);
    let mut out = data.clone();
    let repaired = interpolate_channels(&mut out, &bad, config);
    Ok((out, bad, repaired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gaussian(rng: &mut StdRng) -> f32 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
    }

    fn healthy_matrix(channels: usize, n: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Array2::<f32>::zeros((channels, n));
        for i in 0..n {
            let shared =
                30.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0).sin() as f32;
            for ch in 0..channels {
                data[[ch, i]] = shared + 2.0 * gaussian(&mut rng);
            }
        }
        data
    }

    #[test]
    fn healthy_channels_pass() {
        let data = healthy_matrix(8, 500, 1);
        assert!(detect_bad_channels(&data).is_empty());
    }

    #[test]
    fn flatline_channel_is_flagged() {
        let mut data = healthy_matrix(8, 500, 2);
        for i in 0..500 {
            data[[7, i]] = 0.0;
        }
        let bad = detect_bad_channels(&data);
        assert!(bad.contains(&7), "bad = {bad:?}");
    }

    #[test]
    fn loud_channel_is_flagged() {
        let mut data = healthy_matrix(8, 500, 3);
        for i in 0..500 {
            data[[2, i]] = 500.0 * ((i as f32) * 0.7).sin();
        }
        assert!(detect_bad_channels(&data).contains(&2));
    }

    #[test]
    fn clipped_channel_is_flagged() {
        let mut data = healthy_matrix(8, 500, 4);
        for i in 0..500 {
            data[[3, i]] = data[[3, i]].clamp(-8.0, 8.0);
        }
        // Push enough samples to the rails.
        for i in 0..500 {
            if i % 3 != 0 {
                data[[3, i]] = if data[[3, i]] > 0.0 { 8.0 } else { -8.0 };
            }
        }
        assert!(detect_bad_channels(&data).contains(&3));
    }

    #[test]
    fn interpolation_revives_a_flatline() {
        let mut data = healthy_matrix(8, 500, 5);
        for i in 0..500 {
            data[[7, i]] = 0.0;
        }
        let config = ProcessorConfig::default();
        let (repaired, bad, interpolated) = repair_stage(&data, &config).unwrap();
        assert!(bad.contains(&7));
        assert!(interpolated.contains(&7));
        let row: Vec<f32> = repaired.row(7).iter().copied().collect();
        assert!(std_dev(&row) > FLATLINE_STD_UV);
    }

    #[test]
    fn spline_interpolation_uses_positions() {
        let mut data = healthy_matrix(8, 500, 6);
        for i in 0..500 {
            data[[4, i]] = 0.0;
        }
        let mut config = ProcessorConfig::default();
        // A rough circular montage in centimetres.
        config.channel_positions = Some(
            (0..8)
                .map(|ch| {
                    let angle = ch as f32 / 8.0 * std::f32::consts::TAU;
                    [8.0 * angle.cos(), 8.0 * angle.sin(), 0.0]
                })
                .collect(),
        );
        let (repaired, _, interpolated) = repair_stage(&data, &config).unwrap();
        assert!(interpolated.contains(&4));
        let row: Vec<f32> = repaired.row(4).iter().copied().collect();
        // The repaired channel must resemble its neighbours' shared rhythm.
        let neighbour: Vec<f32> = repaired.row(3).iter().copied().collect();
        assert!(pearson(&row, &neighbour) > 0.8);
    }

    #[test]
    fn shape_is_preserved() {
        let data = healthy_matrix(8, 400, 7);
        let config = ProcessorConfig::default();
        let (out, _, _) = repair_stage(&data, &config).unwrap();
        assert_eq!(out.dim(), data.dim());
    }
}
