//! Spatial features over the channel dimension: covariance structure,
//! correlation networks, PCA and topographical statistics.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;

use crate::dsp::stats::{kurtosis, mean, pearson, percentile, std_dev, variance};
use crate::types::FeatureBundle;

/// Spatial analysis needs a minimal montage and a reasonably clean window.
pub const MIN_CHANNELS: usize = 4;
const QUALITY_GATE: f32 = 0.6;
const PCA_COMPONENTS: usize = 3;

/// Default circular montage (centimetres) when no positions are provided.
fn default_positions(channels: usize) -> Vec<[f32; 3]> {
    (0..channels)
        .map(|ch| {
            let angle = ch as f32 / channels as f32 * std::f32::consts::TAU;
            [8.0 * angle.sin(), 8.0 * angle.cos(), 0.0]
        })
        .collect()
}

pub fn extract(
    data: &Array2<f32>,
    positions: Option<&[[f32; 3]]>,
    quality_score: f32,
) -> FeatureBundle {
    let mut bundle = FeatureBundle::new();
    let channels = data.nrows();
    if channels < MIN_CHANNELS || quality_score <= QUALITY_GATE {
        return bundle;
    }
    let rows: Vec<Vec<f32>> = (0..channels)
        .map(|ch| data.row(ch).iter().copied().collect())
        .collect();

    covariance_features(&rows, &mut bundle);
    correlation_features(&rows, &mut bundle);
    pca_features(&rows, &mut bundle);

    let default;
    let positions = match positions.filter(|p| p.len() == channels) {
        Some(p) => p,
        None => {
            default = default_positions(channels);
            &default[..]
        }
    };
    topographic_features(&rows, positions, &mut bundle);
    bundle
}

/// Normalized entropy of the covariance eigenvalue spectrum: 0 when one
/// direction dominates, 1 when power spreads evenly over the montage.
fn covariance_features(rows: &[Vec<f32>], bundle: &mut FeatureBundle) {
    let channels = rows.len();
    let samples = rows[0].len();
    let mut cov = DMatrix::<f64>::zeros(channels, channels);
    let means: Vec<f64> = rows.iter().map(|r| mean(r) as f64).collect();
    for i in 0..channels {
        for j in i..channels {
            let mut acc = 0.0;
            for s in 0..samples {
                acc += (rows[i][s] as f64 - means[i]) * (rows[j][s] as f64 - means[j]);
            }
            let v = acc / samples as f64;
            cov[(i, j)] = v;
            cov[(j, i)] = v;
        }
    }
    let eig = SymmetricEigen::new(cov);
    let total: f64 = eig.eigenvalues.iter().map(|&v| v.max(0.0)).sum();
    if total > f64::EPSILON {
        let entropy: f64 = eig
            .eigenvalues
            .iter()
            .filter(|&&v| v > 0.0)
            .map(|&v| {
                let p = v / total;
                -p * p.ln()
            })
            .sum();
        let normalized = entropy / (channels as f64).ln();
        bundle.insert("spatial_complexity".into(), vec![normalized as f32]);
    }
}

fn correlation_features(rows: &[Vec<f32>], bundle: &mut FeatureBundle) {
    let channels = rows.len();
    let mut corr = vec![vec![0.0f32; channels]; channels];
    for i in 0..channels {
        corr[i][i] = 1.0;
        for j in (i + 1)..channels {
            let r = pearson(&rows[i], &rows[j]);
            corr[i][j] = r;
            corr[j][i] = r;
        }
    }
    let mut upper = Vec::new();
    for i in 0..channels {
        for j in (i + 1)..channels {
            upper.push(corr[i][j]);
        }
    }
    let abs_upper: Vec<f32> = upper.iter().map(|r| r.abs()).collect();
    bundle.insert("correlation_mean".into(), vec![mean(&upper)]);
    bundle.insert("correlation_std".into(), vec![std_dev(&upper)]);
    bundle.insert(
        "correlation_max".into(),
        vec![abs_upper.iter().copied().fold(0.0, f32::max)],
    );
    bundle.insert(
        "correlation_min".into(),
        vec![upper.iter().copied().fold(f32::INFINITY, f32::min)],
    );
    let per_channel: Vec<f32> = (0..channels)
        .map(|i| {
            (0..channels)
                .filter(|&j| j != i)
                .map(|j| corr[i][j].abs())
                .sum::<f32>()
                / (channels - 1) as f32
        })
        .collect();
    bundle.insert("channel_avg_correlation".into(), per_channel);
    bundle.insert("global_connectivity".into(), vec![mean(&abs_upper)]);

    // Threshold graph at the 75th percentile of |r|.
    let threshold = percentile(&abs_upper, 75.0);
    let adjacency: Vec<Vec<bool>> = (0..channels)
        .map(|i| {
            (0..channels)
                .map(|j| i != j && corr[i][j].abs() >= threshold)
                .collect()
        })
        .collect();

    // Binary clustering coefficient.
    let mut coefficients = Vec::new();
    for i in 0..channels {
        let neighbours: Vec<usize> = (0..channels).filter(|&j| adjacency[i][j]).collect();
        if neighbours.len() < 2 {
            continue;
        }
        let mut links = 0usize;
        for a in 0..neighbours.len() {
            for b in (a + 1)..neighbours.len() {
                if adjacency[neighbours[a]][neighbours[b]] {
                    links += 1;
                }
            }
        }
        let possible = neighbours.len() * (neighbours.len() - 1) / 2;
        coefficients.push(links as f32 / possible as f32);
    }
    bundle.insert(
        "clustering_coefficient".into(),
        vec![if coefficients.is_empty() {
            0.0
        } else {
            mean(&coefficients)
        }],
    );

    // Communities: connected components of the thresholded graph.
    let mut component = vec![usize::MAX; channels];
    let mut count = 0usize;
    for start in 0..channels {
        if component[start] != usize::MAX {
            continue;
        }
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if component[node] != usize::MAX {
                continue;
            }
            component[node] = count;
            for next in 0..channels {
                if adjacency[node][next] && component[next] == usize::MAX {
                    stack.push(next);
                }
            }
        }
        count += 1;
    }
    let mut sizes = vec![0f32; count];
    for &c in &component {
        sizes[c] += 1.0;
    }
    bundle.insert("n_communities".into(), vec![count as f32]);
    bundle.insert(
        "largest_community_size".into(),
        vec![sizes.iter().copied().fold(0.0, f32::max)],
    );
    bundle.insert("community_size_variance".into(), vec![variance(&sizes)]);
}

fn pca_features(rows: &[Vec<f32>], bundle: &mut FeatureBundle) {
    let channels = rows.len();
    let samples = rows[0].len();
    let means: Vec<f64> = rows.iter().map(|r| mean(r) as f64).collect();
    let mut cov = DMatrix::<f64>::zeros(channels, channels);
    for i in 0..channels {
        for j in i..channels {
            let mut acc = 0.0;
            for s in 0..samples {
                acc += (rows[i][s] as f64 - means[i]) * (rows[j][s] as f64 - means[j]);
            }
            let v = acc / samples as f64;
            cov[(i, j)] = v;
            cov[(j, i)] = v;
        }
    }
    let eig = SymmetricEigen::new(cov);
    let mut order: Vec<usize> = (0..channels).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let total: f64 = eig.eigenvalues.iter().map(|&v| v.max(0.0)).sum();
    if total <= f64::EPSILON {
        return;
    }
    let n_components = PCA_COMPONENTS.min(channels);
    let explained: Vec<f32> = order
        .iter()
        .take(n_components)
        .map(|&idx| (eig.eigenvalues[idx].max(0.0) / total) as f32)
        .collect();
    bundle.insert("pca_explained_variance".into(), explained);

    let first = order[0];
    let loadings: Vec<f32> = (0..channels)
        .map(|ch| eig.eigenvectors[(ch, first)].abs() as f32)
        .collect();
    let loading_sum: f32 = loadings.iter().sum();
    if loading_sum > f32::EPSILON {
        let focus: f32 = -loadings
            .iter()
            .map(|&l| {
                let p = l / loading_sum;
                if p > 0.0 {
                    p * p.ln()
                } else {
                    0.0
                }
            })
            .sum::<f32>();
        bundle.insert("spatial_focus".into(), vec![focus]);
    }
    bundle.insert("pca_first_component".into(), loadings);

    // Projected component time series.
    for (pc, &idx) in order.iter().take(n_components).enumerate() {
        let series: Vec<f32> = (0..samples)
            .map(|s| {
                (0..channels)
                    .map(|ch| {
                        eig.eigenvectors[(ch, idx)] * (rows[ch][s] as f64 - means[ch])
                    })
                    .sum::<f64>() as f32
            })
            .collect();
        bundle.insert(format!("pc{}_variance", pc + 1), vec![variance(&series)]);
        bundle.insert(format!("pc{}_kurtosis", pc + 1), vec![kurtosis(&series)]);
    }
}

fn topographic_features(
    rows: &[Vec<f32>],
    positions: &[[f32; 3]],
    bundle: &mut FeatureBundle,
) {
    let channels = rows.len();
    let powers: Vec<f32> = rows.iter().map(|r| variance(r)).collect();

    // Power gradient over nearby channel pairs.
    let mut distances = Vec::new();
    for i in 0..channels {
        for j in (i + 1)..channels {
            let d = distance(&positions[i], &positions[j]);
            if d > f32::EPSILON {
                distances.push((i, j, d));
            }
        }
    }
    if !distances.is_empty() {
        let median_distance = {
            let mut ds: Vec<f32> = distances.iter().map(|&(_, _, d)| d).collect();
            ds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            ds[ds.len() / 2]
        };
        let gradients: Vec<f32> = distances
            .iter()
            .filter(|&&(_, _, d)| d <= median_distance)
            .map(|&(i, j, d)| (powers[i] - powers[j]).abs() / d)
            .collect();
        if !gradients.is_empty() {
            bundle.insert("spatial_gradient_mean".into(), vec![mean(&gradients)]);
            bundle.insert(
                "spatial_gradient_max".into(),
                vec![gradients.iter().copied().fold(0.0, f32::max)],
            );
        }
    }

    // Regional quadrant powers: +y is anterior, +x is right.
    let region_power = |predicate: &dyn Fn(&[f32; 3]) -> bool| -> f32 {
        let selected: Vec<f32> = positions
            .iter()
            .zip(&powers)
            .filter(|(p, _)| predicate(p))
            .map(|(_, &pw)| pw)
            .collect();
        if selected.is_empty() {
            0.0
        } else {
            mean(&selected)
        }
    };
    let anterior = region_power(&|p| p[1] > 0.0);
    let posterior = region_power(&|p| p[1] <= 0.0);
    let left = region_power(&|p| p[0] < 0.0);
    let right = region_power(&|p| p[0] >= 0.0);
    bundle.insert("anterior_power".into(), vec![anterior]);
    bundle.insert("posterior_power".into(), vec![posterior]);
    bundle.insert("left_power".into(), vec![left]);
    bundle.insert("right_power".into(), vec![right]);
    bundle.insert(
        "anterior_posterior_gradient".into(),
        vec![(anterior - posterior) / (anterior + posterior + 1e-10)],
    );
    bundle.insert(
        "left_right_asymmetry".into(),
        vec![(left - right) / (left + right + 1e-10)],
    );

    // Moran's I over channel power with inverse-distance weights.
    let power_mean = mean(&powers);
    let deviations: Vec<f32> = powers.iter().map(|&p| p - power_mean).collect();
    let denom: f32 = deviations.iter().map(|d| d * d).sum();
    if denom > f32::EPSILON {
        let mut num = 0.0f32;
        let mut weight_sum = 0.0f32;
        for i in 0..channels {
            // Row-normalized inverse-distance weights.
            let row_weights: Vec<(usize, f32)> = (0..channels)
                .filter(|&j| j != i)
                .filter_map(|j| {
                    let d = distance(&positions[i], &positions[j]);
                    (d > f32::EPSILON).then_some((j, 1.0 / d))
                })
                .collect();
            let row_total: f32 = row_weights.iter().map(|(_, w)| w).sum();
            if row_total <= f32::EPSILON {
                continue;
            }
            for (j, w) in row_weights {
                let normalized = w / row_total;
                num += normalized * deviations[i] * deviations[j];
                weight_sum += normalized;
            }
        }
        if weight_sum > f32::EPSILON {
            let moran = (channels as f32 / weight_sum) * (num / denom);
            bundle.insert("spatial_autocorrelation".into(), vec![moran]);
        }
    }
}

fn distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
