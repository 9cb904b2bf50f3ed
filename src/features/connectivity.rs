//! Connectivity features: spectral coherence, phase locking, phase-amplitude
//! coupling, transfer entropy, mutual information and graph summaries of
//! every connectivity matrix.

use ndarray::Array2;
use rayon::prelude::*;
use rustfft::num_complex::Complex64;

use crate::config::{PacMethod, ProcessorConfig};
use crate::dsp::filter::butter_bandpass;
use crate::dsp::hilbert::{analytic, instantaneous_phase};
use crate::dsp::stats::{mean, std_dev};
use crate::dsp::welch_csd;
use crate::types::FeatureBundle;

/// Pairwise analysis only makes sense on a dense montage with clean data.
pub const MIN_CHANNELS: usize = 8;
const QUALITY_GATE: f32 = 0.8;

const COHERENCE_BANDS: [(&str, f64, f64); 2] = [("alpha", 8.0, 13.0), ("beta", 13.0, 30.0)];
const PLV_BANDS: [(&str, f64, f64); 4] = [
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma", 30.0, 50.0),
];

const PAC_PHASE_BINS: usize = 18;
const MI_BINS: usize = 16;

pub fn extract(data: &Array2<f32>, config: &ProcessorConfig, quality_score: f32) -> FeatureBundle {
    let mut bundle = FeatureBundle::new();
    let channels = data.nrows();
    if channels < MIN_CHANNELS || quality_score <= QUALITY_GATE {
        return bundle;
    }
    let fs = config.sampling_rate as f64;
    let rows: Vec<Vec<f32>> = (0..channels)
        .map(|ch| data.row(ch).iter().copied().collect())
        .collect();

    coherence_features(&rows, fs, &mut bundle);
    plv_features(&rows, fs, &mut bundle);
    pac_features(&rows, fs, config, config.pac_method, &mut bundle);
    transfer_entropy_features(&rows, config.te_bins, config.te_history, &mut bundle);
    mutual_information_features(&rows, &mut bundle);
    bundle
}

/// Upper-triangle values of a symmetric matrix.
fn upper_triangle(matrix: &[Vec<f32>]) -> Vec<f32> {
    let n = matrix.len();
    let mut out = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            out.push(matrix[i][j]);
        }
    }
    out
}

fn coherence_features(rows: &[Vec<f32>], fs: f64, bundle: &mut FeatureBundle) {
    let channels = rows.len();
    let nperseg = (fs as usize).min(rows[0].len()).max(8);

    // Per-channel auto-spectra are shared across every pair.
    let autos: Vec<Vec<f64>> = rows
        .par_iter()
        .map(|row| {
            let (_, csd) = welch_csd(row, row, fs, nperseg);
            csd.iter().map(|c| c.re.max(1e-20)).collect()
        })
        .collect();
    let (freqs, _) = welch_csd(&rows[0], &rows[0], fs, nperseg);

    for (band, lo, hi) in COHERENCE_BANDS {
        let band_bins: Vec<usize> = freqs
            .iter()
            .enumerate()
            .filter(|(_, f)| **f >= lo && **f <= hi)
            .map(|(i, _)| i)
            .collect();
        if band_bins.is_empty() {
            continue;
        }
        let pairs: Vec<(usize, usize)> = (0..channels)
            .flat_map(|i| ((i + 1)..channels).map(move |j| (i, j)))
            .collect();
        let computed: Vec<(usize, usize, f32, f32)> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let (_, cross) = welch_csd(&rows[i], &rows[j], fs, nperseg);
                let mut coh_acc = 0.0f64;
                let mut imag_acc = 0.0f64;
                for &b in &band_bins {
                    let denom = (autos[i][b] * autos[j][b]).sqrt();
                    let normalized = cross[b] / denom;
                    coh_acc += normalized.norm_sqr();
                    imag_acc += normalized.im.abs();
                }
                let n = band_bins.len() as f64;
                (i, j, (coh_acc / n) as f32, (imag_acc / n) as f32)
            })
            .collect();

        let mut coherence = vec![vec![0.0f32; channels]; channels];
        let mut imaginary = vec![vec![0.0f32; channels]; channels];
        for (i, j, c, im) in computed {
            coherence[i][j] = c;
            coherence[j][i] = c;
            imaginary[i][j] = im;
            imaginary[j][i] = im;
        }
        let upper = upper_triangle(&coherence);
        bundle.insert(format!("{band}_coherence_mean"), vec![mean(&upper)]);
        bundle.insert(format!("{band}_coherence_std"), vec![std_dev(&upper)]);
        network_features(&coherence, &format!("{band}_coherence"), bundle);
        network_features(&imaginary, &format!("{band}_imag_coherence"), bundle);
    }
}

fn plv_features(rows: &[Vec<f32>], fs: f64, bundle: &mut FeatureBundle) {
    let channels = rows.len();
    for (band, lo, hi) in PLV_BANDS {
        if hi >= fs / 2.0 {
            continue;
        }
        let Ok(sos) = butter_bandpass(4, lo, hi, fs) else {
            continue;
        };
        let phases: Vec<Vec<f64>> = rows
            .par_iter()
            .map(|row| instantaneous_phase(&sos.filtfilt(row)))
            .collect();
        let mut plv = vec![vec![0.0f32; channels]; channels];
        let pairs: Vec<(usize, usize)> = (0..channels)
            .flat_map(|i| ((i + 1)..channels).map(move |j| (i, j)))
            .collect();
        let computed: Vec<(usize, usize, f32)> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let n = phases[i].len().min(phases[j].len());
                let (mut sin_sum, mut cos_sum) = (0.0f64, 0.0f64);
                for t in 0..n {
                    let d = phases[i][t] - phases[j][t];
                    sin_sum += d.sin();
                    cos_sum += d.cos();
                }
                let value = ((sin_sum / n as f64).powi(2) + (cos_sum / n as f64).powi(2)).sqrt();
                (i, j, value as f32)
            })
            .collect();
        for (i, j, v) in computed {
            plv[i][j] = v;
            plv[j][i] = v;
        }
        let upper = upper_triangle(&plv);
        bundle.insert(format!("{band}_plv_mean"), vec![mean(&upper)]);
        bundle.insert(format!("{band}_plv_std"), vec![std_dev(&upper)]);
        bundle.insert(
            format!("{band}_plv_max"),
            vec![upper.iter().copied().fold(0.0, f32::max)],
        );
        network_features(&plv, &format!("{band}_plv"), bundle);
    }
}

/// Phase-amplitude coupling per channel between the configured phase and
/// amplitude bands.
fn pac_features(
    rows: &[Vec<f32>],
    fs: f64,
    config: &ProcessorConfig,
    method: PacMethod,
    bundle: &mut FeatureBundle,
) {
    let (phase_lo, phase_hi) = config.pac_phase_band;
    let (amp_lo, amp_hi) = config.pac_amplitude_band;
    if amp_hi as f64 >= fs / 2.0 {
        return;
    }
    let (Ok(phase_sos), Ok(amp_sos)) = (
        butter_bandpass(4, phase_lo as f64, phase_hi as f64, fs),
        butter_bandpass(4, amp_lo as f64, amp_hi as f64, fs),
    ) else {
        return;
    };
    let values: Vec<f32> = rows
        .par_iter()
        .map(|row| {
            let phase = instantaneous_phase(&phase_sos.filtfilt(row));
            let amplitude: Vec<f64> = analytic(&amp_sos.filtfilt(row))
                .iter()
                .map(|c| c.norm())
                .collect();
            match method {
                PacMethod::Tort => tort_mi(&phase, &amplitude),
                PacMethod::Ozkurt => ozkurt_mvl(&phase, &amplitude),
            }
        })
        .collect();
    bundle.insert(
        format!("pac_{}_{}hz", phase_lo as i64, amp_lo as i64),
        values,
    );
}

/// Tort modulation index: KL divergence of the amplitude-by-phase
/// distribution from uniform, normalized by ln(18).
fn tort_mi(phase: &[f64], amplitude: &[f64]) -> f32 {
    let n = phase.len().min(amplitude.len());
    if n == 0 {
        return 0.0;
    }
    let mut bin_amp = vec![0.0f64; PAC_PHASE_BINS];
    let mut bin_count = vec![0usize; PAC_PHASE_BINS];
    let width = 2.0 * std::f64::consts::PI / PAC_PHASE_BINS as f64;
    for t in 0..n {
        let idx =
            (((phase[t] + std::f64::consts::PI) / width) as usize).min(PAC_PHASE_BINS - 1);
        bin_amp[idx] += amplitude[t];
        bin_count[idx] += 1;
    }
    let means: Vec<f64> = bin_amp
        .iter()
        .zip(&bin_count)
        .map(|(&a, &c)| if c > 0 { a / c as f64 } else { 0.0 })
        .collect();
    let total: f64 = means.iter().sum();
    if total <= f64::EPSILON {
        return 0.0;
    }
    let entropy: f64 = -means
        .iter()
        .map(|&m| {
            let p = m / total;
            if p > 0.0 {
                p * p.ln()
            } else {
                0.0
            }
        })
        .sum::<f64>();
    let max_entropy = (PAC_PHASE_BINS as f64).ln();
    (((max_entropy - entropy) / max_entropy).max(0.0)) as f32
}

/// Ozkurt normalized mean vector length.
fn ozkurt_mvl(phase: &[f64], amplitude: &[f64]) -> f32 {
    let n = phase.len().min(amplitude.len());
    if n == 0 {
        return 0.0;
    }
    let mut vector = Complex64::new(0.0, 0.0);
    let mut amp_sq = 0.0f64;
    for t in 0..n {
        vector += Complex64::from_polar(amplitude[t], phase[t]);
        amp_sq += amplitude[t] * amplitude[t];
    }
    if amp_sq <= f64::EPSILON {
        return 0.0;
    }
    (vector.norm() / ((n as f64).sqrt() * amp_sq.sqrt())) as f32
}

fn discretize(row: &[f32], bins: usize) -> Vec<usize> {
    let lo = row.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = hi - lo;
    if !range.is_finite() || range <= f32::EPSILON {
        return vec![0; row.len()];
    }
    row.iter()
        .map(|&v| (((v - lo) / range * bins as f32) as usize).min(bins - 1))
        .collect()
}

/// Transfer entropy source→target from fixed-bin joint histograms. The
/// previous `history` samples of each series are collapsed to their mean
/// before discretization, so lagged influence within the history window is
/// captured without an exponential state space.
pub fn transfer_entropy(
    source: &[f32],
    target: &[f32],
    bins: usize,
    history: usize,
) -> f64 {
    let n = source.len().min(target.len());
    let history = history.max(1);
    if n <= history + 1 || bins < 2 {
        return 0.0;
    }
    let past_mean = |row: &[f32]| -> Vec<f32> {
        (history..n)
            .map(|t| row[t - history..t].iter().sum::<f32>() / history as f32)
            .collect()
    };
    let y_now = discretize(&target[history..n], bins);
    let y_past = discretize(&past_mean(target), bins);
    let x_past = discretize(&past_mean(source), bins);
    let m = y_now.len();

    let idx3 = |y: usize, yp: usize, xp: usize| (y * bins + yp) * bins + xp;
    let mut c_yyx = vec![0u32; bins * bins * bins];
    let mut c_yx = vec![0u32; bins * bins];
    let mut c_yy = vec![0u32; bins * bins];
    let mut c_y = vec![0u32; bins];
    for t in 0..m {
        c_yyx[idx3(y_now[t], y_past[t], x_past[t])] += 1;
        c_yx[y_past[t] * bins + x_past[t]] += 1;
        c_yy[y_now[t] * bins + y_past[t]] += 1;
        c_y[y_past[t]] += 1;
    }

    let mut te = 0.0f64;
    for y in 0..bins {
        for yp in 0..bins {
            for xp in 0..bins {
                let joint = c_yyx[idx3(y, yp, xp)];
                if joint == 0 {
                    continue;
                }
                let p_joint = joint as f64 / m as f64;
                let p_cond_full = joint as f64 / c_yx[yp * bins + xp] as f64;
                let p_cond_hist = c_yy[y * bins + yp] as f64 / c_y[yp] as f64;
                if p_cond_hist > 0.0 {
                    te += p_joint * (p_cond_full / p_cond_hist).ln();
                }
            }
        }
    }
    te.max(0.0)
}

fn transfer_entropy_features(
    rows: &[Vec<f32>],
    bins: usize,
    history: usize,
    bundle: &mut FeatureBundle,
) {
    let channels = rows.len();
    let pairs: Vec<(usize, usize)> = (0..channels)
        .flat_map(|i| (0..channels).filter(move |&j| j != i).map(move |j| (i, j)))
        .collect();
    let computed: Vec<(usize, usize, f32)> = pairs
        .par_iter()
        .map(|&(i, j)| (i, j, transfer_entropy(&rows[i], &rows[j], bins, history) as f32))
        .collect();
    let mut te = vec![vec![0.0f32; channels]; channels];
    for (i, j, v) in computed {
        te[i][j] = v;
    }
    // Network features expect a symmetric weight matrix; use the mean of the
    // two directions.
    let symmetric: Vec<Vec<f32>> = (0..channels)
        .map(|i| {
            (0..channels)
                .map(|j| (te[i][j] + te[j][i]) / 2.0)
                .collect()
        })
        .collect();
    network_features(&symmetric, "transfer_entropy", bundle);

    let directionality: Vec<f32> = (0..channels)
        .map(|ch| {
            let outgoing: f32 = te[ch].iter().sum();
            let incoming: f32 = (0..channels).map(|other| te[other][ch]).sum();
            if outgoing + incoming > f32::EPSILON {
                (outgoing - incoming) / (outgoing + incoming)
            } else {
                0.0
            }
        })
        .collect();
    bundle.insert("te_directionality".into(), directionality);
}

/// Mutual information from a 16×16 joint histogram, in nats.
pub fn mutual_information(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len().min(b.len());
    if n < 4 {
        return 0.0;
    }
    let da = discretize(&a[..n], MI_BINS);
    let db = discretize(&b[..n], MI_BINS);
    let mut joint = vec![0u32; MI_BINS * MI_BINS];
    let mut pa = vec![0u32; MI_BINS];
    let mut pb = vec![0u32; MI_BINS];
    for t in 0..n {
        joint[da[t] * MI_BINS + db[t]] += 1;
        pa[da[t]] += 1;
        pb[db[t]] += 1;
    }
    let mut mi = 0.0f64;
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let c = joint[i * MI_BINS + j];
            if c == 0 {
                continue;
            }
            let p_ij = c as f64 / n as f64;
            let p_i = pa[i] as f64 / n as f64;
            let p_j = pb[j] as f64 / n as f64;
            mi += p_ij * (p_ij / (p_i * p_j)).ln();
        }
    }
    mi.max(0.0)
}

fn mutual_information_features(rows: &[Vec<f32>], bundle: &mut FeatureBundle) {
    let channels = rows.len();
    let pairs: Vec<(usize, usize)> = (0..channels)
        .flat_map(|i| ((i + 1)..channels).map(move |j| (i, j)))
        .collect();
    let computed: Vec<(usize, usize, f32)> = pairs
        .par_iter()
        .map(|&(i, j)| (i, j, mutual_information(&rows[i], &rows[j]) as f32))
        .collect();
    let mut mi = vec![vec![0.0f32; channels]; channels];
    for (i, j, v) in computed {
        mi[i][j] = v;
        mi[j][i] = v;
    }
    network_features(&mi, "mutual_information", bundle);
}

/// Graph summaries shared by every connectivity matrix.
fn network_features(matrix: &[Vec<f32>], prefix: &str, bundle: &mut FeatureBundle) {
    let n = matrix.len();
    if n < 2 {
        return;
    }

    // Global efficiency: mean positive connection weight.
    let upper = upper_triangle(matrix);
    let positive: Vec<f32> = upper.iter().copied().filter(|&v| v > 0.0).collect();
    let efficiency = if positive.is_empty() {
        0.0
    } else {
        positive.iter().sum::<f32>() / positive.len() as f32
    };
    bundle.insert(format!("{prefix}_global_efficiency"), vec![efficiency]);

    // Weighted clustering: neighbour-pair weight over the capacity of the
    // hub's own connections.
    let mut coefficients = Vec::new();
    for i in 0..n {
        let neighbours: Vec<usize> = (0..n).filter(|&j| j != i && matrix[i][j] > 0.0).collect();
        if neighbours.len() < 2 {
            continue;
        }
        let mut neighbour_weights = 0.0f32;
        let mut max_weights = 0.0f32;
        for a in 0..neighbours.len() {
            for b in (a + 1)..neighbours.len() {
                neighbour_weights += matrix[neighbours[a]][neighbours[b]];
                max_weights += (matrix[i][neighbours[a]] + matrix[i][neighbours[b]]) / 2.0;
            }
        }
        if max_weights > 0.0 {
            coefficients.push(neighbour_weights / max_weights);
        }
    }
    let clustering = if coefficients.is_empty() {
        0.0
    } else {
        mean(&coefficients)
    };
    bundle.insert(format!("{prefix}_clustering"), vec![clustering]);

    let strengths: Vec<f32> = (0..n)
        .map(|i| (0..n).filter(|&j| j != i).map(|j| matrix[i][j]).sum())
        .collect();
    bundle.insert(format!("{prefix}_mean_strength"), vec![mean(&strengths)]);
    bundle.insert(format!("{prefix}_std_strength"), vec![std_dev(&strengths)]);

    // Simplified betweenness: how often a node hosts the strongest two-hop
    // path between a pair.
    let mut betweenness = vec![0.0f32; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let mut best = 0.0f32;
            let mut best_node = None;
            for k in 0..n {
                if k == i || k == j {
                    continue;
                }
                let strength = matrix[i][k] * matrix[k][j];
                if strength > best {
                    best = strength;
                    best_node = Some(k);
                }
            }
            if let Some(k) = best_node {
                betweenness[k] += 1.0;
            }
        }
    }
    if n > 2 {
        let norm = ((n - 1) * (n - 2)) as f32 / 2.0;
        for b in betweenness.iter_mut() {
            *b /= norm;
        }
    }
    bundle.insert(
        format!("{prefix}_mean_betweenness"),
        vec![mean(&betweenness)],
    );

    // Small-world index against a uniform random graph of the same mean
    // weight.
    let mean_weight = if upper.is_empty() {
        0.0
    } else {
        mean(&upper)
    };
    if mean_weight > f32::EPSILON && efficiency > f32::EPSILON {
        let small_world = (clustering / mean_weight) / (efficiency / mean_weight);
        bundle.insert(format!("{prefix}_small_world"), vec![small_world]);
    }

    // Modularity of mean-threshold communities.
    bundle.insert(
        format!("{prefix}_modularity"),
        vec![modularity(matrix, mean_weight)],
    );
}

/// Newman modularity over communities formed by thresholding at the mean
/// weight and taking connected components.
fn modularity(matrix: &[Vec<f32>], threshold: f32) -> f32 {
    let n = matrix.len();
    let mut community = vec![usize::MAX; n];
    let mut count = 0usize;
    for start in 0..n {
        if community[start] != usize::MAX {
            continue;
        }
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if community[node] != usize::MAX {
                continue;
            }
            community[node] = count;
            for next in 0..n {
                if next != node
                    && matrix[node][next] > threshold
                    && community[next] == usize::MAX
                {
                    stack.push(next);
                }
            }
        }
        count += 1;
    }
    let total: f32 = (0..n)
        .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
        .map(|(i, j)| matrix[i][j])
        .sum();
    if total <= f32::EPSILON {
        return 0.0;
    }
    let mut q = 0.0f32;
    for i in 0..n {
        for j in 0..n {
            if i == j || community[i] != community[j] {
                continue;
            }
            let k_i: f32 = (0..n).filter(|&x| x != i).map(|x| matrix[i][x]).sum();
            let k_j: f32 = (0..n).filter(|&x| x != j).map(|x| matrix[j][x]).sum();
            q += matrix[i][j] / total - (k_i * k_j) / (total * total);
        }
    }
    q
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

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            num_channels: 8,
            ..Default::default()
        }
    }

    fn coupled_matrix(channels: usize, n: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let shared: Vec<f32> = (0..n)
            .map(|i| {
                (30.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0).sin()) as f32
            })
            .collect();
        Array2::from_shape_fn((channels, n), |(_, i)| shared[i] + 2.0 * gaussian(&mut rng))
    }

    #[test]
    fn gates_on_channels_and_quality() {
        let small = coupled_matrix(4, 500, 1);
        assert!(extract(&small, &config(), 1.0).is_empty());
        let big = coupled_matrix(8, 500, 2);
        assert!(extract(&big, &config(), 0.7).is_empty());
        assert!(!extract(&big, &config(), 0.9).is_empty());
    }

    #[test]
    fn shared_oscillation_yields_high_alpha_coherence_and_plv() {
        let data = coupled_matrix(8, 1000, 3);
        let bundle = extract(&data, &config(), 1.0);
        assert!(bundle["alpha_coherence_mean"][0] > 0.5);
        assert!(bundle["alpha_plv_mean"][0] > 0.7);
        assert_eq!(bundle["te_directionality"].len(), 8);
    }

    #[test]
    fn independent_noise_has_low_plv() {
        let mut rng = StdRng::seed_from_u64(4);
        let data = Array2::from_shape_fn((8, 1000), |_| gaussian(&mut rng));
        let bundle = extract(&data, &config(), 1.0);
        assert!(bundle["alpha_plv_mean"][0] < 0.4);
    }

    #[test]
    fn transfer_entropy_detects_direction_of_driving() {
        // X is a lagged copy of Y plus noise: information flows Y → X.
        let mut rng = StdRng::seed_from_u64(5);
        let n = 2000;
        let lag = 5usize;
        let y: Vec<f32> = {
            let mut acc = 0.0f32;
            (0..n)
                .map(|_| {
                    acc = 0.9 * acc + gaussian(&mut rng);
                    acc
                })
                .collect()
        };
        let x: Vec<f32> = (0..n)
            .map(|t| {
                if t >= lag {
                    0.8 * y[t - lag] + 0.1 * gaussian(&mut rng)
                } else {
                    0.1 * gaussian(&mut rng)
                }
            })
            .collect();
        let te_forward = transfer_entropy(&y, &x, 8, 10);
        let te_backward = transfer_entropy(&x, &y, 8, 10);
        assert!(
            te_forward > te_backward,
            "forward {te_forward} backward {te_backward}"
        );
    }

    #[test]
    fn mutual_information_ranks_dependence() {
        let mut rng = StdRng::seed_from_u64(6);
        let a: Vec<f32> = (0..2000).map(|_| gaussian(&mut rng)).collect();
        let dependent: Vec<f32> = a.iter().map(|&v| v * v).collect();
        let independent: Vec<f32> = (0..2000).map(|_| gaussian(&mut rng)).collect();
        assert!(mutual_information(&a, &dependent) > mutual_information(&a, &independent));
    }

    #[test]
    fn tort_pac_detects_modulated_amplitude() {
        // 40 Hz amplitude modulated by 6 Hz phase.
        let fs = 250.0;
        let n = 2000;
        let signal: Vec<f32> = (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                let slow = (2.0 * std::f64::consts::PI * 6.0 * t).sin();
                let fast = (2.0 * std::f64::consts::PI * 40.0 * t).sin();
                (10.0 * slow + (1.0 + 0.8 * slow) * 5.0 * fast) as f32
            })
            .collect();
        let phase_sos = butter_bandpass(4, 4.0, 8.0, fs).unwrap();
        let amp_sos = butter_bandpass(4, 30.0, 50.0, fs).unwrap();
        let phase = instantaneous_phase(&phase_sos.filtfilt(&signal));
        let amplitude: Vec<f64> = analytic(&amp_sos.filtfilt(&signal))
            .iter()
            .map(|c| c.norm())
            .collect();
        let coupled = tort_mi(&phase, &amplitude);

        let mut rng = StdRng::seed_from_u64(7);
        let noise: Vec<f32> = (0..n).map(|_| 5.0 * gaussian(&mut rng)).collect();
        let phase_n = instantaneous_phase(&phase_sos.filtfilt(&noise));
        let amp_n: Vec<f64> = analytic(&amp_sos.filtfilt(&noise))
            .iter()
            .map(|c| c.norm())
            .collect();
        let uncoupled = tort_mi(&phase_n, &amp_n);
        assert!(coupled > 3.0 * uncoupled, "coupled {coupled} vs {uncoupled}");
    }

    #[test]
    fn network_features_are_emitted_for_each_matrix() {
        let data = coupled_matrix(8, 800, 8);
        let bundle = extract(&data, &config(), 1.0);
        for prefix in [
            "alpha_coherence",
            "alpha_imag_coherence",
            "alpha_plv",
            "transfer_entropy",
            "mutual_information",
        ] {
            assert!(
                bundle.contains_key(&format!("{prefix}_global_efficiency")),
                "missing {prefix} efficiency"
            );
            assert!(bundle.contains_key(&format!("{prefix}_modularity")));
        }
        assert!(bundle.contains_key("pac_4_30hz"));
        assert_eq!(bundle["pac_4_30hz"].len(), 8);
    }
}
