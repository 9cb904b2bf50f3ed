//! Artifact removal: ICA component rejection and EOG regression.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::config::ProcessorConfig;
use crate::dsp::ica::fast_ica;
use crate::dsp::stats::kurtosis;
use crate::dsp::welch_psd;
use crate::error::{EngineError, Result};

const ICA_MAX_ITER: usize = 500;
const ICA_TOL: f64 = 1e-4;
const ICA_SEED: u64 = 0x1CA;

/// EOG contribution is subtracted only when the fit explains at least this
/// share of channel variance.
const REGRESSION_R2_MIN: f64 = 0.10;

/// Classifies an independent component as artifactual.
///
/// A component is rejected when its spectrum concentrates in the ocular band
/// (≥80% of power in 0.1–4 Hz), the muscle band (≥70% in 20–100 Hz), or its
/// amplitude distribution is extremely peaked (|kurtosis| > 10).
fn is_artifact_component(source: &[f32], fs: f64) -> bool {
    if kurtosis(source).abs() > 10.0 {
        return true;
    }
    let nperseg = (2.0 * fs) as usize;
    let (freqs, psd) = welch_psd(source, fs, nperseg.min(source.len()).max(8));
    let total: f64 = psd.iter().sum();
    if total <= f64::EPSILON {
        return false;
    }
    let band_fraction = |lo: f64, hi: f64| -> f64 {
        freqs
            .iter()
            .zip(&psd)
            .filter(|(f, _)| **f >= lo && **f <= hi)
            .map(|(_, p)| *p)
            .sum::<f64>()
            / total
    };
    band_fraction(0.1, 4.0) >= 0.8 || band_fraction(20.0, 100.0) >= 0.7
}

/// ICA-based artifact removal: flagged components are zeroed before
/// reconstruction. Returns the cleaned window and the rejected count.
pub fn ica_stage(data: &Array2<f32>, config: &ProcessorConfig) -> Result<(Array2<f32>, usize)> {
    let fs = config.sampling_rate as f64;
    let components = config.effective_ica_components();
    let model = fast_ica(data, components, ICA_MAX_ITER, ICA_TOL, ICA_SEED)?;
    let sources = model.sources(data);

    let mut keep = vec![true; model.n_components()];
    let mut rejected = 0usize;
    for (idx, keep_flag) in keep.iter_mut().enumerate() {
        let source: Vec<f32> = sources.row(idx).iter().map(|&v| v as f32).collect();
        if is_artifact_component(&source, fs) {
            *keep_flag = false;
            rejected += 1;
        }
    }
    if rejected == model.n_components() {
        // Rejecting everything would blank the window; keep the original.
        return Ok((data.clone(), 0));
    }
    Ok((model.reconstruct(&sources, &keep), rejected))
}

/// Ordinary least squares of `y` on the columns of `x`; both are centered by
/// the caller. Returns (coefficients, r_squared).
fn ols(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(DVector<f64>, f64)> {
    let beta = x
        .clone()
        .svd(true, true)
        .solve(y, 1e-12)
        .map_err(|e| EngineError::ProcessingFailed(format!("OLS solve: {e}")))?;
    let fitted = x * &beta;
    let ss_res: f64 = (y - &fitted).iter().map(|v| v * v).sum();
    let ss_tot: f64 = y.iter().map(|v| v * v).sum();
    let r2 = if ss_tot <= f64::EPSILON {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    };
    Ok((beta, r2))
}

/// Regression-based ocular artifact removal: for every non-EOG channel, the
/// OLS fit over the declared EOG channels is subtracted when R² > 0.10.
pub fn regression_stage(
    data: &Array2<f32>,
    config: &ProcessorConfig,
) -> Result<(Array2<f32>, usize)> {
    let eog = &config.eog_channels;
    if eog.is_empty() {
        return Ok((data.clone(), 0));
    }
    let channels = data.nrows();
    let samples = data.ncols();
    for &ch in eog {
        if ch >= channels {
            return Err(EngineError::BadParameter(format!(
                "EOG channel {ch} out of range"
            )));
        }
    }

    // Centered EOG design matrix (samples × n_eog).
    let mut x = DMatrix::<f64>::zeros(samples, eog.len());
    for (col, &ch) in eog.iter().enumerate() {
        let mean = data.row(ch).iter().map(|&v| v as f64).sum::<f64>() / samples as f64;
        for s in 0..samples {
            x[(s, col)] = data[[ch, s]] as f64 - mean;
        }
    }

    let mut out = data.clone();
    let mut corrected = 0usize;
    for ch in 0..channels {
        if eog.contains(&ch) {
            continue;
        }
        let mean = data.row(ch).iter().map(|&v| v as f64).sum::<f64>() / samples as f64;
        let y = DVector::from_fn(samples, |s, _| data[[ch, s]] as f64 - mean);
        let (beta, r2) = ols(&x, &y)?;
        if r2 > REGRESSION_R2_MIN {
            let fitted = &x * beta;
            for s in 0..samples {
                out[[ch, s]] = (data[[ch, s]] as f64 - fitted[s]) as f32;
            }
            corrected += 1;
        }
    }
    Ok((out, corrected))
}

/// Runs the configured artifact methods in order.
pub fn artifact_stage(data: &Array2<f32>, config: &ProcessorConfig) -> Result<Array2<f32>> {
    let mut current = data.clone();
    for method in &config.artifact_methods {
        current = match method {
            crate::config::ArtifactMethod::Ica => ica_stage(&current, config)?.0,
            crate::config::ArtifactMethod::Regression => {
                regression_stage(&current, config)?.0
            }
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    #[test]
    fn slow_heavy_component_is_flagged() {
        // 1 Hz dominates → ocular band fraction near 1.
        let fs = 250.0;
        let slow: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f64::consts::PI * 1.0 * i as f64 / fs).sin() as f32)
            .collect();
        assert!(is_artifact_component(&slow, fs));
        let alpha: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f64::consts::PI * 10.0 * i as f64 / fs).sin() as f32)
            .collect();
        assert!(!is_artifact_component(&alpha, fs));
    }

    #[test]
    fn spiky_component_is_flagged_by_kurtosis() {
        let mut spiky = vec![0.0f32; 1000];
        spiky[100] = 100.0;
        spiky[500] = -120.0;
        for (i, v) in spiky.iter_mut().enumerate() {
            *v += (i as f32 * 0.01).sin() * 0.1;
        }
        assert!(is_artifact_component(&spiky, 250.0));
    }

    #[test]
    fn regression_removes_shared_eog_contribution() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 1000;
        let eog: Vec<f64> = (0..n)
            .map(|i| 50.0 * (2.0 * std::f64::consts::PI * 0.8 * i as f64 / 250.0).sin())
            .collect();
        // Channel 0 carries 60% of the EOG plus its own alpha rhythm.
        let mut data = Array2::<f32>::zeros((3, n));
        for i in 0..n {
            let alpha = 5.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0).sin();
            data[[0, i]] = (0.6 * eog[i] + alpha + 0.1 * gaussian(&mut rng)) as f32;
            data[[1, i]] = (alpha * 0.8 + 0.1 * gaussian(&mut rng)) as f32;
            data[[2, i]] = eog[i] as f32;
        }
        let mut config = ProcessorConfig::default();
        config.num_channels = 3;
        config.eog_channels = vec![2];
        let (cleaned, corrected) = regression_stage(&data, &config).unwrap();
        assert_eq!(corrected, 1);
        // The contaminated channel loses its slow component.
        let before: Vec<f32> = data.row(0).iter().copied().collect();
        let after: Vec<f32> = cleaned.row(0).iter().copied().collect();
        let slow_before = crate::dsp::stats::pearson(
            &before,
            &eog.iter().map(|&v| v as f32).collect::<Vec<_>>(),
        )
        .abs();
        let slow_after = crate::dsp::stats::pearson(
            &after,
            &eog.iter().map(|&v| v as f32).collect::<Vec<_>>(),
        )
        .abs();
        assert!(slow_after < 0.2, "residual correlation {slow_after}");
        assert!(slow_before > 0.8);
        // The clean channel is untouched.
        for i in 0..n {
            assert!((cleaned[[1, i]] - data[[1, i]]).abs() < 1e-6);
        }
    }

    #[test]
    fn ica_stage_preserves_shape() {
        let mut rng = StdRng::seed_from_u64(17);
        let n = 1000;
        let data = Array2::from_shape_fn((4, n), |(ch, i)| {
            let alpha =
                10.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0 + ch as f64).sin();
            (alpha + gaussian(&mut rng)) as f32
        });
        let config = ProcessorConfig {
            num_channels: 4,
            ..Default::default()
        };
        let (cleaned, _) = ica_stage(&data, &config).unwrap();
        assert_eq!(cleaned.dim(), data.dim());
    }
}
