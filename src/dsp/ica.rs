//! Whitened FastICA (parallel / symmetric variant with the logcosh
//! nonlinearity) for artifact component separation.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{EngineError, Result};

pub struct IcaModel {
    /// comp×channels: sources = unmixing · (x − mean).
    pub unmixing: DMatrix<f64>,
    /// channels×comp: x̂ = mixing · sources + mean.
    pub mixing: DMatrix<f64>,
    pub mean: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// M^{-1/2} for a symmetric positive-definite matrix via eigendecomposition.
fn inverse_sqrt(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let eig = SymmetricEigen::new(m.clone());
    let mut d = DMatrix::zeros(m.nrows(), m.ncols());
    for (i, &v) in eig.eigenvalues.iter().enumerate() {
        if v <= 1e-12 {
            return Err(EngineError::ProcessingFailed(
                "degenerate covariance in ICA whitening".into(),
            ));
        }
        d[(i, i)] = 1.0 / v.sqrt();
    }
    Ok(&eig.eigenvectors * d * eig.eigenvectors.transpose())
}

/// Fits FastICA on a channels×samples window.
pub fn fast_ica(
    data: &Array2<f32>,
    n_components: usize,
    max_iter: usize,
    tol: f64,
    seed: u64,
) -> Result<IcaModel> {
    let channels = data.nrows();
    let samples = data.ncols();
    let comp = n_components.min(channels).max(1);
    if samples < channels * 2 {
        return Err(EngineError::ProcessingFailed(
            "too few samples for ICA".into(),
        ));
    }

    // Center.
    let mut x = DMatrix::<f64>::zeros(channels, samples);
    let mut mean = DVector::<f64>::zeros(channels);
    for ch in 0..channels {
        let mut acc = 0.0;
        for s in 0..samples {
            acc += data[[ch, s]] as f64;
        }
        mean[ch] = acc / samples as f64;
        for s in 0..samples {
            x[(ch, s)] = data[[ch, s]] as f64 - mean[ch];
        }
    }

    // Whiten: K = D^{-1/2}_comp · Eᵀ_comp from the sample covariance.
    let cov = &x * x.transpose() / samples as f64;
    let eig = SymmetricEigen::new(cov);
    // nalgebra does not order eigenvalues; sort descending.
    let mut order: Vec<usize> = (0..channels).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut k = DMatrix::<f64>::zeros(comp, channels);
    for (row, &idx) in order.iter().take(comp).enumerate() {
        let ev = eig.eigenvalues[idx];
        if ev <= 1e-12 {
            return Err(EngineError::ProcessingFailed(
                "rank-deficient window in ICA whitening".into(),
            ));
        }
        let scale = 1.0 / ev.sqrt();
        for ch in 0..channels {
            k[(row, ch)] = eig.eigenvectors[(ch, idx)] * scale;
        }
    }
    let xw = &k * &x;

    // Random orthogonal initial unmixing matrix.
    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = DMatrix::<f64>::from_fn(comp, comp, |_, _| rng.gen_range(-1.0..1.0));
    w = inverse_sqrt(&(&w * w.transpose()))? * w;

    let mut converged = false;
    let mut iterations = 0;
    for iter in 0..max_iter {
        iterations = iter + 1;
        let wx = &w * &xw;
        // logcosh: g = tanh, g' = 1 − tanh².
        let g = wx.map(|v| v.tanh());
        let g_prime_mean: Vec<f64> = (0..comp)
            .map(|r| {
                (0..samples)
                    .map(|s| 1.0 - g[(r, s)] * g[(r, s)])
                    .sum::<f64>()
                    / samples as f64
            })
            .collect();
        let mut w_new = &g * xw.transpose() / samples as f64;
        for r in 0..comp {
            for c in 0..comp {
                w_new[(r, c)] -= g_prime_mean[r] * w[(r, c)];
            }
        }
        w_new = inverse_sqrt(&(&w_new * w_new.transpose()))? * w_new;

        // Convergence: rows aligned with the previous iteration.
        let alignment = &w_new * w.transpose();
        let max_dev = (0..comp)
            .map(|i| (alignment[(i, i)].abs() - 1.0).abs())
            .fold(0.0f64, f64::max);
        w = w_new;
        if max_dev < tol {
            converged = true;
            break;
        }
    }

    let unmixing = &w * &k;
    let mixing = unmixing
        .clone()
        .svd(true, true)
        .pseudo_inverse(1e-10)
        .map_err(|e| EngineError::ProcessingFailed(format!("ICA pseudo-inverse: {e}")))?;

    Ok(IcaModel {
        unmixing,
        mixing,
        mean,
        converged,
        iterations,
    })
}

impl IcaModel {
    pub fn n_components(&self) -> usize {
        self.unmixing.nrows()
    }

    /// comp×samples source activations.
    pub fn sources(&self, data: &Array2<f32>) -> Array2<f64> {
        let channels = data.nrows();
        let samples = data.ncols();
        let mut centered = DMatrix::<f64>::zeros(channels, samples);
        for ch in 0..channels {
            for s in 0..samples {
                centered[(ch, s)] = data[[ch, s]] as f64 - self.mean[ch];
            }
        }
        let src = &self.unmixing * centered;
        Array2::from_shape_fn((src.nrows(), src.ncols()), |(r, c)| src[(r, c)])
    }

    /// Reconstructs the channel signals keeping only the sources whose flag
    /// is true; rejected components are zeroed.
    pub fn reconstruct(&self, sources: &Array2<f64>, keep: &[bool]) -> Array2<f32> {
        let comp = sources.nrows();
        let samples = sources.ncols();
        let mut kept = DMatrix::<f64>::zeros(comp, samples);
        for r in 0..comp {
            if keep.get(r).copied().unwrap_or(true) {
                for c in 0..samples {
                    kept[(r, c)] = sources[[r, c]];
                }
            }
        }
        let rec = &self.mixing * kept;
        Array2::from_shape_fn((rec.nrows(), rec.ncols()), |(r, c)| {
            (rec[(r, c)] + self.mean[r]) as f32
        })
    }
}
