//! Scalar statistics over sample slices. Accumulation runs in f64; results
//! come back as f32 to match the sample type.

pub fn mean(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    (data.iter().map(|&v| v as f64).sum::<f64>() / data.len() as f64) as f32
}

/// Population variance, matching numpy's default ddof=0.
pub fn variance(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data) as f64;
    (data
        .iter()
        .map(|&v| {
            let d = v as f64 - m;
            d * d
        })
        .sum::<f64>()
        / data.len() as f64) as f32
}

pub fn std_dev(data: &[f32]) -> f32 {
    variance(data).sqrt()
}

pub fn rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    ((data.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / data.len() as f64).sqrt())
        as f32
}

pub fn peak_to_peak(data: &[f32]) -> f32 {
    let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
    for &v in data {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if lo.is_finite() && hi.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

/// Fisher skewness (third standardized moment).
pub fn skewness(data: &[f32]) -> f32 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(data) as f64;
    let mut m2 = 0.0f64;
    let mut m3 = 0.0f64;
    for &v in data {
        let d = v as f64 - m;
        m2 += d * d;
        m3 += d * d * d;
    }
    m2 /= n as f64;
    m3 /= n as f64;
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    (m3 / m2.powf(1.5)) as f32
}

/// Excess kurtosis (fourth standardized moment − 3), scipy's default.
pub fn kurtosis(data: &[f32]) -> f32 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(data) as f64;
    let mut m2 = 0.0f64;
    let mut m4 = 0.0f64;
    for &v in data {
        let d = v as f64 - m;
        let d2 = d * d;
        m2 += d2;
        m4 += d2 * d2;
    }
    m2 /= n as f64;
    m4 /= n as f64;
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    (m4 / (m2 * m2) - 3.0) as f32
}

/// Linear-interpolated percentile, numpy style. `p` in [0, 100].
pub fn percentile(data: &[f32], p: f32) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p as f64 / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = (rank - lo as f64) as f32;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

pub fn median(data: &[f32]) -> f32 {
    percentile(data, 50.0)
}

/// Median absolute deviation from the median.
pub fn mad(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let med = median(data);
    let deviations: Vec<f32> = data.iter().map(|&v| (v - med).abs()).collect();
    median(&deviations)
}

pub fn pearson(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]) as f64;
    let mb = mean(&b[..n]) as f64;
    let mut cov = 0.0f64;
    let mut va = 0.0f64;
    let mut vb = 0.0f64;
    for i in 0..n {
        let da = a[i] as f64 - ma;
        let db = b[i] as f64 - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    let denom = (va * vb).sqrt();
    if denom <= f64::EPSILON {
        0.0
    } else {
        (cov / denom) as f32
    }
}

/// Least-squares line fit over (0..n, data); returns (slope, intercept).
pub fn linear_fit(data: &[f32]) -> (f32, f32) {
    let n = data.len();
    if n < 2 {
        return (0.0, data.first().copied().unwrap_or(0.0));
    }
    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = mean(data) as f64;
    let mut sxy = 0.0f64;
    let mut sxx = 0.0f64;
    for (i, &v) in data.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (v as f64 - y_mean);
        sxx += dx * dx;
    }
    if sxx <= f64::EPSILON {
        return (0.0, y_mean as f32);
    }
    let slope = sxy / sxx;
    (slope as f32, (y_mean - slope * x_mean) as f32)
}

pub fn zero_crossings(data: &[f32]) -> usize {
    data.windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count()
}

/// Shannon entropy of a histogram with `bins` equal-width bins, in nats.
pub fn histogram_entropy(data: &[f32], bins: usize) -> f32 {
    if data.is_empty() || bins == 0 {
        return 0.0;
    }
    let lo = data.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !(hi - lo).is_finite() || hi - lo <= f32::EPSILON {
        return 0.0;
    }
    let mut counts = vec![0usize; bins];
    let width = (hi - lo) / bins as f32;
    for &v in data {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let total = data.len() as f64;
    -counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            p * p.ln()
        })
        .sum::<f64>() as f32
}

/// Shannon entropy of a pre-normalized distribution, in nats.
pub fn distribution_entropy(p: &[f64]) -> f64 {
    -p.iter().filter(|&&v| v > 0.0).map(|&v| v * v.ln()).sum::<f64>()
}
