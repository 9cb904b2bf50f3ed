//! Per-window signal quality assessment: SNR, noise, line interference,
//! artifact load, channel health flags and a composite score.

use ndarray::Array2;

use crate::config::ProcessorConfig;
use crate::dsp::filter::{butter_highpass, butter_lowpass, savgol_smooth, Sos};
use crate::dsp::stats::{linear_fit, median, std_dev, variance};
use crate::dsp::{band_power, butter_bandpass, periodogram};
use crate::error::Result;
use crate::preprocess::repair::is_clipping;
use crate::types::QualityMetrics;

/// SNR (dB) at which a channel is merely acceptable / fully good.
const SNR_ACCEPTABLE_DB: f32 = 5.0;
const SNR_GOOD_DB: f32 = 10.0;

/// Amplitude beyond which any sample is an artifact (µV).
const ARTIFACT_AMPLITUDE_UV: f32 = 200.0;
/// High-frequency burst threshold over 100 ms windows (µV RMS).
const ARTIFACT_HF_RMS_UV: f32 = 50.0;

const FLATLINE_STD_UV: f32 = 0.5;
const MAX_NOISE_UV: f32 = 50.0;
const MAX_DRIFT_UV_PER_S: f32 = 10.0;

pub struct QualityAssessor {
    sampling_rate: f32,
    line_frequency: f32,
    signal_band: Sos,
    noise_band: Option<Sos>,
    hf_band: Option<Sos>,
    drift_band: Sos,
}

impl QualityAssessor {
    pub fn new(config: &ProcessorConfig) -> Result<Self> {
        let fs = config.sampling_rate as f64;
        let nyquist = fs / 2.0;
        let signal_hi = 40.0f64.min(nyquist - 1.0);
        let signal_band = butter_bandpass(4, 1.0, signal_hi, fs)?;
        // High-frequency noise band only exists with enough bandwidth.
        let noise_hi = 100.0f64.min(nyquist - 10.0);
        let noise_band = if fs > 200.0 && noise_hi > 60.0 {
            Some(butter_bandpass(4, 60.0, noise_hi, fs)?)
        } else {
            None
        };
        let hf_band = if nyquist > 35.0 {
            Some(butter_highpass(4, 30.0, fs)?)
        } else {
            None
        };
        let drift_band = butter_lowpass(2, 0.5f64.min(nyquist * 0.5), fs)?;
        Ok(Self {
            sampling_rate: config.sampling_rate,
            line_frequency: config.notch_frequencies.first().copied().unwrap_or(50.0),
            signal_band,
            noise_band,
            hf_band,
            drift_band,
        })
    }

    /// Per-channel noise variance. Above 200 Hz sampling this is the
    /// variance in the high-frequency band; below, the residual of a
    /// Savitzky-Golay smoother over 100 ms windows.
    fn noise_variance(&self, channel: &[f32]) -> f32 {
        match &self.noise_band {
            Some(band) => variance(&band.filtfilt(channel)),
            None => {
                let window = ((0.1 * self.sampling_rate) as usize).max(5);
                let smooth = savgol_smooth(channel, window, 3);
                let residual: Vec<f32> = channel
                    .iter()
                    .zip(&smooth)
                    .map(|(raw, fit)| raw - fit)
                    .collect();
                variance(&residual)
            }
        }
    }

    fn channel_snr_db(&self, channel: &[f32]) -> f32 {
        let signal_var = variance(&self.signal_band.filtfilt(channel));
        let noise_var = self.noise_variance(channel).max(1e-12);
        10.0 * (signal_var / noise_var).max(1e-12).log10()
    }

    /// Piecewise-linear SNR score: 0 at 0 dB, 0.5 at the acceptable bound,
    /// 1.0 from the good bound up.
    fn snr_score(snr_db: f32) -> f32 {
        if snr_db <= 0.0 {
            0.0
        } else if snr_db < SNR_ACCEPTABLE_DB {
            0.5 * snr_db / SNR_ACCEPTABLE_DB
        } else if snr_db < SNR_GOOD_DB {
            0.5 + 0.5 * (snr_db - SNR_ACCEPTABLE_DB) / (SNR_GOOD_DB - SNR_ACCEPTABLE_DB)
        } else {
            1.0
        }
    }

    fn line_noise_amplitude(&self, rows: &[Vec<f32>]) -> f32 {
        let fs = self.sampling_rate as f64;
        if self.line_frequency as f64 >= fs / 2.0 {
            return 0.0;
        }
        let amplitudes: Vec<f32> = rows
            .iter()
            .map(|row| {
                let (freqs, psd) = periodogram(row, fs);
                let lo = (self.line_frequency - 2.0) as f64;
                let hi = (self.line_frequency + 2.0) as f64;
                (band_power(&freqs, &psd, lo, hi).max(0.0)).sqrt() as f32
            })
            .collect();
        median(&amplitudes)
    }

    /// Fraction of samples carrying artifacts: amplitude excursions on any
    /// channel, or high-frequency bursts in 100 ms windows.
    fn artifact_percentage(&self, rows: &[Vec<f32>]) -> f32 {
        let samples = rows.first().map(|r| r.len()).unwrap_or(0);
        if samples == 0 {
            return 0.0;
        }
        let mut flagged = vec![false; samples];
        for row in rows {
            for (i, &v) in row.iter().enumerate() {
                if v.abs() > ARTIFACT_AMPLITUDE_UV {
                    flagged[i] = true;
                }
            }
        }
        if let Some(hf) = &self.hf_band {
            let burst_window = ((0.1 * self.sampling_rate) as usize).max(1);
            for row in rows {
                let high = hf.filtfilt(row);
                for (start, chunk) in high.chunks(burst_window).enumerate() {
                    if crate::dsp::stats::rms(chunk) > ARTIFACT_HF_RMS_UV {
                        let begin = start * burst_window;
                        for f in flagged.iter_mut().skip(begin).take(chunk.len()) {
                            *f = true;
                        }
                    }
                }
            }
        }
        flagged.iter().filter(|&&f| f).count() as f32 / samples as f32 * 100.0
    }

    fn baseline_drift(&self, rows: &[Vec<f32>]) -> f32 {
        let slopes: Vec<f32> = rows
            .iter()
            .map(|row| {
                let trend = self.drift_band.filtfilt(row);
                let (slope_per_sample, _) = linear_fit(&trend);
                (slope_per_sample * self.sampling_rate).abs()
            })
            .collect();
        median(&slopes)
    }

    pub fn assess(&self, data: &Array2<f32>) -> QualityMetrics {
        let channels = data.nrows();
        let rows: Vec<Vec<f32>> = (0..channels)
            .map(|ch| data.row(ch).iter().copied().collect())
            .collect();

        let channel_snr_db: Vec<f32> = rows.iter().map(|r| self.channel_snr_db(r)).collect();
        let noise_stds: Vec<f32> = rows
            .iter()
            .map(|r| self.noise_variance(r).sqrt())
            .collect();
        let snr_db = median(&channel_snr_db);
        let rms_noise_uv = median(&noise_stds);
        let line_noise_uv = self.line_noise_amplitude(&rows);
        let artifact_percentage = self.artifact_percentage(&rows);
        let baseline_drift = self.baseline_drift(&rows);

        let flatline_channels: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| std_dev(r) < FLATLINE_STD_UV)
            .map(|(ch, _)| ch)
            .collect();
        let clipping_channels: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(ch, r)| !flatline_channels.contains(ch) && is_clipping(r))
            .map(|(ch, _)| ch)
            .collect();
        let noise_median = median(&noise_stds);
        let noise_spread = std_dev(&noise_stds);
        let high_impedance_channels: Vec<usize> = noise_stds
            .iter()
            .enumerate()
            .filter(|(ch, &n)| {
                noise_spread > f32::EPSILON
                    && n > noise_median + 2.0 * noise_spread
                    && !flatline_channels.contains(ch)
            })
            .map(|(ch, _)| ch)
            .collect();

        let channel_scores: Vec<f32> = (0..channels)
            .map(|ch| {
                if flatline_channels.contains(&ch) {
                    return 0.0;
                }
                let mut score = Self::snr_score(channel_snr_db[ch]);
                if clipping_channels.contains(&ch) {
                    score *= 0.3;
                }
                if high_impedance_channels.contains(&ch) {
                    score *= 0.5;
                }
                score.clamp(0.0, 1.0)
            })
            .collect();

        let bad_count =
            flatline_channels.len() + clipping_channels.len() + high_impedance_channels.len();
        let good_ratio = if channels > 0 {
            1.0 - (bad_count.min(channels) as f32 / channels as f32)
        } else {
            1.0
        };

        let mut composite = Self::snr_score(snr_db);
        if rms_noise_uv > MAX_NOISE_UV {
            composite *= 0.8;
        }
        if artifact_percentage > 10.0 {
            composite *= 0.7;
        } else if artifact_percentage > 5.0 {
            composite *= 0.85;
        }
        if good_ratio < 0.8 {
            composite *= good_ratio;
        }
        if baseline_drift > MAX_DRIFT_UV_PER_S {
            composite *= 0.9;
        }
        let composite_score = composite.clamp(0.0, 1.0);

        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        if snr_db < SNR_ACCEPTABLE_DB {
            issues.push(format!("low signal-to-noise ratio ({snr_db:.1} dB)"));
            recommendations
                .push("check electrode contact and re-apply conductive gel".to_string());
        }
        if rms_noise_uv > MAX_NOISE_UV {
            issues.push(format!("high noise floor ({rms_noise_uv:.1} µV RMS)"));
            recommendations
                .push("move cables away from power sources and braid the leads".to_string());
        }
        if line_noise_uv > 10.0 {
            issues.push(format!(
                "line interference at {:.0} Hz ({line_noise_uv:.1} µV)",
                self.line_frequency
            ));
            recommendations.push("enable the notch filter or improve grounding".to_string());
        }
        if artifact_percentage > 10.0 {
            issues.push(format!(
                "artifacts on {artifact_percentage:.1}% of samples"
            ));
            recommendations
                .push("ask the subject to relax and minimize movement".to_string());
        }
        if !flatline_channels.is_empty() {
            issues.push(format!("flatlined channels: {flatline_channels:?}"));
            recommendations.push("reseat or replace the flat electrodes".to_string());
        }
        if !clipping_channels.is_empty() {
            issues.push(format!("clipping channels: {clipping_channels:?}"));
            recommendations.push("reduce amplifier gain on clipped channels".to_string());
        }
        if !high_impedance_channels.is_empty() {
            issues.push(format!(
                "high-impedance channels: {high_impedance_channels:?}"
            ));
            recommendations.push("re-prepare the skin on noisy electrodes".to_string());
        }
        if baseline_drift > MAX_DRIFT_UV_PER_S {
            issues.push(format!("baseline drift {baseline_drift:.1} µV/s"));
            recommendations.push("let the electrodes settle before recording".to_string());
        }

        QualityMetrics {
            composite_score,
            snr_db,
            channel_scores,
            channel_snr_db,
            rms_noise_uv,
            line_noise_uv,
            artifact_percentage,
            baseline_drift_uv_per_s: baseline_drift,
            flatline_channels,
            clipping_channels,
            high_impedance_channels,
            issues,
            recommendations,
        }
    }
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

    fn assessor(fs: f32) -> QualityAssessor {
        let config = ProcessorConfig {
            sampling_rate: fs,
            ..Default::default()
        };
        QualityAssessor::new(&config).unwrap()
    }

    fn clean_alpha(channels: usize, n: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((channels, n), |(ch, i)| {
            let alpha = 30.0
                * ((2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0) + ch as f64 * 0.05)
                    .sin() as f32;
            alpha + 2.0 * gaussian(&mut rng)
        })
    }

    #[test]
    fn clean_alpha_scores_excellent() {
        let q = assessor(250.0).assess(&clean_alpha(8, 500, 1));
        assert!(q.composite_score >= 0.8, "score {}", q.composite_score);
        assert!(q.snr_db > 10.0, "snr {}", q.snr_db);
        assert!(q.artifact_percentage < 5.0);
        assert!(q.flatline_channels.is_empty());
        assert_eq!(q.rating(), "excellent");
    }

    #[test]
    fn scores_stay_in_range() {
        let q = assessor(250.0).assess(&clean_alpha(8, 500, 2));
        assert!((0.0..=1.0).contains(&q.composite_score));
        for &s in &q.channel_scores {
            assert!((0.0..=1.0).contains(&s));
        }
        assert!((0.0..=100.0).contains(&q.artifact_percentage));
    }

    #[test]
    fn flatline_channel_is_reported_and_scored_zero() {
        let mut data = clean_alpha(8, 500, 3);
        for i in 0..500 {
            data[[7, i]] = 0.0;
        }
        let q = assessor(250.0).assess(&data);
        assert!(q.flatline_channels.contains(&7));
        assert_eq!(q.channel_scores[7], 0.0);
        assert!(q.issues.iter().any(|i| i.contains("flatlined")));
    }

    #[test]
    fn heavy_noise_floors_the_composite() {
        // Noise concentrated in the 60–100 Hz estimation band.
        let mut rng = StdRng::seed_from_u64(4);
        let band = butter_bandpass(4, 60.0, 100.0, 250.0).unwrap();
        let data = Array2::from_shape_fn((8, 500), |_| 0.0f32);
        let mut noisy = data.clone();
        for ch in 0..8 {
            let white: Vec<f32> = (0..500).map(|_| 400.0 * gaussian(&mut rng)).collect();
            let shaped = band.filtfilt(&white);
            for (i, &v) in shaped.iter().enumerate() {
                noisy[[ch, i]] = v;
            }
        }
        let q = assessor(250.0).assess(&noisy);
        assert!(q.rms_noise_uv > MAX_NOISE_UV, "noise {}", q.rms_noise_uv);
        assert!(q.composite_score < 0.5);
        assert!(q.issues.iter().any(|i| i.contains("noise")));
    }

    #[test]
    fn large_excursions_raise_artifact_percentage() {
        let mut data = clean_alpha(8, 500, 5);
        for i in 100..160 {
            data[[0, i]] = 400.0;
        }
        let q = assessor(250.0).assess(&data);
        assert!(q.artifact_percentage >= 10.0, "{}", q.artifact_percentage);
    }

    #[test]
    fn low_rate_path_uses_smoother_residual() {
        // At 160 Hz the 60–100 band is unavailable; the Savitzky-Golay
        // residual must still produce a finite, sensible SNR.
        let mut rng = StdRng::seed_from_u64(6);
        let data = Array2::from_shape_fn((4, 320), |(_, i)| {
            (30.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 160.0).sin()) as f32
                + 2.0 * gaussian(&mut rng)
        });
        let q = assessor(160.0).assess(&data);
        assert!(q.snr_db.is_finite());
        assert!(q.composite_score > 0.3);
    }

    #[test]
    fn line_noise_is_measured_near_line_frequency() {
        let mut rng = StdRng::seed_from_u64(7);
        let data = Array2::from_shape_fn((4, 1000), |(_, i)| {
            let line = 30.0 * (2.0 * std::f64::consts::PI * 50.0 * i as f64 / 250.0).sin();
            (line as f32) + 0.5 * gaussian(&mut rng)
        });
        let q = assessor(250.0).assess(&data);
        assert!(q.line_noise_uv > 5.0, "line {}", q.line_noise_uv);
    }
}
