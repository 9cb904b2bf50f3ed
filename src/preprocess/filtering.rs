//! Notch and bandpass stages. Both run zero-phase per channel.

use ndarray::Array2;

use crate::config::ProcessorConfig;
use crate::dsp::filter::{notch_filtfilt, Sos};
use crate::error::Result;

pub fn notch_stage(data: &Array2<f32>, config: &ProcessorConfig) -> Result<Array2<f32>> {
    let fs = config.sampling_rate as f64;
    let q = config.notch_quality as f64;
    let mut out = data.clone();
    for mut row in out.rows_mut() {
        let channel: Vec<f32> = row.iter().copied().collect();
        let filtered = notch_filtfilt(&channel, &config.notch_frequencies, fs, q);
        row.iter_mut().zip(&filtered).for_each(|(dst, &src)| *dst = src);
    }
    Ok(out)
}

/// Applies a pre-designed Butterworth cascade (see `PreprocessPipeline`,
/// which owns the cached design).
pub fn bandpass_stage(data: &Array2<f32>, sos: &Sos) -> Result<Array2<f32>> {
    let mut out = data.clone();
    for mut row in out.rows_mut() {
        let channel: Vec<f32> = row.iter().copied().collect();
        let filtered = sos.filtfilt(&channel);
        row.iter_mut().zip(&filtered).for_each(|(dst, &src)| *dst = src);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::filter::butter_bandpass;
    use crate::dsp::stats::rms;

    fn tone_matrix(freq: f64, fs: f64, channels: usize, n: usize, amp: f64) -> Array2<f32> {
        Array2::from_shape_fn((channels, n), |(_, i)| {
            (amp * (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin()) as f32
        })
    }

    #[test]
    fn notch_stage_preserves_shape_and_kills_line_noise() {
        let config = ProcessorConfig::default();
        let line = tone_matrix(50.0, 250.0, 4, 500, 10.0);
        let out = notch_stage(&line, &config).unwrap();
        assert_eq!(out.dim(), line.dim());
        for row in out.rows() {
            let samples: Vec<f32> = row.iter().copied().collect();
            assert!(rms(&samples) < 1.0);
        }
    }

    #[test]
    fn bandpass_stage_attenuates_out_of_band() {
        let sos = butter_bandpass(4, 0.5, 40.0, 250.0).unwrap();
        let high = tone_matrix(80.0, 250.0, 2, 500, 10.0);
        let out = bandpass_stage(&high, &sos).unwrap();
        assert_eq!(out.dim(), high.dim());
        for row in out.rows() {
            let samples: Vec<f32> = row.iter().copied().collect();
            assert!(rms(&samples) < 0.5);
        }
    }
}
