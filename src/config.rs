use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// One preprocessing stage in the execution plan. The default plan applies
/// them in the declaration order below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Notch,
    Bandpass,
    ArtifactRemoval,
    ChannelRepair,
    SpatialFilter,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Notch => "notch",
            StageKind::Bandpass => "bandpass",
            StageKind::ArtifactRemoval => "artifact_removal",
            StageKind::ChannelRepair => "channel_repair",
            StageKind::SpatialFilter => "spatial_filter",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureGroupKind {
    TimeDomain,
    FrequencyDomain,
    TimeFrequency,
    Spatial,
    Connectivity,
}

impl FeatureGroupKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureGroupKind::TimeDomain => "time_domain",
            FeatureGroupKind::FrequencyDomain => "frequency_domain",
            FeatureGroupKind::TimeFrequency => "time_frequency",
            FeatureGroupKind::Spatial => "spatial",
            FeatureGroupKind::Connectivity => "connectivity",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMethod {
    Ica,
    Regression,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialFilterKind {
    Car,
    Laplacian,
}

/// Phase-amplitude coupling estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacMethod {
    Tort,
    Ozkurt,
}

/// Signal-processing configuration shared by the pipeline, the feature
/// extractor and the quality assessor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub sampling_rate: f32,
    pub num_channels: usize,
    pub channel_names: Vec<String>,
    pub preprocessing_steps: Vec<StageKind>,
    pub feature_types: Vec<FeatureGroupKind>,

    // filtering
    pub notch_frequencies: Vec<f32>,
    pub notch_quality: f32,
    pub bandpass_low: f32,
    pub bandpass_high: f32,
    pub filter_order: usize,

    // artifact removal
    pub artifact_methods: Vec<ArtifactMethod>,
    pub ica_components: Option<usize>,
    pub eog_channels: Vec<usize>,

    // spatial filtering
    pub spatial_filter_type: SpatialFilterKind,
    pub laplacian_radius_cm: f32,
    /// Electrode positions in centimetres, if the montage is known.
    pub channel_positions: Option<Vec<[f32; 3]>>,

    // adaptive gating
    pub quality_threshold: f32,

    // time-frequency
    pub morlet_frequencies: Vec<f32>,

    // connectivity
    pub pac_phase_band: (f32, f32),
    pub pac_amplitude_band: (f32, f32),
    pub pac_method: PacMethod,
    pub te_bins: usize,
    pub te_history: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 250.0,
            num_channels: 8,
            channel_names: Vec::new(),
            preprocessing_steps: vec![
                StageKind::Notch,
                StageKind::Bandpass,
                StageKind::ArtifactRemoval,
                StageKind::ChannelRepair,
                StageKind::SpatialFilter,
            ],
            feature_types: vec![
                FeatureGroupKind::TimeDomain,
                FeatureGroupKind::FrequencyDomain,
                FeatureGroupKind::TimeFrequency,
            ],
            notch_frequencies: vec![50.0, 100.0],
            notch_quality: 30.0,
            bandpass_low: 0.5,
            bandpass_high: 100.0,
            filter_order: 4,
            artifact_methods: vec![ArtifactMethod::Ica, ArtifactMethod::Regression],
            ica_components: None,
            eog_channels: Vec::new(),
            spatial_filter_type: SpatialFilterKind::Car,
            laplacian_radius_cm: 3.0,
            channel_positions: None,
            quality_threshold: 0.5,
            morlet_frequencies: vec![10.0, 20.0, 30.0],
            pac_phase_band: (4.0, 8.0),
            pac_amplitude_band: (30.0, 50.0),
            pac_method: PacMethod::Tort,
            te_bins: 8,
            te_history: 10,
        }
    }
}

impl ProcessorConfig {
    /// Construction-time invariants. A config that fails here must never
    /// enter an operational state.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate <= 0.0 {
            return Err(EngineError::BadParameter(
                "sampling_rate must be positive".into(),
            ));
        }
        if self.num_channels == 0 {
            return Err(EngineError::BadParameter(
                "num_channels must be positive".into(),
            ));
        }
        if self.bandpass_low <= 0.0 {
            return Err(EngineError::BadParameter(
                "bandpass_low must be greater than zero".into(),
            ));
        }
        if self.bandpass_high >= self.sampling_rate / 2.0 {
            return Err(EngineError::BadParameter(format!(
                "bandpass_high {} must stay below the Nyquist frequency {}",
                self.bandpass_high,
                self.sampling_rate / 2.0
            )));
        }
        if self.bandpass_low >= self.bandpass_high {
            return Err(EngineError::BadParameter(
                "bandpass_low must be below bandpass_high".into(),
            ));
        }
        if self.filter_order == 0 {
            return Err(EngineError::BadParameter(
                "filter_order must be at least 1".into(),
            ));
        }
        if let Some(positions) = &self.channel_positions {
            if positions.len() != self.num_channels {
                return Err(EngineError::BadParameter(format!(
                    "channel_positions has {} entries for {} channels",
                    positions.len(),
                    self.num_channels
                )));
            }
        }
        Ok(())
    }

    /// Applies a JSON patch of recognized keys and returns the keys that were
    /// applied. Validation runs on the patched copy first so a rejected patch
    /// leaves the config untouched.
    pub fn apply_patch(&mut self, patch: &serde_json::Map<String, Value>) -> Result<Vec<String>> {
        let mut next = self.clone();
        let mut applied = Vec::new();
        for (key, value) in patch {
            if next.apply_key(key, value)? {
                applied.push(key.clone());
            }
        }
        next.validate()?;
        *self = next;
        Ok(applied)
    }

    fn apply_key(&mut self, key: &str, value: &Value) -> Result<bool> {
        fn bad(key: &str) -> EngineError {
            EngineError::BadParameter(format!("invalid value for {key}"))
        }
        match key {
            "sampling_rate" => {
                self.sampling_rate = value.as_f64().ok_or_else(|| bad(key))? as f32
            }
            "num_channels" => {
                self.num_channels = value.as_u64().ok_or_else(|| bad(key))? as usize
            }
            "channel_names" => {
                self.channel_names =
                    serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "preprocessing_steps" => {
                self.preprocessing_steps =
                    serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "feature_types" => {
                self.feature_types =
                    serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "notch_frequencies" => {
                self.notch_frequencies =
                    serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "bandpass_low" => self.bandpass_low = value.as_f64().ok_or_else(|| bad(key))? as f32,
            "bandpass_high" => {
                self.bandpass_high = value.as_f64().ok_or_else(|| bad(key))? as f32
            }
            "filter_order" => {
                self.filter_order = value.as_u64().ok_or_else(|| bad(key))? as usize
            }
            "artifact_methods" => {
                self.artifact_methods =
                    serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "ica_components" => {
                self.ica_components = Some(value.as_u64().ok_or_else(|| bad(key))? as usize)
            }
            "eog_channels" => {
                self.eog_channels = serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "spatial_filter_type" => {
                self.spatial_filter_type =
                    serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "laplacian_radius" => {
                self.laplacian_radius_cm = value.as_f64().ok_or_else(|| bad(key))? as f32
            }
            "pac_method" => {
                self.pac_method = serde_json::from_value(value.clone()).map_err(|_| bad(key))?
            }
            "quality_threshold" => {
                self.quality_threshold = value.as_f64().ok_or_else(|| bad(key))? as f32
            }
            "filter_specs" => {
                // Nested form: {"bandpass": [lo, hi], "notch": [f...], "order": n}
                let spec = value.as_object().ok_or_else(|| bad(key))?;
                if let Some(band) = spec.get("bandpass") {
                    let band: Vec<f32> =
                        serde_json::from_value(band.clone()).map_err(|_| bad(key))?;
                    if band.len() != 2 {
                        return Err(bad(key));
                    }
                    self.bandpass_low = band[0];
                    self.bandpass_high = band[1];
                }
                if let Some(notch) = spec.get("notch") {
                    self.notch_frequencies =
                        serde_json::from_value(notch.clone()).map_err(|_| bad(key))?;
                }
                if let Some(order) = spec.get("order") {
                    self.filter_order = order.as_u64().ok_or_else(|| bad(key))? as usize;
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn nyquist(&self) -> f32 {
        self.sampling_rate / 2.0
    }

    pub fn effective_ica_components(&self) -> usize {
        self.ica_components
            .unwrap_or(20)
            .min(self.num_channels)
            .max(1)
    }
}

/// Configuration of the per-session sliding-window driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    pub buffer_size_seconds: f32,
    pub window_size_seconds: f32,
    /// Fraction of a window shared with its successor, in [0, 1).
    pub window_overlap: f32,
    pub process_interval_ms: u64,
    pub min_samples_to_process: usize,
    pub max_processing_queue: usize,
    pub drop_on_overflow: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size_seconds: 10.0,
            window_size_seconds: 2.0,
            window_overlap: 0.5,
            process_interval_ms: 100,
            min_samples_to_process: 256,
            max_processing_queue: 5,
            drop_on_overflow: true,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size_seconds <= 0.0 || self.window_size_seconds <= 0.0 {
            return Err(EngineError::BadParameter(
                "buffer and window sizes must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.window_overlap) {
            return Err(EngineError::BadParameter(
                "window_overlap must lie in [0, 1)".into(),
            ));
        }
        if self.window_size_seconds > self.buffer_size_seconds {
            return Err(EngineError::BadParameter(
                "window cannot be longer than the buffer".into(),
            ));
        }
        Ok(())
    }

    pub fn window_samples(&self, sampling_rate: f32) -> usize {
        (self.window_size_seconds * sampling_rate) as usize
    }

    pub fn step_samples(&self, sampling_rate: f32) -> usize {
        let window = self.window_samples(sampling_rate);
        ((window as f32) * (1.0 - self.window_overlap)).round().max(1.0) as usize
    }

    pub fn apply_patch(&mut self, patch: &serde_json::Map<String, Value>) -> Result<Vec<String>> {
        let mut next = self.clone();
        let mut applied = Vec::new();
        for (key, value) in patch {
            let recognized = match key.as_str() {
                "buffer_size_seconds" => {
                    next.buffer_size_seconds = as_f32(key, value)?;
                    true
                }
                "window_size_seconds" => {
                    next.window_size_seconds = as_f32(key, value)?;
                    true
                }
                "window_overlap" => {
                    next.window_overlap = as_f32(key, value)?;
                    true
                }
                "process_interval_ms" => {
                    next.process_interval_ms = as_u64(key, value)?;
                    true
                }
                "min_samples_to_process" => {
                    next.min_samples_to_process = as_u64(key, value)? as usize;
                    true
                }
                "drop_on_overflow" => {
                    next.drop_on_overflow = value
                        .as_bool()
                        .ok_or_else(|| EngineError::BadParameter(key.clone()))?;
                    true
                }
                _ => false,
            };
            if recognized {
                applied.push(key.clone());
            }
        }
        next.validate()?;
        *self = next;
        Ok(applied)
    }
}

/// Alerting thresholds for the quality monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_overall_score: f32,
    pub critical_overall_score: f32,
    pub min_snr_db: f32,
    pub critical_snr_db: f32,
    pub max_noise_level_uv: f32,
    pub critical_noise_level_uv: f32,
    pub max_artifact_percentage: f32,
    pub critical_artifact_percentage: f32,
    pub max_bad_channels: usize,
    pub critical_bad_channels: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_overall_score: 0.6,
            critical_overall_score: 0.4,
            min_snr_db: 5.0,
            critical_snr_db: 3.0,
            max_noise_level_uv: 50.0,
            critical_noise_level_uv: 100.0,
            max_artifact_percentage: 10.0,
            critical_artifact_percentage: 20.0,
            max_bad_channels: 2,
            critical_bad_channels: 4,
        }
    }
}

impl QualityThresholds {
    pub fn apply_patch(&mut self, patch: &serde_json::Map<String, Value>) -> Result<Vec<String>> {
        let mut next = self.clone();
        let mut applied = Vec::new();
        for (key, value) in patch {
            let recognized = match key.as_str() {
                "min_overall_score" => {
                    next.min_overall_score = as_f32(key, value)?;
                    true
                }
                "critical_overall_score" => {
                    next.critical_overall_score = as_f32(key, value)?;
                    true
                }
                "min_snr_db" => {
                    next.min_snr_db = as_f32(key, value)?;
                    true
                }
                "critical_snr_db" => {
                    next.critical_snr_db = as_f32(key, value)?;
                    true
                }
                "max_noise_level" => {
                    next.max_noise_level_uv = as_f32(key, value)?;
                    true
                }
                "critical_noise_level" => {
                    next.critical_noise_level_uv = as_f32(key, value)?;
                    true
                }
                "max_artifact_percentage" => {
                    next.max_artifact_percentage = as_f32(key, value)?;
                    true
                }
                "critical_artifact_percentage" => {
                    next.critical_artifact_percentage = as_f32(key, value)?;
                    true
                }
                "max_bad_channels" => {
                    next.max_bad_channels = as_u64(key, value)? as usize;
                    true
                }
                "critical_bad_channels" => {
                    next.critical_bad_channels = as_u64(key, value)? as usize;
                    true
                }
                _ => false,
            };
            if recognized {
                applied.push(key.clone());
            }
        }
        *self = next;
        Ok(applied)
    }
}

fn as_f32(key: &str, value: &Value) -> Result<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| EngineError::BadParameter(format!("invalid value for {key}")))
}

fn as_u64(key: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| EngineError::BadParameter(format!("invalid value for {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_processor_config_is_valid() {
        ProcessorConfig::default().validate().unwrap();
    }

    #[test]
    fn bandpass_edges_are_rejected() {
        let mut cfg = ProcessorConfig::default();
        cfg.bandpass_low = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = ProcessorConfig::default();
        cfg.bandpass_high = cfg.nyquist();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn patch_applies_recognized_keys_only() {
        let mut cfg = ProcessorConfig::default();
        let patch = json!({
            "bandpass_low": 1.0,
            "bandpass_high": 40.0,
            "nonsense": true,
        });
        let applied = cfg.apply_patch(patch.as_object().unwrap()).unwrap();
        assert_eq!(applied, vec!["bandpass_high", "bandpass_low"]);
        assert_eq!(cfg.bandpass_low, 1.0);
        assert_eq!(cfg.bandpass_high, 40.0);
    }

    #[test]
    fn rejected_patch_leaves_config_unchanged() {
        let mut cfg = ProcessorConfig::default();
        let before = cfg.bandpass_high;
        let patch = json!({ "bandpass_high": 500.0 });
        assert!(cfg.apply_patch(patch.as_object().unwrap()).is_err());
        assert_eq!(cfg.bandpass_high, before);
    }

    #[test]
    fn stream_overlap_out_of_range_is_fatal() {
        let mut cfg = StreamConfig::default();
        cfg.window_overlap = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn step_size_follows_overlap() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.window_samples(250.0), 500);
        assert_eq!(cfg.step_samples(250.0), 250);
    }
}
