use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::StageKind;

/// One acquisition instant across all channels of a device.
///
/// Produced by an adapter, consumed by the buffer; never retained after
/// insertion.
#[derive(Clone, Debug)]
pub struct SampleFrame {
    /// Monotonic timestamp in seconds.
    pub timestamp: f64,
    /// Channel values in microvolts, length = device channel count.
    pub channels: Vec<f32>,
    /// Device sample counter; wraps per device (8-bit on OpenBCI boards).
    pub sample_index: u32,
    pub aux: Option<Vec<f32>>,
    pub marker: Option<i32>,
}

/// Immutable channels×samples slice handed through the processing chain.
#[derive(Clone, Debug)]
pub struct Window {
    pub data: Array2<f32>,
    /// Total-stream index of the first sample.
    pub start_index: u64,
    /// Total-stream index one past the last sample.
    pub end_index: u64,
    /// Estimated acquisition time of the last sample, seconds.
    pub timestamp: f64,
}

impl Window {
    pub fn num_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }
}

/// Outcome record for one executed preprocessing stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub duration_ms: f64,
    pub failed: bool,
}

/// Result of running a window through the preprocessing plan.
#[derive(Clone, Debug)]
pub struct PreprocessOutput {
    pub data: Array2<f32>,
    pub stages: Vec<StageRecord>,
    pub interpolated_channels: Vec<usize>,
    pub bad_channels: Vec<usize>,
}

impl PreprocessOutput {
    pub fn stages_failed(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|s| s.failed)
            .map(|s| s.stage.name())
            .collect()
    }
}

/// Feature name → dense numeric array. Array length is 1 for window scalars,
/// n_channels for per-channel features, or n·(n−1)/2 for pairwise features.
pub type FeatureBundle = BTreeMap<String, Vec<f32>>;

/// Per-window signal quality assessment.
#[derive(Clone, Debug, Serialize)]
pub struct QualityMetrics {
    pub composite_score: f32,
    pub snr_db: f32,
    pub channel_scores: Vec<f32>,
    pub channel_snr_db: Vec<f32>,
    pub rms_noise_uv: f32,
    pub line_noise_uv: f32,
    pub artifact_percentage: f32,
    pub baseline_drift_uv_per_s: f32,
    pub flatline_channels: Vec<usize>,
    pub clipping_channels: Vec<usize>,
    pub high_impedance_channels: Vec<usize>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl QualityMetrics {
    pub fn bad_channels(&self) -> Vec<usize> {
        let mut bad: Vec<usize> = self
            .flatline_channels
            .iter()
            .chain(&self.clipping_channels)
            .chain(&self.high_impedance_channels)
            .copied()
            .collect();
        bad.sort_unstable();
        bad.dedup();
        bad
    }

    pub fn rating(&self) -> &'static str {
        quality_rating(self.composite_score)
    }
}

pub fn quality_rating(score: f32) -> &'static str {
    if score >= 0.8 {
        "excellent"
    } else if score >= 0.6 {
        "good"
    } else if score >= 0.4 {
        "acceptable"
    } else if score >= 0.2 {
        "poor"
    } else {
        "unusable"
    }
}

/// Fully processed window emitted to session subscribers.
#[derive(Clone, Debug)]
pub struct ProcessedWindow {
    pub session_id: String,
    pub data: Array2<f32>,
    pub features: FeatureBundle,
    pub quality: QualityMetrics,
    pub window_start_index: u64,
    pub window_timestamp: f64,
    pub emitted_at: f64,
    pub latency_ms: f64,
    pub processing_time_ms: f64,
    pub stages: Vec<StageRecord>,
    pub interpolated_channels: Vec<usize>,
    pub samples_processed: u64,
    pub samples_dropped: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    OpenBciCyton,
    OpenBciGanglion,
    Lsl,
    Synthetic,
    BrainFlowCyton,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::OpenBciCyton => "openbci_cyton",
            DeviceKind::OpenBciGanglion => "openbci_ganglion",
            DeviceKind::Lsl => "lsl",
            DeviceKind::Synthetic => "synthetic",
            DeviceKind::BrainFlowCyton => "brainflow_cyton",
        }
    }
}

/// Wire/connection parameters a device variant may need.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_type: DeviceKind,
    pub sampling_rate: f32,
    pub channel_count: usize,
    pub connection: ConnectionParams,
    pub state: DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// One named check inside a device self-test.
#[derive(Clone, Debug, Serialize)]
pub struct SelfTestCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SelfTestReport {
    pub passed: bool,
    pub checks: Vec<SelfTestCheck>,
}

impl SelfTestReport {
    pub fn new() -> Self {
        Self {
            passed: true,
            checks: Vec::new(),
        }
    }

    pub fn record(&mut self, name: &'static str, passed: bool, message: impl Into<String>) {
        self.passed &= passed;
        self.checks.push(SelfTestCheck {
            name,
            passed,
            message: message.into(),
        });
    }
}

impl Default for SelfTestReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Threshold-crossing alert produced by the quality monitor.
#[derive(Clone, Debug, Serialize)]
pub struct QualityAlert {
    pub session_id: String,
    pub timestamp: f64,
    pub severity: AlertSeverity,
    pub metric_name: String,
    pub measured_value: f32,
    pub threshold: f32,
    pub message: String,
    pub resolved: bool,
    pub resolved_at: Option<f64>,
    pub accumulated_duration_s: f64,
}

/// Typed events surfaced on session event channels.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    DeviceError {
        device_id: String,
        message: String,
    },
    QualityAlert(QualityAlert),
    StageFailed {
        session_id: String,
        stage: &'static str,
    },
    BufferOverflow {
        session_id: String,
        dropped_samples: usize,
    },
}

/// Rolling counters reported by `get_stream_status`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StreamMetrics {
    pub samples_received: u64,
    pub samples_processed: u64,
    pub chunks_processed: u64,
    pub chunks_dropped: u64,
    pub windows_emitted: u64,
    pub avg_processing_time_ms: f64,
    pub max_processing_time_ms: f64,
    pub buffer_fill_fraction: f32,
    pub buffer_overflows: u64,
    pub last_quality_score: f32,
    pub quality_alerts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_bands() {
        assert_eq!(quality_rating(0.85), "excellent");
        assert_eq!(quality_rating(0.6), "good");
        assert_eq!(quality_rating(0.45), "acceptable");
        assert_eq!(quality_rating(0.25), "poor");
        assert_eq!(quality_rating(0.1), "unusable");
    }

    #[test]
    fn bad_channels_are_deduplicated() {
        let q = QualityMetrics {
            composite_score: 1.0,
            snr_db: 10.0,
            channel_scores: vec![],
            channel_snr_db: vec![],
            rms_noise_uv: 0.0,
            line_noise_uv: 0.0,
            artifact_percentage: 0.0,
            baseline_drift_uv_per_s: 0.0,
            flatline_channels: vec![2, 5],
            clipping_channels: vec![5],
            high_impedance_channels: vec![1],
            issues: vec![],
            recommendations: vec![],
        };
        assert_eq!(q.bad_channels(), vec![1, 2, 5]);
    }
}
