//! Per-session quality monitoring: rolling history, metric trends and
//! threshold-driven alerting with cooldown and resolution.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::config::QualityThresholds;
use crate::dsp::stats::{linear_fit, mean, std_dev, variance};
use crate::types::{AlertSeverity, QualityAlert, QualityMetrics};

const HISTORY_WINDOWS: usize = 60;
const TREND_VALUES: usize = 100;
const ALERT_COOLDOWN_S: f64 = 300.0;
const STABILITY_WINDOWS: usize = 10;
const STABILITY_VARIANCE: f32 = 0.04;

/// Bounded series of one tracked metric.
#[derive(Debug, Default)]
pub struct TrendSeries {
    values: VecDeque<f32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrendStats {
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
    /// Regression slope squashed into (−1, 1): negative = deteriorating for
    /// score-like metrics, positive = rising.
    pub direction: f32,
}

impl TrendSeries {
    fn push(&mut self, value: f32) {
        if self.values.len() == TREND_VALUES {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn stats(&self) -> Option<TrendStats> {
        if self.values.is_empty() {
            return None;
        }
        let values: Vec<f32> = self.values.iter().copied().collect();
        let std = std_dev(&values);
        let (slope, _) = linear_fit(&values);
        let direction = (slope * values.len() as f32 / (std + 1e-6)).tanh();
        Some(TrendStats {
            mean: mean(&values),
            std,
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            direction,
        })
    }
}

/// End-of-session summary handed back from `stop_stream_session`.
#[derive(Clone, Debug, Serialize)]
pub struct QualityReport {
    pub session_id: String,
    pub windows_assessed: u64,
    pub mean_overall_score: f32,
    pub min_overall_score: f32,
    pub max_overall_score: f32,
    pub warning_alerts: usize,
    pub critical_alerts: usize,
    pub stable: bool,
    pub monitored_seconds: f64,
    pub trends: BTreeMap<String, TrendStats>,
}

pub struct QualityMonitor {
    session_id: String,
    thresholds: QualityThresholds,
    history: VecDeque<f32>,
    trends: BTreeMap<&'static str, TrendSeries>,
    alerts: Vec<QualityAlert>,
    windows_assessed: u64,
    started_at: Option<f64>,
}

impl QualityMonitor {
    pub fn new(session_id: &str, thresholds: QualityThresholds) -> Self {
        let mut trends = BTreeMap::new();
        for name in ["overall", "snr", "noise", "artifact_rate"] {
            trends.insert(name, TrendSeries::default());
        }
        Self {
            session_id: session_id.to_string(),
            thresholds,
            history: VecDeque::new(),
            trends,
            alerts: Vec::new(),
            windows_assessed: 0,
            started_at: None,
        }
    }

    pub fn set_thresholds(&mut self, thresholds: QualityThresholds) {
        self.thresholds = thresholds;
    }

    /// Ingests one window's metrics; returns the alerts newly raised by it.
    pub fn update(&mut self, metrics: &QualityMetrics, now: f64) -> Vec<QualityAlert> {
        self.started_at.get_or_insert(now);
        self.windows_assessed += 1;
        if self.history.len() == HISTORY_WINDOWS {
            self.history.pop_front();
        }
        self.history.push_back(metrics.composite_score);

        if let Some(t) = self.trends.get_mut("overall") {
            t.push(metrics.composite_score);
        }
        if let Some(t) = self.trends.get_mut("snr") {
            t.push(metrics.snr_db);
        }
        if let Some(t) = self.trends.get_mut("noise") {
            t.push(metrics.rms_noise_uv);
        }
        if let Some(t) = self.trends.get_mut("artifact_rate") {
            t.push(metrics.artifact_percentage);
        }

        let bad_channels = metrics.bad_channels().len();
        let t = &self.thresholds;
        let checks: [(&str, f32, Option<(AlertSeverity, f32)>); 5] = [
            (
                "overall_quality",
                metrics.composite_score,
                severity_below(
                    metrics.composite_score,
                    t.min_overall_score,
                    t.critical_overall_score,
                ),
            ),
            (
                "snr",
                metrics.snr_db,
                severity_below(metrics.snr_db, t.min_snr_db, t.critical_snr_db),
            ),
            (
                "noise_level",
                metrics.rms_noise_uv,
                severity_above(
                    metrics.rms_noise_uv,
                    t.max_noise_level_uv,
                    t.critical_noise_level_uv,
                ),
            ),
            (
                "artifact_percentage",
                metrics.artifact_percentage,
                severity_above(
                    metrics.artifact_percentage,
                    t.max_artifact_percentage,
                    t.critical_artifact_percentage,
                ),
            ),
            (
                "bad_channels",
                bad_channels as f32,
                severity_above(
                    bad_channels as f32,
                    t.max_bad_channels as f32,
                    t.critical_bad_channels as f32,
                ),
            ),
        ];

        let mut raised = Vec::new();
        for (metric, value, crossing) in checks {
            match crossing {
                Some((severity, threshold)) => {
                    if let Some(alert) = self.handle_crossing(metric, value, severity, threshold, now)
                    {
                        raised.push(alert);
                    }
                }
                None => self.resolve_metric(metric, now),
            }
        }
        raised
    }

    fn handle_crossing(
        &mut self,
        metric: &str,
        value: f32,
        severity: AlertSeverity,
        threshold: f32,
        now: f64,
    ) -> Option<QualityAlert> {
        // A different-severity unresolved alert for the metric resolves
        // first (escalation or de-escalation).
        for alert in self.alerts.iter_mut() {
            if alert.metric_name == metric && !alert.resolved && alert.severity != severity {
                alert.resolved = true;
                alert.resolved_at = Some(now);
            }
        }
        // Extend an existing unresolved alert of identical kind.
        if let Some(alert) = self
            .alerts
            .iter_mut()
            .find(|a| a.metric_name == metric && a.severity == severity && !a.resolved)
        {
            alert.accumulated_duration_s = now - alert.timestamp;
            alert.measured_value = value;
            return None;
        }
        // Duplicate-alert cooldown after the last identical alert.
        let last_identical = self
            .alerts
            .iter()
            .filter(|a| a.metric_name == metric && a.severity == severity)
            .map(|a| a.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);
        if now - last_identical < ALERT_COOLDOWN_S {
            return None;
        }
        let alert = QualityAlert {
            session_id: self.session_id.clone(),
            timestamp: now,
            severity,
            metric_name: metric.to_string(),
            measured_value: value,
            threshold,
            message: format!(
                "{metric} {value:.2} crossed the {} threshold {threshold:.2}",
                match severity {
                    AlertSeverity::Warning => "warning",
                    AlertSeverity::Critical => "critical",
                }
            ),
            resolved: false,
            resolved_at: None,
            accumulated_duration_s: 0.0,
        };
        log::warn!("session {}: {}", self.session_id, alert.message);
        self.alerts.push(alert.clone());
        Some(alert)
    }

    fn resolve_metric(&mut self, metric: &str, now: f64) {
        for alert in self.alerts.iter_mut() {
            if alert.metric_name == metric && !alert.resolved {
                alert.resolved = true;
                alert.resolved_at = Some(now);
                alert.accumulated_duration_s = now - alert.timestamp;
                log::info!(
                    "session {}: {} alert resolved after {:.1}s",
                    self.session_id,
                    metric,
                    alert.accumulated_duration_s
                );
            }
        }
    }

    pub fn active_alerts(&self) -> Vec<&QualityAlert> {
        self.alerts.iter().filter(|a| !a.resolved).collect()
    }

    pub fn all_alerts(&self) -> &[QualityAlert] {
        &self.alerts
    }

    pub fn trend_stats(&self) -> BTreeMap<String, TrendStats> {
        self.trends
            .iter()
            .filter_map(|(name, series)| series.stats().map(|s| (name.to_string(), s)))
            .collect()
    }

    /// A session is stable once its recent overall scores barely move.
    pub fn is_stable(&self) -> bool {
        if self.history.len() < STABILITY_WINDOWS {
            return false;
        }
        let recent: Vec<f32> = self
            .history
            .iter()
            .rev()
            .take(STABILITY_WINDOWS)
            .copied()
            .collect();
        variance(&recent) < STABILITY_VARIANCE
    }

    pub fn report(&self, now: f64) -> QualityReport {
        let scores: Vec<f32> = self.history.iter().copied().collect();
        QualityReport {
            session_id: self.session_id.clone(),
            windows_assessed: self.windows_assessed,
            mean_overall_score: mean(&scores),
            min_overall_score: scores.iter().copied().fold(f32::INFINITY, f32::min),
            max_overall_score: scores.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            warning_alerts: self
                .alerts
                .iter()
                .filter(|a| a.severity == AlertSeverity::Warning)
                .count(),
            critical_alerts: self
                .alerts
                .iter()
                .filter(|a| a.severity == AlertSeverity::Critical)
                .count(),
            stable: self.is_stable(),
            monitored_seconds: self.started_at.map(|t| now - t).unwrap_or(0.0),
            trends: self.trend_stats(),
        }
    }
}

fn severity_below(value: f32, warning: f32, critical: f32) -> Option<(AlertSeverity, f32)> {
    if value < critical {
        Some((AlertSeverity::Critical, critical))
    } else if value < warning {
        Some((AlertSeverity::Warning, warning))
    } else {
        None
    }
}

fn severity_above(value: f32, warning: f32, critical: f32) -> Option<(AlertSeverity, f32)> {
    if value > critical {
        Some((AlertSeverity::Critical, critical))
    } else if value > warning {
        Some((AlertSeverity::Warning, warning))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(score: f32, snr: f32, noise: f32, artifact: f32) -> QualityMetrics {
        QualityMetrics {
            composite_score: score,
            snr_db: snr,
            channel_scores: vec![score; 8],
            channel_snr_db: vec![snr; 8],
            rms_noise_uv: noise,
            line_noise_uv: 0.0,
            artifact_percentage: artifact,
            baseline_drift_uv_per_s: 0.0,
            flatline_channels: vec![],
            clipping_channels: vec![],
            high_impedance_channels: vec![],
            issues: vec![],
            recommendations: vec![],
        }
    }

    fn monitor() -> QualityMonitor {
        QualityMonitor::new("session-1", QualityThresholds::default())
    }

    #[test]
    fn clean_metrics_raise_nothing() {
        let mut m = monitor();
        let raised = m.update(&metrics(0.9, 15.0, 10.0, 1.0), 0.0);
        assert!(raised.is_empty());
        assert!(m.active_alerts().is_empty());
    }

    #[test]
    fn critical_noise_raises_once_and_extends() {
        let mut m = monitor();
        // 120 µV noise is past the 100 µV critical threshold.
        let raised = m.update(&metrics(0.9, 15.0, 120.0, 1.0), 0.0);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].metric_name, "noise_level");
        assert_eq!(raised[0].severity, AlertSeverity::Critical);

        // The next window inside the cooldown extends rather than
        // duplicates.
        let raised = m.update(&metrics(0.9, 15.0, 120.0, 1.0), 2.0);
        assert!(raised.is_empty());
        assert_eq!(m.active_alerts().len(), 1);
        assert!(m.active_alerts()[0].accumulated_duration_s >= 2.0);
    }

    #[test]
    fn alert_resolves_when_metric_recovers() {
        let mut m = monitor();
        m.update(&metrics(0.9, 15.0, 120.0, 1.0), 0.0);
        m.update(&metrics(0.9, 15.0, 20.0, 1.0), 4.0);
        assert!(m.active_alerts().is_empty());
        let resolved = &m.all_alerts()[0];
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_at, Some(4.0));
    }

    #[test]
    fn cooldown_suppresses_rapid_duplicates() {
        let mut m = monitor();
        m.update(&metrics(0.9, 15.0, 120.0, 1.0), 0.0);
        m.update(&metrics(0.9, 15.0, 20.0, 1.0), 10.0); // resolves
        // Re-crossing within five minutes: suppressed.
        let raised = m.update(&metrics(0.9, 15.0, 120.0, 1.0), 60.0);
        assert!(raised.is_empty());
        // After the cooldown a fresh alert fires.
        let raised = m.update(&metrics(0.9, 15.0, 120.0, 1.0), 400.0);
        assert_eq!(raised.len(), 1);
    }

    #[test]
    fn warning_escalates_to_critical() {
        let mut m = monitor();
        let raised = m.update(&metrics(0.9, 15.0, 60.0, 1.0), 0.0);
        assert_eq!(raised[0].severity, AlertSeverity::Warning);
        let raised = m.update(&metrics(0.9, 15.0, 150.0, 1.0), 5.0);
        assert_eq!(raised[0].severity, AlertSeverity::Critical);
        // The warning closed when the critical superseded it.
        let unresolved = m.active_alerts();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn low_score_and_snr_alerts_use_below_thresholds() {
        let mut m = monitor();
        let raised = m.update(&metrics(0.3, 2.0, 10.0, 1.0), 0.0);
        let names: Vec<&str> = raised.iter().map(|a| a.metric_name.as_str()).collect();
        assert!(names.contains(&"overall_quality"));
        assert!(names.contains(&"snr"));
        assert!(raised.iter().all(|a| a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn stability_flag_needs_quiet_history() {
        let mut m = monitor();
        for i in 0..10 {
            m.update(&metrics(0.85, 15.0, 10.0, 1.0), i as f64);
        }
        assert!(m.is_stable());
        let mut m = monitor();
        for i in 0..10 {
            let score = if i % 2 == 0 { 0.9 } else { 0.2 };
            m.update(&metrics(score, 15.0, 10.0, 1.0), i as f64);
        }
        assert!(!m.is_stable());
    }

    #[test]
    fn trends_track_direction() {
        let mut m = monitor();
        for i in 0..50 {
            let score = 0.9 - i as f32 * 0.01;
            m.update(&metrics(score, 15.0, 10.0, 1.0), i as f64);
        }
        let trends = m.trend_stats();
        assert!(trends["overall"].direction < -0.5);
    }

    #[test]
    fn report_summarizes_session() {
        let mut m = monitor();
        for i in 0..20 {
            m.update(&metrics(0.8, 15.0, 10.0, 1.0), i as f64);
        }
        m.update(&metrics(0.8, 15.0, 120.0, 1.0), 20.0);
        let report = m.report(25.0);
        assert_eq!(report.windows_assessed, 21);
        assert_eq!(report.critical_alerts, 1);
        assert!((report.monitored_seconds - 25.0).abs() < 1e-9);
        assert!(report.trends.contains_key("noise"));
    }
}
