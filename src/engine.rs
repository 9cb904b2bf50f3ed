//! The engine: explicit top-level value exposing the control surface over
//! the device manager and the per-session stream processors. No process-wide
//! mutable state lives outside this struct.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use ndarray::ArrayView2;
use serde_json::Value;

use crate::config::{ProcessorConfig, QualityThresholds, StreamConfig};
use crate::devices::{DeviceManager, DiscoveryMethod};
use crate::error::{EngineError, Result};
use crate::monitor::QualityReport;
use crate::quality::QualityAssessor;
use crate::stream::StreamSession;
use crate::types::{
    ConnectionParams, DeviceDescriptor, DeviceKind, DeviceState, EngineEvent, ProcessedWindow,
    QualityMetrics, SelfTestReport, StreamMetrics,
};

struct SessionEntry {
    session: StreamSession,
    processor_config: ProcessorConfig,
}

pub struct Engine {
    manager: DeviceManager,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    processor_config: Mutex<ProcessorConfig>,
    stream_config: Mutex<StreamConfig>,
    thresholds: Mutex<QualityThresholds>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            manager: DeviceManager::new(),
            sessions: Mutex::new(HashMap::new()),
            processor_config: Mutex::new(ProcessorConfig::default()),
            stream_config: Mutex::new(StreamConfig::default()),
            thresholds: Mutex::new(QualityThresholds::default()),
        }
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    // --- device surface ---

    pub fn register_device(&self, descriptor: DeviceDescriptor) -> Result<()> {
        self.manager.register(descriptor)
    }

    pub fn list_devices(
        &self,
        status: Option<DeviceState>,
        kind: Option<DeviceKind>,
    ) -> Vec<DeviceDescriptor> {
        self.manager.list(status, kind)
    }

    pub fn discover_devices(
        &self,
        methods: &[&str],
        timeout_seconds: f64,
    ) -> Result<Vec<DeviceDescriptor>> {
        let methods: Vec<DiscoveryMethod> = methods
            .iter()
            .map(|m| DiscoveryMethod::parse(m))
            .collect::<Result<_>>()?;
        self.manager.discover_and_register(&methods, timeout_seconds)
    }

    pub fn connect_device(
        &self,
        device_id: &str,
        params: Option<ConnectionParams>,
    ) -> Result<()> {
        if let Some(params) = params {
            self.manager.update_connection(device_id, params)?;
        }
        self.manager.connect(device_id)
    }

    pub fn disconnect_device(&self, device_id: &str) -> Result<()> {
        self.manager.disconnect(device_id)
    }

    pub fn configure_device(
        &self,
        device_id: &str,
        config: &serde_json::Map<String, Value>,
    ) -> Result<DeviceDescriptor> {
        self.manager.configure(device_id, config)
    }

    /// Starts the device stream into its attached session's buffer.
    pub fn start_streaming(&self, device_id: &str) -> Result<()> {
        let session_id = self.manager.session_for(device_id).ok_or_else(|| {
            EngineError::NotConnected(format!("device {device_id} has no attached session"))
        })?;
        let sink = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let entry = sessions
                .get(&session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.clone()))?;
            entry.session.frame_sink()
        };
        self.manager.start_streaming(device_id, sink)
    }

    pub fn stop_streaming(&self, device_id: &str) -> Result<()> {
        self.manager.stop_streaming(device_id)
    }

    pub fn read_impedance(&self, device_id: &str) -> Result<BTreeMap<String, f32>> {
        self.manager.read_impedance(device_id)
    }

    pub fn self_test(&self, device_id: &str) -> Result<SelfTestReport> {
        self.manager.self_test(device_id)
    }

    // --- session surface ---

    /// Creates a streaming session and returns its subscription handle. The
    /// out-of-scope transport façade maps the handle to a live URL.
    pub fn start_stream_session(
        &self,
        session_id: &str,
        n_channels: usize,
        sampling_rate: f32,
        window_seconds: Option<f32>,
        overlap: Option<f32>,
        buffer_seconds: Option<f32>,
    ) -> Result<String> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(session_id) {
            return Err(EngineError::BadParameter(format!(
                "session {session_id} already exists"
            )));
        }
        let processor_config = {
            let template = self.processor_config.lock().unwrap_or_else(|e| e.into_inner());
            ProcessorConfig {
                num_channels: n_channels,
                sampling_rate,
                ..template.clone()
            }
        };
        let stream_config = {
            let template = self.stream_config.lock().unwrap_or_else(|e| e.into_inner());
            StreamConfig {
                window_size_seconds: window_seconds
                    .unwrap_or(template.window_size_seconds),
                window_overlap: overlap.unwrap_or(template.window_overlap),
                buffer_size_seconds: buffer_seconds
                    .unwrap_or(template.buffer_size_seconds),
                ..template.clone()
            }
        };
        let thresholds = self.thresholds.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut session = StreamSession::new(
            session_id,
            processor_config.clone(),
            stream_config,
            thresholds,
        )?;
        session.start();
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session,
                processor_config,
            },
        );
        log::info!("session {session_id} started");
        Ok(format!("sessions/{session_id}/stream"))
    }

    /// Binds a device's frames to a session.
    pub fn attach_device(&self, session_id: &str, device_id: &str) -> Result<()> {
        {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if !sessions.contains_key(session_id) {
                return Err(EngineError::UnknownSession(session_id.to_string()));
            }
        }
        self.manager.bind_session(device_id, session_id)?;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.session.device_id = Some(device_id.to_string());
        }
        Ok(())
    }

    /// Runs one standalone batch through a session's pipeline without
    /// touching its ring buffer.
    pub fn process_batch(
        &self,
        session_id: &str,
        data: ArrayView2<'_, f32>,
    ) -> Result<ProcessedWindow> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        if data.nrows() != entry.processor_config.num_channels {
            return Err(EngineError::BadShape {
                expected: entry.processor_config.num_channels,
                actual: data.nrows(),
            });
        }
        entry.session.process_batch(data)
    }

    /// Appends a chunk to a session's buffer (push-based ingestion for
    /// callers without a device).
    pub fn append_chunk(&self, session_id: &str, data: ArrayView2<'_, f32>) -> Result<()> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        if data.nrows() != entry.processor_config.num_channels {
            return Err(EngineError::BadShape {
                expected: entry.processor_config.num_channels,
                actual: data.nrows(),
            });
        }
        entry.session.append_chunk(data)
    }

    pub fn subscribe(&self, session_id: &str) -> Result<Receiver<ProcessedWindow>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .map(|e| e.session.output())
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    pub fn subscribe_events(&self, session_id: &str) -> Result<Receiver<EngineEvent>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .map(|e| e.session.events())
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    pub fn stop_stream_session(
        &self,
        session_id: &str,
    ) -> Result<(StreamMetrics, QualityReport)> {
        let entry = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .remove(session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?
        };
        if let Some(device_id) = &entry.session.device_id {
            if self.manager.stop_streaming(device_id).is_ok() {
                log::info!("device {device_id} stopped with session {session_id}");
            }
            let _ = self.manager.unbind_session(device_id);
        }
        Ok(entry.session.stop())
    }

    pub fn get_stream_status(&self, session_id: &str) -> Result<StreamMetrics> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .map(|e| e.session.metrics())
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    // --- stateless helpers ---

    /// One-shot quality check over an arbitrary matrix.
    pub fn check_quality(
        &self,
        data: ArrayView2<'_, f32>,
        sampling_rate: f32,
    ) -> Result<QualityMetrics> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(EngineError::BadShape {
                expected: 1,
                actual: 0,
            });
        }
        let config = ProcessorConfig {
            num_channels: data.nrows(),
            sampling_rate,
            ..self
                .processor_config
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        config.validate()?;
        let assessor = QualityAssessor::new(&config)?;
        Ok(assessor.assess(&data.to_owned()))
    }

    // --- configuration surface ---

    /// Applies a JSON patch to one config component and returns the keys it
    /// recognized. Processor patches propagate to live sessions except for
    /// the structural keys that would invalidate their buffers.
    pub fn update_config(
        &self,
        component: &str,
        patch: &serde_json::Map<String, Value>,
    ) -> Result<Vec<String>> {
        match component {
            "processor" => {
                let applied = {
                    let mut config =
                        self.processor_config.lock().unwrap_or_else(|e| e.into_inner());
                    config.apply_patch(patch)?
                };
                let mut session_patch = patch.clone();
                session_patch.remove("sampling_rate");
                session_patch.remove("num_channels");
                let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
                for entry in sessions.values_mut() {
                    entry.processor_config.apply_patch(&session_patch)?;
                    entry
                        .session
                        .update_processor_config(entry.processor_config.clone())?;
                }
                Ok(applied)
            }
            "stream" => {
                let mut config = self.stream_config.lock().unwrap_or_else(|e| e.into_inner());
                config.apply_patch(patch)
            }
            "quality" => {
                let applied = {
                    let mut thresholds =
                        self.thresholds.lock().unwrap_or_else(|e| e.into_inner());
                    thresholds.apply_patch(patch)?
                };
                let thresholds =
                    self.thresholds.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
                for entry in sessions.values() {
                    entry.session.set_thresholds(thresholds.clone());
                }
                Ok(applied)
            }
            other => Err(EngineError::UnknownComponent(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use serde_json::json;
    use std::time::Duration;

    fn synthetic_descriptor(id: &str, channels: usize) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: id.into(),
            device_type: DeviceKind::Synthetic,
            sampling_rate: 250.0,
            channel_count: channels,
            connection: ConnectionParams::default(),
            state: DeviceState::Disconnected,
            firmware_version: None,
        }
    }

    fn alpha_block(channels: usize, n: usize) -> Array2<f32> {
        Array2::from_shape_fn((channels, n), |(_, i)| {
            (30.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 250.0).sin()) as f32
        })
    }

    #[test]
    fn end_to_end_synthetic_session() {
        let engine = Engine::new();
        engine
            .register_device(synthetic_descriptor("dev-1", 4))
            .unwrap();
        engine.connect_device("dev-1", None).unwrap();
        let handle = engine
            .start_stream_session("sess-1", 4, 250.0, Some(1.0), Some(0.5), Some(5.0))
            .unwrap();
        assert_eq!(handle, "sessions/sess-1/stream");
        engine.attach_device("sess-1", "dev-1").unwrap();
        let output = engine.subscribe("sess-1").unwrap();
        engine.start_streaming("dev-1").unwrap();

        let window = output
            .recv_timeout(Duration::from_secs(10))
            .expect("a processed window arrives");
        assert_eq!(window.session_id, "sess-1");
        assert_eq!(window.data.nrows(), 4);
        assert!(!window.features.is_empty());

        let status = engine.get_stream_status("sess-1").unwrap();
        assert!(status.samples_received > 0);

        let (metrics, report) = engine.stop_stream_session("sess-1").unwrap();
        assert!(metrics.windows_emitted >= 1);
        assert!(report.windows_assessed >= 1);
        // The device stopped along with the session.
        assert_eq!(
            engine.manager().state("dev-1").unwrap(),
            DeviceState::Connected
        );
    }

    #[test]
    fn start_streaming_without_session_is_rejected() {
        let engine = Engine::new();
        engine
            .register_device(synthetic_descriptor("dev-1", 4))
            .unwrap();
        engine.connect_device("dev-1", None).unwrap();
        assert!(matches!(
            engine.start_streaming("dev-1"),
            Err(EngineError::NotConnected(_))
        ));
    }

    #[test]
    fn session_rejects_bad_parameters() {
        let engine = Engine::new();
        assert!(matches!(
            engine.start_stream_session("s", 0, 250.0, None, None, None),
            Err(EngineError::BadParameter(_))
        ));
        // Overlap 1.0 is outside [0, 1).
        assert!(matches!(
            engine.start_stream_session("s", 4, 250.0, None, Some(1.0), None),
            Err(EngineError::BadParameter(_))
        ));
    }

    #[test]
    fn process_batch_checks_shape() {
        let engine = Engine::new();
        engine
            .start_stream_session("sess-1", 4, 250.0, None, None, None)
            .unwrap();
        let wrong = alpha_block(2, 500);
        assert!(matches!(
            engine.process_batch("sess-1", wrong.view()),
            Err(EngineError::BadShape { .. })
        ));
        let right = alpha_block(4, 500);
        let result = engine.process_batch("sess-1", right.view()).unwrap();
        assert_eq!(result.data.dim(), (4, 500));
        assert!(result.features.contains_key("rms"));
        engine.stop_stream_session("sess-1").unwrap();
    }

    #[test]
    fn unknown_session_errors() {
        let engine = Engine::new();
        assert!(matches!(
            engine.get_stream_status("ghost"),
            Err(EngineError::UnknownSession(_))
        ));
        assert!(matches!(
            engine.stop_stream_session("ghost"),
            Err(EngineError::UnknownSession(_))
        ));
    }

    #[test]
    fn check_quality_is_stateless() {
        let engine = Engine::new();
        let q = engine
            .check_quality(alpha_block(8, 500).view(), 250.0)
            .unwrap();
        assert!(q.composite_score > 0.0);
        let empty = Array2::<f32>::zeros((0, 0));
        assert!(matches!(
            engine.check_quality(empty.view(), 250.0),
            Err(EngineError::BadShape { .. })
        ));
    }

    #[test]
    fn update_config_components() {
        let engine = Engine::new();
        let applied = engine
            .update_config(
                "processor",
                json!({"bandpass_high": 45.0}).as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(applied, vec!["bandpass_high"]);
        let applied = engine
            .update_config(
                "stream",
                json!({"window_size_seconds": 1.0}).as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(applied, vec!["window_size_seconds"]);
        let applied = engine
            .update_config(
                "quality",
                json!({"max_noise_level": 80.0}).as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(applied, vec!["max_noise_level"]);
        assert!(matches!(
            engine.update_config("nonsense", json!({}).as_object().unwrap()),
            Err(EngineError::UnknownComponent(_))
        ));
    }

    #[test]
    fn processor_update_propagates_to_live_sessions() {
        let engine = Engine::new();
        engine
            .start_stream_session("sess-1", 4, 250.0, None, None, None)
            .unwrap();
        engine
            .update_config(
                "processor",
                json!({"bandpass_high": 45.0, "sampling_rate": 500.0})
                    .as_object()
                    .unwrap(),
            )
            .unwrap();
        // The live session keeps its own 250 Hz but picks up the band edit.
        let result = engine
            .process_batch("sess-1", alpha_block(4, 500).view())
            .unwrap();
        assert!(result.quality.composite_score > 0.0);
        engine.stop_stream_session("sess-1").unwrap();
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let engine = Engine::new();
        engine
            .start_stream_session("sess-1", 4, 250.0, None, None, None)
            .unwrap();
        assert!(engine
            .start_stream_session("sess-1", 4, 250.0, None, None, None)
            .is_err());
        engine.stop_stream_session("sess-1").unwrap();
    }
}
