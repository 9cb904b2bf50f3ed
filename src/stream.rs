//! Per-session real-time driver: owns the ring buffer, pulls sliding
//! windows, runs preprocessing → quality → features, and emits processed
//! windows in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ndarray::ArrayView2;

use crate::buffer::StreamBuffer;
use crate::config::{ProcessorConfig, QualityThresholds, StreamConfig};
use crate::devices::monotonic_now;
use crate::error::{EngineError, Result};
use crate::features::FeatureExtractor;
use crate::monitor::{QualityMonitor, QualityReport};
use crate::preprocess::PreprocessPipeline;
use crate::quality::QualityAssessor;
use crate::types::{
    EngineEvent, ProcessedWindow, SampleFrame, StreamMetrics, Window,
};

const FRAME_CHANNEL_CAPACITY: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const TIMING_HISTORY: usize = 100;

#[derive(Default)]
struct MetricsInner {
    samples_received: u64,
    samples_processed: u64,
    chunks_processed: u64,
    chunks_dropped: u64,
    windows_emitted: u64,
    buffer_overflows: u64,
    quality_alerts: u64,
    last_quality_score: f32,
    processing_times_ms: Vec<f64>,
}

struct SessionShared {
    session_id: String,
    stream_config: StreamConfig,
    sampling_rate: f32,
    buffer: Mutex<StreamBuffer>,
    pipeline: RwLock<PreprocessPipeline>,
    extractor: RwLock<FeatureExtractor>,
    assessor: RwLock<QualityAssessor>,
    monitor: Mutex<QualityMonitor>,
    metrics: Mutex<MetricsInner>,
    stopping: AtomicBool,
    output_tx: Sender<ProcessedWindow>,
    event_tx: Sender<EngineEvent>,
}

/// One streaming session: buffer, pipeline and driver thread.
pub struct StreamSession {
    shared: Arc<SessionShared>,
    frame_tx: Sender<SampleFrame>,
    frame_rx: Receiver<SampleFrame>,
    output_rx: Receiver<ProcessedWindow>,
    event_rx: Receiver<EngineEvent>,
    driver: Option<JoinHandle<()>>,
    pub device_id: Option<String>,
}

impl StreamSession {
    pub fn new(
        session_id: &str,
        processor_config: ProcessorConfig,
        stream_config: StreamConfig,
        thresholds: QualityThresholds,
    ) -> Result<Self> {
        processor_config.validate()?;
        stream_config.validate()?;
        let window = stream_config.window_samples(processor_config.sampling_rate);
        if window == 0 {
            return Err(EngineError::BadParameter(
                "window must span at least one sample".into(),
            ));
        }
        let buffer = StreamBuffer::with_duration(
            processor_config.num_channels,
            processor_config.sampling_rate,
            stream_config.buffer_size_seconds,
        )?;
        let pipeline = PreprocessPipeline::new(processor_config.clone())?;
        let extractor = FeatureExtractor::new(processor_config.clone())?;
        let assessor = QualityAssessor::new(&processor_config)?;
        let monitor = QualityMonitor::new(session_id, thresholds);

        let (frame_tx, frame_rx) = bounded(FRAME_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = bounded(OUTPUT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(SessionShared {
            session_id: session_id.to_string(),
            stream_config,
            sampling_rate: processor_config.sampling_rate,
            buffer: Mutex::new(buffer),
            pipeline: RwLock::new(pipeline),
            extractor: RwLock::new(extractor),
            assessor: RwLock::new(assessor),
            monitor: Mutex::new(monitor),
            metrics: Mutex::new(MetricsInner::default()),
            stopping: AtomicBool::new(false),
            output_tx,
            event_tx,
        });
        Ok(Self {
            shared,
            frame_tx,
            frame_rx,
            output_rx,
            event_rx,
            driver: None,
            device_id: None,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Sink handed to the device adapter that feeds this session.
    pub fn frame_sink(&self) -> Sender<SampleFrame> {
        self.frame_tx.clone()
    }

    pub fn output(&self) -> Receiver<ProcessedWindow> {
        self.output_rx.clone()
    }

    pub fn events(&self) -> Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    /// Spawns the cooperative driver: frames are drained into the buffer and
    /// new windows are processed at every tick.
    pub fn start(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let frame_rx = self.frame_rx.clone();
        let tick = Duration::from_millis(shared.stream_config.process_interval_ms.max(1));
        self.driver = Some(std::thread::spawn(move || {
            log::info!("session {} driver started", shared.session_id);
            let mut last_process = Instant::now();
            while !shared.stopping.load(Ordering::SeqCst) {
                match frame_rx.recv_timeout(Duration::from_millis(5)) {
                    Ok(frame) => {
                        Self::ingest_frame(&shared, &frame);
                        // Drain whatever else is queued before processing.
                        while let Ok(frame) = frame_rx.try_recv() {
                            Self::ingest_frame(&shared, &frame);
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
                if last_process.elapsed() >= tick {
                    Self::process_available(&shared);
                    last_process = Instant::now();
                }
            }
            // Drain: one last pass over pending frames and windows, then a
            // final short window if enough samples remain.
            while let Ok(frame) = frame_rx.try_recv() {
                Self::ingest_frame(&shared, &frame);
            }
            Self::process_available(&shared);
            Self::process_tail(&shared);
            log::info!("session {} driver stopped", shared.session_id);
        }));
    }

    fn ingest_frame(shared: &SessionShared, frame: &SampleFrame) {
        let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let overflowing = buffer.remaining_capacity() == 0;
        if overflowing && !shared.stream_config.drop_on_overflow {
            drop(buffer);
            let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.chunks_dropped += 1;
            return;
        }
        match buffer.push_frame(frame) {
            Ok(()) => {
                drop(buffer);
                let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
                metrics.samples_received += 1;
                if overflowing {
                    metrics.buffer_overflows += 1;
                }
            }
            Err(e) => {
                drop(buffer);
                log::warn!("session {}: frame rejected: {e}", shared.session_id);
                let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
                metrics.chunks_dropped += 1;
            }
        }
    }

    /// Appends a channels×n block, applying the configured overflow policy
    /// per chunk.
    pub fn append_chunk(&self, block: ArrayView2<'_, f32>) -> Result<()> {
        Self::append_chunk_shared(&self.shared, block)
    }

    fn append_chunk_shared(shared: &SessionShared, block: ArrayView2<'_, f32>) -> Result<()> {
        let n = block.ncols();
        let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let overflows = n > buffer.remaining_capacity();
        if overflows && !shared.stream_config.drop_on_overflow {
            drop(buffer);
            let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.chunks_dropped += 1;
            let _ = shared.event_tx.try_send(EngineEvent::BufferOverflow {
                session_id: shared.session_id.clone(),
                dropped_samples: n,
            });
            return Err(EngineError::BufferOverflow);
        }
        buffer.append(block)?;
        drop(buffer);
        let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.samples_received += n as u64;
        if overflows {
            metrics.buffer_overflows += 1;
            let _ = shared.event_tx.try_send(EngineEvent::BufferOverflow {
                session_id: shared.session_id.clone(),
                dropped_samples: n,
            });
        }
        Ok(())
    }

    /// One driver iteration: pulls every ready window and processes it.
    /// Public so batch-style callers and tests can step deterministically.
    pub fn process_now(&self) -> usize {
        Self::process_available(&self.shared)
    }

    fn process_available(shared: &SessionShared) -> usize {
        let window = shared
            .stream_config
            .window_samples(shared.sampling_rate);
        let step = shared.stream_config.step_samples(shared.sampling_rate);
        let mut windows = {
            let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.total_written()
                < shared.stream_config.min_samples_to_process as u64
            {
                return 0;
            }
            buffer.take_windows(window, step)
        };

        // Backpressure: more ready windows than the queue bound either
        // drops the oldest (drop_on_overflow) or rejects the newest.
        let bound = shared.stream_config.max_processing_queue.max(1);
        if windows.len() > bound {
            let excess = windows.len() - bound;
            if shared.stream_config.drop_on_overflow {
                windows.drain(..excess);
            } else {
                windows.truncate(bound);
            }
            let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.chunks_dropped += excess as u64;
        }

        let mut processed = 0usize;
        for win in windows {
            if shared.stopping.load(Ordering::SeqCst) {
                break;
            }
            Self::process_window(shared, win);
            processed += 1;
        }
        processed
    }

    /// After stop: one final short window over the unconsumed tail.
    fn process_tail(shared: &SessionShared) {
        let min_samples = shared.stream_config.min_samples_to_process;
        let tail = {
            let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.take_tail(min_samples)
        };
        if let Some(win) = tail {
            Self::process_window(shared, win);
        }
    }

    fn process_window(shared: &SessionShared, win: Window) {
        let started = Instant::now();
        let preprocessed = {
            let pipeline = shared.pipeline.read().unwrap_or_else(|e| e.into_inner());
            pipeline.process(&win.data)
        };
        for stage in preprocessed.stages_failed() {
            let _ = shared.event_tx.try_send(EngineEvent::StageFailed {
                session_id: shared.session_id.clone(),
                stage,
            });
        }

        let quality = {
            let assessor = shared.assessor.read().unwrap_or_else(|e| e.into_inner());
            assessor.assess(&preprocessed.data)
        };
        let features = {
            let extractor = shared.extractor.read().unwrap_or_else(|e| e.into_inner());
            extractor.extract(&preprocessed.data, quality.composite_score)
        };

        let now = monotonic_now();
        let alerts = {
            let mut monitor = shared.monitor.lock().unwrap_or_else(|e| e.into_inner());
            monitor.update(&quality, now)
        };
        for alert in alerts {
            let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.quality_alerts += 1;
            drop(metrics);
            let _ = shared
                .event_tx
                .try_send(EngineEvent::QualityAlert(alert));
        }

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (samples_processed, samples_dropped) = {
            let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.chunks_processed += 1;
            metrics.windows_emitted += 1;
            metrics.samples_processed += win.data.ncols() as u64;
            metrics.last_quality_score = quality.composite_score;
            if metrics.processing_times_ms.len() == TIMING_HISTORY {
                metrics.processing_times_ms.remove(0);
            }
            metrics.processing_times_ms.push(processing_time_ms);
            (metrics.samples_processed, metrics.chunks_dropped)
        };

        let out = ProcessedWindow {
            session_id: shared.session_id.clone(),
            data: preprocessed.data,
            features,
            quality,
            window_start_index: win.start_index,
            window_timestamp: win.timestamp,
            emitted_at: now,
            latency_ms: (now - win.timestamp).max(0.0) * 1000.0,
            processing_time_ms,
            stages: preprocessed.stages,
            interpolated_channels: preprocessed.interpolated_channels,
            samples_processed,
            samples_dropped,
        };
        match shared.output_tx.try_send(out) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let mut metrics = shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
                metrics.chunks_dropped += 1;
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// One-shot processing of a standalone block through this session's
    /// pipeline, bypassing the ring buffer and the window cursor.
    pub fn process_batch(&self, data: ArrayView2<'_, f32>) -> Result<ProcessedWindow> {
        let shared = &self.shared;
        let started = Instant::now();
        let owned = data.to_owned();
        let preprocessed = {
            let pipeline = shared.pipeline.read().unwrap_or_else(|e| e.into_inner());
            pipeline.process(&owned)
        };
        let quality = {
            let assessor = shared.assessor.read().unwrap_or_else(|e| e.into_inner());
            assessor.assess(&preprocessed.data)
        };
        let features = {
            let extractor = shared.extractor.read().unwrap_or_else(|e| e.into_inner());
            extractor.extract(&preprocessed.data, quality.composite_score)
        };
        let now = monotonic_now();
        let n = data.ncols() as u64;
        Ok(ProcessedWindow {
            session_id: shared.session_id.clone(),
            data: preprocessed.data,
            features,
            quality,
            window_start_index: 0,
            window_timestamp: now,
            emitted_at: now,
            latency_ms: 0.0,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            stages: preprocessed.stages,
            interpolated_channels: preprocessed.interpolated_channels,
            samples_processed: n,
            samples_dropped: 0,
        })
    }

    pub fn metrics(&self) -> StreamMetrics {
        let inner = self.shared.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let avg = if inner.processing_times_ms.is_empty() {
            0.0
        } else {
            inner.processing_times_ms.iter().sum::<f64>()
                / inner.processing_times_ms.len() as f64
        };
        StreamMetrics {
            samples_received: inner.samples_received,
            samples_processed: inner.samples_processed,
            chunks_processed: inner.chunks_processed,
            chunks_dropped: inner.chunks_dropped,
            windows_emitted: inner.windows_emitted,
            avg_processing_time_ms: avg,
            max_processing_time_ms: inner
                .processing_times_ms
                .iter()
                .copied()
                .fold(0.0, f64::max),
            buffer_fill_fraction: buffer.fill_fraction(),
            buffer_overflows: inner.buffer_overflows,
            last_quality_score: inner.last_quality_score,
            quality_alerts: inner.quality_alerts,
        }
    }

    pub fn update_processor_config(&self, config: ProcessorConfig) -> Result<()> {
        self.shared
            .pipeline
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .update_config(config.clone())?;
        self.shared
            .extractor
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .update_config(config.clone())?;
        *self.shared.assessor.write().unwrap_or_else(|e| e.into_inner()) =
            QualityAssessor::new(&config)?;
        Ok(())
    }

    pub fn set_thresholds(&self, thresholds: QualityThresholds) {
        self.shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_thresholds(thresholds);
    }

    pub fn quality_report(&self) -> QualityReport {
        self.shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .report(monotonic_now())
    }

    pub fn active_alert_count(&self) -> usize {
        self.shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active_alerts()
            .len()
    }

    /// Stops the driver, drains the tail, and returns the final metrics and
    /// the session quality report.
    pub fn stop(mut self) -> (StreamMetrics, QualityReport) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.driver.take() {
            let _ = handle.join();
        } else {
            // Never started as a thread: drain synchronously.
            Self::process_available(&self.shared);
            Self::process_tail(&self.shared);
        }
        let metrics = self.metrics();
        let report = self.quality_report();
        log::info!(
            "session {} stopped after {} windows",
            self.shared.session_id,
            metrics.windows_emitted
        );
        (metrics, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageKind;
    use ndarray::Array2;

    fn quick_configs(
        channels: usize,
        fs: f32,
        buffer_s: f32,
    ) -> (ProcessorConfig, StreamConfig) {
        let processor = ProcessorConfig {
            num_channels: channels,
            sampling_rate: fs,
            // Keep windows cheap and deterministic for driver tests.
            preprocessing_steps: vec![StageKind::Notch, StageKind::Bandpass],
            feature_types: vec![crate::config::FeatureGroupKind::TimeDomain],
            ..Default::default()
        };
        let stream = StreamConfig {
            buffer_size_seconds: buffer_s,
            ..Default::default()
        };
        (processor, stream)
    }

    fn alpha_block(channels: usize, n: usize, offset: usize) -> Array2<f32> {
        Array2::from_shape_fn((channels, n), |(_, i)| {
            let t = (offset + i) as f64 / 250.0;
            (30.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin()) as f32
        })
    }

    #[test]
    fn sliding_driver_emits_expected_window_starts() {
        // fs=250, window 2 s, overlap 0.5 → step 250; 1500 samples in
        // 5-sample chunks → starts 0, 250, 500, 750, 1000.
        let (processor, stream) = quick_configs(1, 250.0, 10.0);
        let session = StreamSession::new(
            "s-windows",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        let output = session.output();
        let mut fed = 0usize;
        while fed < 1500 {
            session
                .append_chunk(alpha_block(1, 5, fed).view())
                .unwrap();
            fed += 5;
            session.process_now();
        }
        let mut starts = Vec::new();
        while let Ok(w) = output.try_recv() {
            starts.push(w.window_start_index);
        }
        assert_eq!(starts, vec![0, 250, 500, 750, 1000]);
    }

    #[test]
    fn overflow_policy_drop_oldest_counts_events() {
        // 2500-sample buffer, 3000 samples in 100-sample chunks → 5
        // overflow events, newest 2500 samples retained.
        let (processor, stream) = quick_configs(1, 250.0, 10.0);
        let session = StreamSession::new(
            "s-overflow",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        for chunk in 0..30 {
            session
                .append_chunk(alpha_block(1, 100, chunk * 100).view())
                .unwrap();
        }
        let metrics = session.metrics();
        assert_eq!(metrics.buffer_overflows, 5);
        assert_eq!(metrics.samples_received, 3000);
        let buffer = session.shared.buffer.lock().unwrap();
        let latest = buffer.latest(2500).unwrap();
        // The newest sample corresponds to stream index 2999.
        let t = 2999.0 / 250.0;
        let expected = (30.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin()) as f32;
        assert!((latest[[0, 2499]] - expected).abs() < 1e-3);
    }

    #[test]
    fn overflow_policy_reject_refuses_chunks() {
        let (processor, mut stream) = quick_configs(1, 250.0, 10.0);
        stream.drop_on_overflow = false;
        let session = StreamSession::new(
            "s-reject",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        let mut rejected = 0;
        for chunk in 0..30 {
            if session
                .append_chunk(alpha_block(1, 100, chunk * 100).view())
                .is_err()
            {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 5);
        assert_eq!(session.metrics().chunks_dropped, 5);
    }

    #[test]
    fn min_samples_gate_defers_first_window() {
        let (processor, stream) = quick_configs(1, 250.0, 10.0);
        let session = StreamSession::new(
            "s-gate",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        session.append_chunk(alpha_block(1, 200, 0).view()).unwrap();
        assert_eq!(session.process_now(), 0);
        session
            .append_chunk(alpha_block(1, 300, 200).view())
            .unwrap();
        assert_eq!(session.process_now(), 1);
    }

    #[test]
    fn emitted_windows_carry_features_quality_and_counters() {
        let (processor, stream) = quick_configs(4, 250.0, 10.0);
        let session = StreamSession::new(
            "s-payload",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        let output = session.output();
        session.append_chunk(alpha_block(4, 600, 0).view()).unwrap();
        session.process_now();
        let window = output.try_recv().unwrap();
        assert_eq!(window.session_id, "s-payload");
        assert_eq!(window.data.dim(), (4, 500));
        assert!(window.features.contains_key("rms"));
        assert!(window.quality.composite_score > 0.0);
        assert!(window.processing_time_ms >= 0.0);
        assert_eq!(window.samples_processed, 500);
        assert_eq!(window.stages.len(), 2);
    }

    #[test]
    fn stop_drains_a_final_short_window() {
        let (processor, stream) = quick_configs(1, 250.0, 10.0);
        let session = StreamSession::new(
            "s-drain",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        let output = session.output();
        // 300 samples: not enough for a full 500-sample window, but past
        // min_samples_to_process (256).
        session.append_chunk(alpha_block(1, 300, 0).view()).unwrap();
        let (metrics, report) = session.stop();
        assert_eq!(metrics.windows_emitted, 1);
        assert_eq!(report.windows_assessed, 1);
        let tail = output.try_recv().unwrap();
        assert_eq!(tail.data.ncols(), 300);
    }

    #[test]
    fn threaded_driver_processes_on_ticks() {
        let (processor, mut stream) = quick_configs(2, 250.0, 10.0);
        stream.process_interval_ms = 10;
        let mut session = StreamSession::new(
            "s-threaded",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        session.start();
        let sink = session.frame_sink();
        let output = session.output();
        for i in 0..600 {
            let t = i as f64 / 250.0;
            let v = (30.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin()) as f32;
            sink.send(SampleFrame {
                timestamp: monotonic_now(),
                channels: vec![v, v],
                sample_index: i,
                aux: None,
                marker: None,
            })
            .unwrap();
        }
        let window = output
            .recv_timeout(Duration::from_secs(5))
            .expect("driver emits a window");
        assert_eq!(window.window_start_index, 0);
        let (metrics, _) = session.stop();
        assert!(metrics.windows_emitted >= 1);
        assert_eq!(metrics.samples_received, 600);
    }

    #[test]
    fn queue_bound_drops_backlog() {
        let (processor, mut stream) = quick_configs(1, 250.0, 40.0);
        stream.max_processing_queue = 2;
        let session = StreamSession::new(
            "s-backlog",
            processor,
            stream,
            QualityThresholds::default(),
        )
        .unwrap();
        // 3000 samples ready at once → 11 candidate windows, bound 2.
        session.append_chunk(alpha_block(1, 3000, 0).view()).unwrap();
        let processed = session.process_now();
        assert_eq!(processed, 2);
        assert!(session.metrics().chunks_dropped >= 9);
    }
}
