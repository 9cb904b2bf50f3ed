//! neurostream: real-time multi-channel neural-signal processing.
//!
//! Dataflow: device adapters decode wire packets into frames, the device
//! manager routes frames into per-session ring buffers, and each session's
//! driver pulls sliding windows through preprocessing, quality assessment
//! and feature extraction before emitting processed windows to subscribers.

pub mod buffer;
pub mod config;
pub mod devices;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod features;
pub mod monitor;
pub mod preprocess;
pub mod quality;
pub mod stream;
pub mod types;

pub use buffer::StreamBuffer;
pub use config::{ProcessorConfig, QualityThresholds, StreamConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use features::FeatureExtractor;
pub use monitor::{QualityMonitor, QualityReport};
pub use preprocess::PreprocessPipeline;
pub use quality::QualityAssessor;
pub use stream::StreamSession;
pub use types::{
    DeviceDescriptor, DeviceKind, DeviceState, ProcessedWindow, QualityMetrics, SampleFrame,
    StreamMetrics, Window,
};
