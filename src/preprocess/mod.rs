//! The preprocessing pipeline: a configurable ordered chain of stages, each
//! a pure channels×samples → channels×samples transform. A failing stage
//! passes its input through unchanged and is recorded, so a degraded window
//! still reaches the consumer.

pub mod artifact;
pub mod filtering;
pub mod repair;
pub mod spatial;

use std::time::Instant;

use ndarray::Array2;

use crate::config::{ProcessorConfig, StageKind};
use crate::dsp::filter::{butter_bandpass, Sos};
use crate::error::Result;
use crate::types::{PreprocessOutput, StageRecord};

pub struct PreprocessPipeline {
    config: ProcessorConfig,
    /// Cached Butterworth design; rebuilt only on configuration updates.
    bandpass: Sos,
}

impl PreprocessPipeline {
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        let bandpass = butter_bandpass(
            config.filter_order,
            config.bandpass_low as f64,
            config.bandpass_high as f64,
            config.sampling_rate as f64,
        )?;
        Ok(Self { config, bandpass })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Swaps in a new configuration; the runtime path only ever sees fully
    /// validated state.
    pub fn update_config(&mut self, config: ProcessorConfig) -> Result<()> {
        config.validate()?;
        let bandpass = butter_bandpass(
            config.filter_order,
            config.bandpass_low as f64,
            config.bandpass_high as f64,
            config.sampling_rate as f64,
        )?;
        self.config = config;
        self.bandpass = bandpass;
        Ok(())
    }

    /// Runs the configured stage plan over one window.
    pub fn process(&self, data: &Array2<f32>) -> PreprocessOutput {
        let mut current = data.clone();
        let mut stages = Vec::with_capacity(self.config.preprocessing_steps.len());
        let mut interpolated_channels = Vec::new();
        let mut bad_channels = Vec::new();

        for &stage in &self.config.preprocessing_steps {
            let started = Instant::now();
            let outcome = self.run_stage(stage, &current);
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(StageOutcome {
                    data: next,
                    interpolated,
                    bad,
                }) => {
                    debug_assert_eq!(next.dim(), current.dim());
                    current = next;
                    interpolated_channels.extend(interpolated);
                    bad_channels.extend(bad);
                    stages.push(StageRecord {
                        stage,
                        duration_ms,
                        failed: false,
                    });
                }
                Err(e) => {
                    log::warn!("stage {} failed: {e}", stage.name());
                    stages.push(StageRecord {
                        stage,
                        duration_ms,
                        failed: true,
                    });
                }
            }
        }
        interpolated_channels.sort_unstable();
        interpolated_channels.dedup();
        bad_channels.sort_unstable();
        bad_channels.dedup();

        PreprocessOutput {
            data: current,
            stages,
            interpolated_channels,
            bad_channels,
        }
    }

    fn run_stage(&self, stage: StageKind, data: &Array2<f32>) -> Result<StageOutcome> {
        match stage {
            StageKind::Notch => Ok(StageOutcome::plain(filtering::notch_stage(
                data,
                &self.config,
            )?)),
            StageKind::Bandpass => Ok(StageOutcome::plain(filtering::bandpass_stage(
                data,
                &self.bandpass,
            )?)),
            StageKind::ArtifactRemoval => Ok(StageOutcome::plain(artifact::artifact_stage(
                data,
                &self.config,
            )?)),
            StageKind::ChannelRepair => {
                let (out, bad, interpolated) = repair::repair_stage(data, &self.config)?;
                Ok(StageOutcome {
                    data: out,
                    interpolated,
                    bad,
                })
            }
            StageKind::SpatialFilter => Ok(StageOutcome::plain(spatial::spatial_stage(
                data,
                &self.config,
            )?)),
        }
    }
}

struct StageOutcome {
    data: Array2<f32>,
    interpolated: Vec<usize>,
    bad: Vec<usize>,
}

impl StageOutcome {
    fn plain(data: Array2<f32>) -> Self {
        Self {
            data,
            interpolated: Vec::new(),
            bad: Vec::new(),
        }
    }
}
