//! Feature extraction: five independently selectable groups with adaptive
//! quality gating. Groups run concurrently; a failing or gated-out group
//! simply contributes no keys.

pub mod connectivity;
pub mod frequency;
pub mod spatial;
pub mod time_domain;
pub mod time_frequency;

use ndarray::Array2;
use rayon::prelude::*;

use crate::config::{FeatureGroupKind, ProcessorConfig};
use crate::error::Result;
use crate::types::FeatureBundle;

pub struct FeatureExtractor {
    config: ProcessorConfig,
}

impl FeatureExtractor {
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn update_config(&mut self, config: ProcessorConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Extracts every configured group from one preprocessed window.
    pub fn extract(&self, data: &Array2<f32>, quality_score: f32) -> FeatureBundle {
        let bundles: Vec<FeatureBundle> = self
            .config
            .feature_types
            .par_iter()
            .map(|group| self.extract_group(*group, data, quality_score))
            .collect();
        let mut merged = FeatureBundle::new();
        for bundle in bundles {
            merged.extend(bundle);
        }
        merged
    }

    fn extract_group(
        &self,
        group: FeatureGroupKind,
        data: &Array2<f32>,
        quality_score: f32,
    ) -> FeatureBundle {
        let fs = self.config.sampling_rate;
        match group {
            FeatureGroupKind::TimeDomain => time_domain::extract(data, fs, quality_score),
            FeatureGroupKind::FrequencyDomain => frequency::extract(data, fs, quality_score),
            FeatureGroupKind::TimeFrequency => time_frequency::extract(
                data,
                fs,
                &self.config.morlet_frequencies,
                quality_score,
            ),
            FeatureGroupKind::Spatial => spatial::extract(
                data,
                self.config.channel_positions.as_deref(),
                quality_score,
            ),
            FeatureGroupKind::Connectivity => {
                connectivity::extract(data, &self.config, quality_score)
            }
        }
    }
}
