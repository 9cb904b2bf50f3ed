//! Spatial referencing: common average reference and surface Laplacian.

use ndarray::Array2;

use crate::config::{ProcessorConfig, SpatialFilterKind};
use crate::error::Result;

/// Common average reference: subtracts the instantaneous mean of the
/// non-excluded channels from every channel.
pub fn car(data: &Array2<f32>, exclude: &[usize]) -> Array2<f32> {
    let channels = data.nrows();
    let samples = data.ncols();
    let included: Vec<usize> = (0..channels).filter(|ch| !exclude.contains(ch)).collect();
    if included.is_empty() {
        return data.clone();
    }
    let mut out = data.clone();
    for s in 0..samples {
        let reference: f32 =
            included.iter().map(|&ch| data[[ch, s]]).sum::<f32>() / included.len() as f32;
        for ch in 0..channels {
            out[[ch, s]] = data[[ch, s]] - reference;
        }
    }
    out
}

/// Neighbour weights for every channel: distance-weighted within the radius
/// when positions are known, nearest-index (Hjorth) otherwise. Weights per
/// row sum to one.
fn laplacian_neighbours(
    channels: usize,
    config: &ProcessorConfig,
) -> Vec<Vec<(usize, f32)>> {
    if let Some(positions) = config
        .channel_positions
        .as_ref()
        .filter(|p| p.len() == channels)
    {
        let radius = config.laplacian_radius_cm.max(f32::EPSILON);
        (0..channels)
            .map(|i| {
                let mut neighbours: Vec<(usize, f32)> = (0..channels)
                    .filter(|&j| j != i)
                    .filter_map(|j| {
                        let dx = positions[i][0] - positions[j][0];
                        let dy = positions[i][1] - positions[j][1];
                        let dz = positions[i][2] - positions[j][2];
                        let d = (dx * dx + dy * dy + dz * dz).sqrt();
                        (d <= radius && d > f32::EPSILON).then_some((j, 1.0 / d))
                    })
                    .collect();
                let total: f32 = neighbours.iter().map(|(_, w)| w).sum();
                if total > f32::EPSILON {
                    for (_, w) in neighbours.iter_mut() {
                        *w /= total;
                    }
                }
                neighbours
            })
            .collect()
    } else {
        // Hjorth fallback: adjacent montage indices.
        (0..channels)
            .map(|i| {
                let mut neighbours = Vec::new();
                if i > 0 {
                    neighbours.push(i - 1);
                }
                if i + 1 < channels {
                    neighbours.push(i + 1);
                }
                let w = 1.0 / neighbours.len().max(1) as f32;
                neighbours.into_iter().map(|j| (j, w)).collect()
            })
            .collect()
    }
}

/// Surface Laplacian: each channel minus the weighted mean of its
/// neighbours.
pub fn laplacian(data: &Array2<f32>, config: &ProcessorConfig) -> Array2<f32> {
    let channels = data.nrows();
    let samples = data.ncols();
    let neighbours = laplacian_neighbours(channels, config);
    let mut out = data.clone();
    for ch in 0..channels {
        if neighbours[ch].is_empty() {
            continue;
        }
        for s in 0..samples {
            let surround: f32 = neighbours[ch]
                .iter()
                .map(|&(j, w)| w * data[[j, s]])
                .sum();
            out[[ch, s]] = data[[ch, s]] - surround;
        }
    }
    out
}

pub fn spatial_stage(data: &Array2<f32>, config: &ProcessorConfig) -> Result<Array2<f32>> {
    Ok(match config.spatial_filter_type {
        SpatialFilterKind::Car => car(data, &[]),
        SpatialFilterKind::Laplacian => laplacian(data, config),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn car_zeroes_a_common_signal() {
        // Identical channels reference to exactly zero.
        let data = Array2::from_shape_fn((4, 100), |(_, i)| (i as f32 * 0.1).sin() * 10.0);
        let out = car(&data, &[]);
        for v in out.iter() {
            assert!(v.abs() < 1e-5);
        }
    }

    #[test]
    fn car_respects_exclusions() {
        let mut data = Array2::zeros((3, 10));
        for i in 0..10 {
            data[[0, i]] = 1.0;
            data[[1, i]] = 1.0;
            data[[2, i]] = 100.0; // excluded from the reference
        }
        let out = car(&data, &[2]);
        for i in 0..10 {
            assert!((out[[0, i]]).abs() < 1e-6);
            assert!((out[[2, i]] - 99.0).abs() < 1e-6);
        }
    }

    #[test]
    fn hjorth_laplacian_removes_shared_activity() {
        let data = Array2::from_shape_fn((5, 200), |(_, i)| (i as f32 * 0.05).sin() * 20.0);
        let config = ProcessorConfig {
            spatial_filter_type: SpatialFilterKind::Laplacian,
            ..Default::default()
        };
        let out = spatial_stage(&data, &config).unwrap();
        for v in out.iter() {
            assert!(v.abs() < 1e-4);
        }
    }

    #[test]
    fn positional_laplacian_weights_by_inverse_distance() {
        let mut config = ProcessorConfig {
            spatial_filter_type: SpatialFilterKind::Laplacian,
            num_channels: 3,
            ..Default::default()
        };
        // Channel 1 sits 1 cm from channel 0 and 2 cm from channel 2.
        config.channel_positions = Some(vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [3.0, 0.0, 0.0],
        ]);
        let mut data = Array2::zeros((3, 1));
        data[[0, 0]] = 3.0;
        data[[1, 0]] = 0.0;
        data[[2, 0]] = 3.0;
        let out = laplacian(&data, &config);
        // Weights 2/3 and 1/3 → surround = 3; center = 0 − 3.
        assert!((out[[1, 0]] + 3.0).abs() < 1e-6);
    }

    #[test]
    fn shape_preserved() {
        let data = Array2::zeros((6, 123));
        let config = ProcessorConfig::default();
        let out = spatial_stage(&data, &config).unwrap();
        assert_eq!(out.dim(), data.dim());
    }
}
