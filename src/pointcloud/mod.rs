//! Point-cloud storage and the sampling utilities the voxel-map builder
//! relies on.

pub mod voxelmap;

pub use voxelmap::GaussianVoxelMap;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::se3::SE3;

/// A 3D point cloud in an arbitrary reference frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Vector3<f64>>,
}

impl PointCloud {
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Transform every point by `pose`.
    pub fn transformed(&self, pose: &SE3) -> PointCloud {
        PointCloud {
            points: self.points.iter().map(|p| pose.transform_point(p)).collect(),
        }
    }
}

/// Median distance of up to `max_samples` strided points from the origin.
///
/// Drives the adaptive voxel resolution: close-range indoor submaps get fine
/// voxels, long-range outdoor submaps get coarse ones.
pub fn median_distance(cloud: &PointCloud, max_samples: usize) -> f64 {
    if cloud.is_empty() || max_samples == 0 {
        return 0.0;
    }

    let stride = (cloud.len() / max_samples).max(1);
    let mut dists: Vec<f64> = cloud
        .points
        .iter()
        .step_by(stride)
        .take(max_samples)
        .map(|p| p.norm())
        .collect();

    let mid = dists.len() / 2;
    *dists
        .select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .1
}

/// Randomly keep roughly `rate * len` points.
///
/// Callers pass a deterministic, per-backend PRNG; the sampling is therefore
/// reproducible run to run. Rates at or above 0.99 short-circuit to the
/// input cloud (identity subsampling, pointer-equal semantics).
pub fn random_sampling(cloud: &Arc<PointCloud>, rate: f64, rng: &mut StdRng) -> Arc<PointCloud> {
    if rate >= 0.99 {
        return Arc::clone(cloud);
    }

    let points = cloud
        .points
        .iter()
        .filter(|_| rng.gen::<f64>() < rate)
        .copied()
        .collect();
    Arc::new(PointCloud::new(points))
}
