//! Gaussian voxel maps for distribution-to-point registration.
//!
//! Points are binned into cubic voxels; each voxel keeps the running mean
//! and covariance of its members. Registration factors match points against
//! these per-voxel distributions, and the overlap ratio between a map and a
//! cloud gates implicit loop-closure candidates.

use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;

use crate::pointcloud::PointCloud;
use crate::se3::SE3;

/// Integer voxel coordinates.
pub type VoxelIndex = (i32, i32, i32);

/// Per-voxel Gaussian statistics.
#[derive(Debug, Clone)]
pub struct GaussianVoxel {
    pub num_points: usize,
    pub mean: Vector3<f64>,
    pub cov: Matrix3<f64>,
}

/// Spatial index binning points into voxels with per-voxel mean/covariance.
#[derive(Debug, Clone)]
pub struct GaussianVoxelMap {
    resolution: f64,
    voxels: HashMap<VoxelIndex, GaussianVoxel>,
}

impl GaussianVoxelMap {
    pub fn new(resolution: f64) -> Self {
        Self {
            resolution,
            voxels: HashMap::new(),
        }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    pub fn voxel_index(&self, p: &Vector3<f64>) -> VoxelIndex {
        (
            (p.x / self.resolution).floor() as i32,
            (p.y / self.resolution).floor() as i32,
            (p.z / self.resolution).floor() as i32,
        )
    }

    /// Insert a cloud, accumulating per-voxel first and second moments.
    pub fn insert(&mut self, cloud: &PointCloud) {
        // First pass: accumulate sums
        let mut sums: HashMap<VoxelIndex, (usize, Vector3<f64>, Matrix3<f64>)> = HashMap::new();
        for p in &cloud.points {
            let idx = self.voxel_index(p);
            let entry = sums
                .entry(idx)
                .or_insert((0, Vector3::zeros(), Matrix3::zeros()));
            entry.0 += 1;
            entry.1 += p;
            entry.2 += p * p.transpose();
        }

        for (idx, (count, sum, sq_sum)) in sums {
            let voxel = self.voxels.entry(idx).or_insert(GaussianVoxel {
                num_points: 0,
                mean: Vector3::zeros(),
                cov: Matrix3::zeros(),
            });

            // Merge with any existing statistics
            let total = voxel.num_points + count;
            let merged_sum = voxel.mean * voxel.num_points as f64 + sum;
            let merged_sq = (voxel.cov
                + voxel.mean * voxel.mean.transpose()) * voxel.num_points as f64
                + sq_sum;

            let mean = merged_sum / total as f64;
            let cov = merged_sq / total as f64 - mean * mean.transpose();

            voxel.num_points = total;
            voxel.mean = mean;
            voxel.cov = cov;
        }
    }

    pub fn lookup(&self, p: &Vector3<f64>) -> Option<&GaussianVoxel> {
        self.voxels.get(&self.voxel_index(p))
    }

    /// Fraction of `cloud` points that land in an occupied voxel after being
    /// transformed by `delta` into this map's frame.
    pub fn overlap(&self, cloud: &PointCloud, delta: &SE3) -> f64 {
        if cloud.is_empty() {
            return 0.0;
        }
        let hits = cloud
            .points
            .iter()
            .filter(|p| self.lookup(&delta.transform_point(p)).is_some())
            .count();
        hits as f64 / cloud.len() as f64
    }
}

/// Build `levels` voxel maps at geometrically scaled resolutions, finest
/// first, and insert the cloud into each.
pub fn build_multilevel(
    cloud: &PointCloud,
    base_resolution: f64,
    levels: usize,
    scaling_factor: f64,
) -> Vec<std::sync::Arc<GaussianVoxelMap>> {
    (0..levels)
        .map(|i| {
            let resolution = base_resolution * scaling_factor.powi(i as i32);
            let mut map = GaussianVoxelMap::new(resolution);
            map.insert(cloud);
            std::sync::Arc::new(map)
        })
        .collect()
}
