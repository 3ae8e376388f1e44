//! Point-cloud registration (matching-cost) factors.
//!
//! These factors hold non-owning (shared) references to clouds and voxel
//! maps that live in the submap index; the factor must not outlive those
//! resources, which `Arc` guarantees. They are excluded from binary
//! serialization and reconstructed from `(kind, i, j)` descriptors on
//! reload.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::{pose_at, FactorResult, Linearization};
use crate::pointcloud::{GaussianVoxelMap, PointCloud};
use crate::se3::{skew, SE3};

/// Covariance floor added to voxel distributions before inversion.
const COV_EPSILON: f64 = 1e-3;

/// A stream/temp-buffer slot handed to GPU-kind factors.
///
/// Without a CUDA build the slot only models the resource lifetime: a factor
/// acquires one at construction and releases it when dropped.
#[derive(Debug)]
pub struct StreamSlot {
    pub id: usize,
}

/// Round-robin pool of stream/buffer slots backing GPU-kind factors.
#[derive(Debug)]
pub struct StreamBufferRoundRobin {
    slots: Vec<Arc<StreamSlot>>,
    cursor: AtomicUsize,
}

impl StreamBufferRoundRobin {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|id| Arc::new(StreamSlot { id })).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next slot in round-robin order.
    pub fn get_stream_buffer(&self) -> Arc<StreamSlot> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        Arc::clone(&self.slots[idx])
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for StreamBufferRoundRobin {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Cloud-to-cloud ICP cost between two poses.
///
/// Correspondences are nearest neighbors in the source cloud (k-d tree),
/// gated by a maximum distance. Used by the between-factor builder to
/// estimate the relative pose of consecutive submaps.
#[derive(Clone)]
pub struct GicpFactor {
    pub key1: Key,
    pub key2: Key,
    source: Arc<PointCloud>,
    target: Arc<PointCloud>,
    tree: Arc<KdTree<f64, 3>>,
    max_correspondence_distance: f64,
    num_threads: usize,
}

impl std::fmt::Debug for GicpFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GicpFactor")
            .field("key1", &self.key1)
            .field("key2", &self.key2)
            .field("source_points", &self.source.len())
            .field("target_points", &self.target.len())
            .field("max_correspondence_distance", &self.max_correspondence_distance)
            .finish()
    }
}

impl GicpFactor {
    pub fn new(key1: Key, key2: Key, source: Arc<PointCloud>, target: Arc<PointCloud>) -> Self {
        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, p) in source.points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        Self {
            key1,
            key2,
            source,
            target,
            tree: Arc::new(tree),
            max_correspondence_distance: 1.0,
            num_threads: 1,
        }
    }

    pub fn set_max_correspondence_distance(mut self, dist: f64) -> Self {
        self.max_correspondence_distance = dist;
        self
    }

    pub fn set_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    fn correspondences(&self, delta: &SE3) -> Vec<(Vector3<f64>, Vector3<f64>)> {
        let max_sq = self.max_correspondence_distance * self.max_correspondence_distance;
        let pair_for = |p: &Vector3<f64>| -> Option<(Vector3<f64>, Vector3<f64>)> {
            let q = delta.transform_point(p);
            let nearest = self.tree.nearest_one::<SquaredEuclidean>(&[q.x, q.y, q.z]);
            if nearest.distance > max_sq {
                return None;
            }
            let matched = self.source.points[nearest.item as usize];
            Some((*p, matched))
        };

        #[cfg(feature = "parallel")]
        if self.num_threads > 1 {
            return self.target.points.par_iter().filter_map(pair_for).collect();
        }

        self.target.points.iter().filter_map(pair_for).collect()
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let pose1 = pose_at(values, self.key1)?;
        let pose2 = pose_at(values, self.key2)?;
        let delta = pose1.delta_to(&pose2);

        if self.source.is_empty() || self.target.is_empty() {
            return Ok(empty_linearization(self.key1, self.key2, compute_jacobian));
        }

        let pairs = self.correspondences(&delta);
        let rows = 3 * pairs.len();
        let mut residual = DVector::zeros(rows);
        let mut jac1 = compute_jacobian.then(|| DMatrix::zeros(rows, 6));
        let mut jac2 = compute_jacobian.then(|| DMatrix::zeros(rows, 6));

        let r_delta = delta.rotation_matrix();
        for (n, (p_target, p_source)) in pairs.iter().enumerate() {
            let q = delta.transform_point(p_target);
            let r = p_source - q;
            residual.fixed_rows_mut::<3>(3 * n).copy_from(&r);

            if let (Some(j1), Some(j2)) = (jac1.as_mut(), jac2.as_mut()) {
                fill_pose_pair_jacobians(j1, j2, 3 * n, &q, p_target, &r_delta);
            }
        }

        let jacobians = match (jac1, jac2) {
            (Some(j1), Some(j2)) => Some(vec![j1, j2]),
            _ => None,
        };
        Ok(Linearization {
            keys: vec![self.key1, self.key2],
            residual,
            jacobians,
        })
    }

    /// 6x6 Hessian block of the second pose, `J2^T J2`, used to derive an
    /// information matrix for the estimated between-factor.
    pub fn hessian_block_second(&self, values: &Values) -> FactorResult<nalgebra::Matrix6<f64>> {
        let lin = self.linearize(values, true)?;
        let Some(jacs) = lin.jacobians else {
            return Ok(nalgebra::Matrix6::zeros());
        };
        let jac = &jacs[1];
        let mut h = nalgebra::Matrix6::zeros();
        for row in 0..jac.nrows() {
            for a in 0..6 {
                for b in 0..6 {
                    h[(a, b)] += jac[(row, a)] * jac[(row, b)];
                }
            }
        }
        Ok(h)
    }
}

/// Distribution-to-point VGICP cost between a voxel map and a cloud.
///
/// Each cloud point is matched to the voxel it falls into; the residual is
/// the mahalanobis-whitened distance to the voxel mean. `gpu` marks factors
/// that were configured for the GPU backend; they evaluate through the same
/// CPU path here but keep their round-robin stream slot and persist under
/// the `vgicp_gpu` descriptor kind.
#[derive(Clone)]
pub struct VgicpFactor {
    pub key1: Key,
    pub key2: Key,
    pub gpu: bool,
    voxelmap: Arc<GaussianVoxelMap>,
    cloud: Arc<PointCloud>,
    #[allow(dead_code)]
    stream_slot: Option<Arc<StreamSlot>>,
}

impl std::fmt::Debug for VgicpFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VgicpFactor")
            .field("key1", &self.key1)
            .field("key2", &self.key2)
            .field("gpu", &self.gpu)
            .field("voxels", &self.voxelmap.num_voxels())
            .field("cloud_points", &self.cloud.len())
            .finish()
    }
}

impl VgicpFactor {
    pub fn new(key1: Key, key2: Key, voxelmap: Arc<GaussianVoxelMap>, cloud: Arc<PointCloud>) -> Self {
        Self {
            key1,
            key2,
            gpu: false,
            voxelmap,
            cloud,
            stream_slot: None,
        }
    }

    /// GPU-kind variant holding a slot from the round-robin stream pool.
    pub fn new_gpu(
        key1: Key,
        key2: Key,
        voxelmap: Arc<GaussianVoxelMap>,
        cloud: Arc<PointCloud>,
        stream_slot: Arc<StreamSlot>,
    ) -> Self {
        Self {
            key1,
            key2,
            gpu: true,
            voxelmap,
            cloud,
            stream_slot: Some(stream_slot),
        }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let pose1 = pose_at(values, self.key1)?;
        let pose2 = pose_at(values, self.key2)?;
        let delta = pose1.delta_to(&pose2);
        let r_delta = delta.rotation_matrix();

        // Collect matched points with their whitening transforms
        let mut matched: Vec<(Vector3<f64>, Vector3<f64>, Matrix3<f64>)> = Vec::new();
        for p in &self.cloud.points {
            let q = delta.transform_point(p);
            if let Some(voxel) = self.voxelmap.lookup(&q) {
                let info = (voxel.cov + Matrix3::identity() * COV_EPSILON)
                    .try_inverse()
                    .unwrap_or_else(Matrix3::identity);
                let sqrt_info = match info.cholesky() {
                    Some(chol) => chol.l().transpose(),
                    None => Matrix3::identity(),
                };
                matched.push((*p, voxel.mean, sqrt_info));
            }
        }

        let rows = 3 * matched.len();
        let mut residual = DVector::zeros(rows);
        let mut jac1 = compute_jacobian.then(|| DMatrix::zeros(rows, 6));
        let mut jac2 = compute_jacobian.then(|| DMatrix::zeros(rows, 6));

        for (n, (p, mean, sqrt_info)) in matched.iter().enumerate() {
            let q = delta.transform_point(p);
            let r = sqrt_info * (mean - q);
            residual.fixed_rows_mut::<3>(3 * n).copy_from(&r);

            if let (Some(j1), Some(j2)) = (jac1.as_mut(), jac2.as_mut()) {
                fill_pose_pair_jacobians(j1, j2, 3 * n, &q, p, &r_delta);
                // Apply the per-voxel whitening to the freshly written rows
                for jac in [&mut *j1, &mut *j2] {
                    let block = jac.view((3 * n, 0), (3, 6)).into_owned();
                    jac.view_mut((3 * n, 0), (3, 6)).copy_from(&(sqrt_info * block));
                }
            }
        }

        let jacobians = match (jac1, jac2) {
            (Some(j1), Some(j2)) => Some(vec![j1, j2]),
            _ => None,
        };
        Ok(Linearization {
            keys: vec![self.key1, self.key2],
            residual,
            jacobians,
        })
    }
}

/// Jacobian rows of the residual `r = target_in_map_frame - delta * p`
/// with respect to both poses (right perturbation, tangent `[rho, theta]`).
fn fill_pose_pair_jacobians(
    jac1: &mut DMatrix<f64>,
    jac2: &mut DMatrix<f64>,
    row: usize,
    q: &Vector3<f64>,
    p: &Vector3<f64>,
    r_delta: &Matrix3<f64>,
) {
    // d r / d xi_1 = [I, -skew(q)]
    jac1.view_mut((row, 0), (3, 3)).copy_from(&Matrix3::identity());
    jac1.view_mut((row, 3), (3, 3)).copy_from(&(-skew(q)));

    // d r / d xi_2 = -R_delta [I, -skew(p)]
    jac2.view_mut((row, 0), (3, 3)).copy_from(&(-r_delta));
    jac2.view_mut((row, 3), (3, 3)).copy_from(&(r_delta * skew(p)));
}

fn empty_linearization(key1: Key, key2: Key, compute_jacobian: bool) -> Linearization {
    Linearization {
        keys: vec![key1, key2],
        residual: DVector::zeros(0),
        jacobians: compute_jacobian.then(|| vec![DMatrix::zeros(0, 6), DMatrix::zeros(0, 6)]),
    }
}
