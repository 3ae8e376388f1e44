//! Submaps: locally consistent trajectory fragments produced by the
//! front-end, plus the backend state attached to them.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::imu::ImuBias;
use crate::pointcloud::{GaussianVoxelMap, PointCloud};
use crate::se3::SE3;

/// Submap save/load error types.
#[derive(Debug, Error)]
pub enum SubmapIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("submap serialization error: {0}")]
    Codec(#[from] bincode::Error),
}

/// A single odometry estimation frame as seen by the backend.
///
/// The first and last frames of a submap carry the IMU bias, world-frame
/// velocity, and timestamps used to form IMU chain factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdomFrame {
    pub stamp: f64,
    pub t_world_sensor: SE3,
    pub imu_bias: ImuBias,
    pub v_world_imu: Vector3<f64>,
}

impl OdomFrame {
    pub fn new(stamp: f64, t_world_sensor: SE3) -> Self {
        Self {
            stamp,
            t_world_sensor,
            imu_bias: ImuBias::zero(),
            v_world_imu: Vector3::zeros(),
        }
    }
}

/// An immutable front-end snapshot plus mutable backend state.
///
/// `t_world_origin` is the only field the backend mutates; it is refreshed
/// from the smoother estimate after every update. Voxel maps are built by
/// the backend on insertion and rebuilt on reload.
#[derive(Debug, Clone)]
pub struct Submap {
    pub id: u64,

    pub t_world_origin: SE3,
    pub t_origin_endpoint_l: SE3,
    pub t_origin_endpoint_r: SE3,

    /// Merged keyframes in the submap origin frame, deskewed.
    pub merged_keyframe: Arc<PointCloud>,

    /// Multi-resolution voxel maps, finest first.
    pub voxelmaps: Vec<Arc<GaussianVoxelMap>>,

    /// Optimized odometry frames.
    pub optim_odom_frames: Vec<OdomFrame>,
    /// Original odometry frames.
    pub origin_odom_frames: Vec<OdomFrame>,
}

/// Serialized form of a submap (voxel maps are rebuilt on load).
#[derive(Serialize, Deserialize)]
struct StoredSubmap {
    id: u64,
    t_world_origin: SE3,
    t_origin_endpoint_l: SE3,
    t_origin_endpoint_r: SE3,
    merged_keyframe: PointCloud,
    optim_odom_frames: Vec<OdomFrame>,
    origin_odom_frames: Vec<OdomFrame>,
}

impl Submap {
    /// The odometry frame at the submap origin.
    pub fn origin_odom_frame(&self) -> &OdomFrame {
        &self.origin_odom_frames[self.origin_odom_frames.len() / 2]
    }

    /// Save this submap's frames and cloud under `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), SubmapIoError> {
        fs::create_dir_all(dir)?;
        let stored = StoredSubmap {
            id: self.id,
            t_world_origin: self.t_world_origin,
            t_origin_endpoint_l: self.t_origin_endpoint_l,
            t_origin_endpoint_r: self.t_origin_endpoint_r,
            merged_keyframe: (*self.merged_keyframe).clone(),
            optim_odom_frames: self.optim_odom_frames.clone(),
            origin_odom_frames: self.origin_odom_frames.clone(),
        };
        let file = fs::File::create(dir.join("submap.bin"))?;
        bincode::serialize_into(std::io::BufWriter::new(file), &stored)?;
        Ok(())
    }

    /// Load a submap from `dir`. Voxel maps come back empty.
    pub fn load(dir: &Path) -> Result<Submap, SubmapIoError> {
        let file = fs::File::open(dir.join("submap.bin"))?;
        let stored: StoredSubmap = bincode::deserialize_from(std::io::BufReader::new(file))?;
        Ok(Submap {
            id: stored.id,
            t_world_origin: stored.t_world_origin,
            t_origin_endpoint_l: stored.t_origin_endpoint_l,
            t_origin_endpoint_r: stored.t_origin_endpoint_r,
            merged_keyframe: Arc::new(stored.merged_keyframe),
            voxelmaps: Vec::new(),
            optim_odom_frames: stored.optim_odom_frames,
            origin_odom_frames: stored.origin_odom_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    pub(crate) fn sample_submap(id: u64, x: f64) -> Submap {
        let cloud = PointCloud::new(vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ]);
        let frame = |stamp: f64| OdomFrame::new(stamp, SE3::from_translation(Vector3::new(x, 0.0, 0.0)));
        Submap {
            id,
            t_world_origin: SE3::from_translation(Vector3::new(x, 0.0, 0.0)),
            t_origin_endpoint_l: SE3::identity(),
            t_origin_endpoint_r: SE3::identity(),
            merged_keyframe: Arc::new(cloud),
            voxelmaps: Vec::new(),
            optim_odom_frames: vec![frame(0.0), frame(0.5), frame(1.0)],
            origin_odom_frames: vec![frame(0.0), frame(0.5), frame(1.0)],
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let submap = sample_submap(3, 2.5);
        submap.save(dir.path()).unwrap();

        let loaded = Submap::load(dir.path()).unwrap();
        assert_eq!(loaded.id, 3);
        assert_eq!(loaded.merged_keyframe.len(), 3);
        assert!(loaded.voxelmaps.is_empty());
        assert_relative_eq!(loaded.t_world_origin.translation().x, 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_load_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Submap::load(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_origin_odom_frame_is_middle() {
        let submap = sample_submap(0, 0.0);
        assert_relative_eq!(submap.origin_odom_frame().stamp, 0.5);
    }
}
