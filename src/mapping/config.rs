//! Backend configuration.

use serde::{Deserialize, Serialize};

use crate::smoother::SmootherSettings;

/// How consecutive-submap between-factors are estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BetweenRegistration {
    /// Refine the odometry delta with a local GICP alignment.
    #[default]
    Gicp,
    /// Trust the odometry delta as-is with tight isotropic precision.
    None,
}

/// Which registration factor backs matching costs.
///
/// GPU mode is a property of the variant, not of a string spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationErrorKind {
    #[default]
    Vgicp,
    VgicpGpu,
}

impl RegistrationErrorKind {
    pub fn is_gpu(&self) -> bool {
        matches!(self, RegistrationErrorKind::VgicpGpu)
    }
}

/// Flat configuration record for the global mapping backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalMappingConfig {
    /// Include IMU endpoint variables and chain factors.
    pub enable_imu: bool,
    /// If false, use a no-op smoother that still stores values/factors.
    pub enable_optimization: bool,

    /// Emit GICP-estimated between-factors between consecutive submaps.
    pub enable_between_factors: bool,
    pub between_registration_type: BetweenRegistration,
    pub registration_error_factor_type: RegistrationErrorKind,

    /// Low end of the adaptive voxel resolution.
    pub submap_voxel_resolution: f64,
    /// High end of the adaptive voxel resolution.
    pub submap_voxel_resolution_max: f64,
    /// Median range mapped to the low resolution end.
    pub submap_voxel_resolution_dmin: f64,
    /// Median range mapped to the high resolution end.
    pub submap_voxel_resolution_dmax: f64,

    pub submap_voxelmap_levels: usize,
    pub submap_voxelmap_scaling_factor: f64,

    /// Fraction of points kept in the subsampled cloud.
    pub randomsampling_rate: f64,
    /// Spatial gate for implicit loops.
    pub max_implicit_loop_distance: f64,
    /// Overlap gate for implicit loops.
    pub min_implicit_loop_overlap: f64,

    /// Dog-leg steps instead of Levenberg-Marquardt inside the smoother.
    pub use_isam2_dogleg: bool,
    pub isam2_relinearize_skip: usize,
    pub isam2_relinearize_thresh: f64,

    /// Strength of the X(0) anchor.
    pub init_pose_damping_scale: f64,
}

impl Default for GlobalMappingConfig {
    fn default() -> Self {
        Self {
            enable_imu: true,
            enable_optimization: true,
            enable_between_factors: false,
            between_registration_type: BetweenRegistration::Gicp,
            registration_error_factor_type: RegistrationErrorKind::Vgicp,
            submap_voxel_resolution: 1.0,
            submap_voxel_resolution_max: 1.0,
            submap_voxel_resolution_dmin: 5.0,
            submap_voxel_resolution_dmax: 20.0,
            submap_voxelmap_levels: 2,
            submap_voxelmap_scaling_factor: 2.0,
            randomsampling_rate: 1.0,
            max_implicit_loop_distance: 100.0,
            min_implicit_loop_overlap: 0.1,
            use_isam2_dogleg: false,
            isam2_relinearize_skip: 1,
            isam2_relinearize_thresh: 0.1,
            init_pose_damping_scale: 1e10,
        }
    }
}

impl GlobalMappingConfig {
    /// Smoother factory settings derived from this configuration.
    pub fn smoother_settings(&self) -> SmootherSettings {
        SmootherSettings {
            enable_optimization: self.enable_optimization,
            use_dogleg: self.use_isam2_dogleg,
            relinearize_skip: self.isam2_relinearize_skip.max(1),
            relinearize_thresh: self.isam2_relinearize_thresh,
            ..SmootherSettings::default()
        }
    }

    /// Adaptive base voxel resolution from a median point range.
    pub fn base_resolution_for(&self, median_distance: f64) -> f64 {
        let span = self.submap_voxel_resolution_dmax - self.submap_voxel_resolution_dmin;
        let p = if span > 0.0 {
            ((median_distance - self.submap_voxel_resolution_dmin) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.submap_voxel_resolution
            + p * (self.submap_voxel_resolution_max - self.submap_voxel_resolution)
    }
}
