//! # Apex Mapper
//!
//! Global mapping backend for LiDAR-IMU SLAM. The crate accepts a stream of
//! locally-estimated submaps from a front-end odometry estimator and fuses
//! them into a globally consistent pose graph through incremental nonlinear
//! optimization.
//!
//! ## Features
//!
//! - **Incremental pose-graph smoothing**: submaps enter the graph one at a
//!   time; each insertion performs exactly one smoother update
//! - **Implicit loop closure**: spatial proximity and voxel-map overlap
//!   discover loop constraints without place recognition
//! - **Multi-resolution Gaussian voxel maps**: adaptive base resolution
//!   derived from the median scan range
//! - **IMU chains**: preintegrated inertial constraints between submap
//!   endpoints, with a zero-velocity fallback when samples are sparse
//! - **Damping-based recovery**: ill-conditioned linearizations are repaired
//!   by rebuilding the smoother with a damping factor on the offending
//!   variable
//! - **Persistence**: the serializable subgraph plus matching-cost factor
//!   descriptors round-trip through disk; partially corrupted state is
//!   repaired on reload
//!
//! ## Entry point
//!
//! [`GlobalMapping`] is the backend facade. Feed it IMU samples and submaps,
//! periodically call [`GlobalMapping::find_overlapping_submaps`], and read
//! the refined submap poses back out.

pub mod core;
pub mod error;
pub mod factors;
pub mod imu;
pub mod linalg;
pub mod logger;
pub mod mapping;
pub mod pointcloud;
pub mod se3;
pub mod smoother;
pub mod submap;

pub use crate::core::key::Key;
pub use crate::core::values::{Values, VariableValue};
pub use error::{ApexMapperError, ApexMapperResult};
pub use factors::Factor;
pub use logger::{init_logger, init_logger_with_level};
pub use mapping::config::{BetweenRegistration, GlobalMappingConfig, RegistrationErrorKind};
pub use mapping::global_mapping::GlobalMapping;
pub use se3::SE3;
pub use submap::{OdomFrame, Submap};
