//! Variable namespace of the mapping graph.
//!
//! Four symbol families, each indexed by a non-negative integer:
//!
//! - `X(k)`: pose of submap `k`'s origin in the world frame
//! - `E(2k)` / `E(2k+1)`: IMU endpoint poses at the left/right end of submap `k`
//! - `V(..)`: world-frame IMU velocities at those endpoints
//! - `B(..)`: IMU biases at those endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed variable key. Renders as `x0`, `e3`, `v4`, `b5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    /// Submap origin pose in the world frame.
    X(u64),
    /// IMU endpoint pose.
    E(u64),
    /// World-frame IMU velocity.
    V(u64),
    /// IMU bias.
    B(u64),
}

impl Key {
    /// The integer index within the symbol family.
    pub fn index(&self) -> u64 {
        match *self {
            Key::X(i) | Key::E(i) | Key::V(i) | Key::B(i) => i,
        }
    }

    /// Whether this key belongs to one of the IMU endpoint families.
    pub fn is_imu_endpoint(&self) -> bool {
        matches!(self, Key::E(_) | Key::V(_) | Key::B(_))
    }

    /// The submap pose an IMU endpoint variable hangs off.
    ///
    /// Endpoint index `2k` or `2k+1` belongs to submap `k`; pose keys map to
    /// themselves. Used to redirect indeterminate-system reports onto a pose.
    pub fn owning_pose(&self) -> Key {
        match *self {
            Key::X(i) => Key::X(i),
            Key::E(i) | Key::V(i) | Key::B(i) => Key::X(i / 2),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Key::X(i) => write!(f, "x{i}"),
            Key::E(i) => write!(f, "e{i}"),
            Key::V(i) => write!(f, "v{i}"),
            Key::B(i) => write!(f, "b{i}"),
        }
    }
}
