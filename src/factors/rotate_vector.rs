//! Constraint tying a world-frame velocity to its body-frame observation.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::{pose_at, velocity_at, FactorResult, Linearization, NoiseModel};
use crate::se3::skew;

/// Residual: `r = R(pose) * local - v_world`.
///
/// Links a submap pose to an endpoint velocity variable through the local
/// (origin-frame) velocity the front-end estimated for that endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateVectorFactor {
    pub pose_key: Key,
    pub vel_key: Key,
    pub local: Vector3<f64>,
    pub noise: NoiseModel,
}

impl RotateVectorFactor {
    pub fn new(pose_key: Key, vel_key: Key, local: Vector3<f64>, noise: NoiseModel) -> Self {
        Self { pose_key, vel_key, local, noise }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let pose = pose_at(values, self.pose_key)?;
        let vel = velocity_at(values, self.vel_key)?;

        let rotation = pose.rotation_matrix();
        let rotated = rotation * self.local;
        let diff = rotated - vel;

        let mut residual = DVector::from_column_slice(diff.as_slice());
        let mut jacobians = compute_jacobian.then(|| {
            // Right perturbation on the pose only touches the rotation block.
            let mut jac_pose = DMatrix::zeros(3, 6);
            let d_theta = -rotation * skew(&self.local);
            jac_pose.view_mut((0, 3), (3, 3)).copy_from(&d_theta);
            let jac_vel = -DMatrix::identity(3, 3);
            vec![jac_pose, jac_vel]
        });

        self.noise.whiten(&mut residual, jacobians.as_mut())?;
        Ok(Linearization {
            keys: vec![self.pose_key, self.vel_key],
            residual,
            jacobians,
        })
    }
}
