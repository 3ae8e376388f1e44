//! Preintegrated IMU factor spanning two submap endpoints.
//!
//! Connects `{E(2k-1), V(2k-1), B(2k-1)}` of submap `k-1` to
//! `{E(2k), V(2k)}` of submap `k` through the inertial measurements
//! integrated between the two endpoint timestamps.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::{bias_at, pose_at, velocity_at, FactorResult, Linearization};
use crate::imu::{PreintegratedImu, GRAVITY};
use crate::se3::skew;

/// 9-dimensional residual `[r_R, r_v, r_p]` between preintegrated deltas and
/// the endpoint states, whitened by the accumulated measurement variances.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ImuChainFactor {
    pub pose_i: Key,
    pub vel_i: Key,
    pub pose_j: Key,
    pub vel_j: Key,
    pub bias_i: Key,
    pub preint: PreintegratedImu,
}

impl ImuChainFactor {
    pub fn new(
        pose_i: Key,
        vel_i: Key,
        pose_j: Key,
        vel_j: Key,
        bias_i: Key,
        preint: PreintegratedImu,
    ) -> Self {
        Self { pose_i, vel_i, pose_j, vel_j, bias_i, preint }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let pose_i = pose_at(values, self.pose_i)?;
        let vel_i = velocity_at(values, self.vel_i)?;
        let pose_j = pose_at(values, self.pose_j)?;
        let vel_j = velocity_at(values, self.vel_j)?;
        let bias = bias_at(values, self.bias_i)?;

        let (delta_r, delta_v, delta_p) = self.preint.corrected(&bias);
        let dt = self.preint.delta_t;
        let gravity = Vector3::new(0.0, 0.0, -GRAVITY);

        let r_i = pose_i.rotation_matrix();
        let r_i_t = r_i.transpose();
        let p_i = pose_i.translation();
        let p_j = pose_j.translation();

        // Rotation residual
        let rot_err = delta_r.inverse() * (pose_i.rotation().inverse() * pose_j.rotation());
        let r_rot = rot_err.scaled_axis();

        // Velocity residual
        let u = vel_j - vel_i - gravity * dt;
        let r_vel = r_i_t * u - delta_v;

        // Position residual
        let w = p_j - p_i - vel_i * dt - 0.5 * gravity * dt * dt;
        let r_pos = r_i_t * w - delta_p;

        let mut residual = DVector::zeros(9);
        residual.fixed_rows_mut::<3>(0).copy_from(&r_rot);
        residual.fixed_rows_mut::<3>(3).copy_from(&r_vel);
        residual.fixed_rows_mut::<3>(6).copy_from(&r_pos);

        // Whitening weights from the accumulated white-noise variances
        let w_rot = 1.0 / self.preint.var_r.sqrt();
        let w_vel = 1.0 / self.preint.var_v.sqrt();
        let w_pos = 1.0 / self.preint.var_p.sqrt();
        let weights = [w_rot, w_rot, w_rot, w_vel, w_vel, w_vel, w_pos, w_pos, w_pos];
        for (row, w) in weights.iter().enumerate() {
            residual[row] *= w;
        }

        let jacobians = compute_jacobian.then(|| {
            let jr_inv = so3_right_jacobian_inv(&r_rot);
            let r_j = pose_j.rotation_matrix();

            let mut jac_pose_i = DMatrix::zeros(9, 6);
            let mut jac_vel_i = DMatrix::zeros(9, 3);
            let mut jac_pose_j = DMatrix::zeros(9, 6);
            let mut jac_vel_j = DMatrix::zeros(9, 3);
            let mut jac_bias = DMatrix::zeros(9, 6);

            // Rotation rows
            let d_rot_theta_i = -jr_inv * (r_j.transpose() * r_i);
            jac_pose_i.view_mut((0, 3), (3, 3)).copy_from(&d_rot_theta_i);
            jac_pose_j.view_mut((0, 3), (3, 3)).copy_from(&jr_inv);
            jac_bias
                .view_mut((0, 3), (3, 3))
                .copy_from(&(-self.preint.dr_dbg));

            // Velocity rows
            jac_pose_i
                .view_mut((3, 3), (3, 3))
                .copy_from(&skew(&(r_i_t * u)));
            jac_vel_i.view_mut((3, 0), (3, 3)).copy_from(&(-r_i_t));
            jac_vel_j.view_mut((3, 0), (3, 3)).copy_from(&r_i_t);
            jac_bias
                .view_mut((3, 0), (3, 3))
                .copy_from(&(-self.preint.dv_dba));
            jac_bias
                .view_mut((3, 3), (3, 3))
                .copy_from(&(-self.preint.dv_dbg));

            // Position rows
            jac_pose_i
                .view_mut((6, 0), (3, 3))
                .copy_from(&(-nalgebra::Matrix3::identity()));
            jac_pose_i
                .view_mut((6, 3), (3, 3))
                .copy_from(&skew(&(r_i_t * w)));
            jac_pose_j
                .view_mut((6, 0), (3, 3))
                .copy_from(&(r_i_t * r_j));
            jac_vel_i
                .view_mut((6, 0), (3, 3))
                .copy_from(&(-r_i_t * dt));
            jac_bias
                .view_mut((6, 0), (3, 3))
                .copy_from(&(-self.preint.dp_dba));
            jac_bias
                .view_mut((6, 3), (3, 3))
                .copy_from(&(-self.preint.dp_dbg));

            let mut jacs = vec![jac_pose_i, jac_vel_i, jac_pose_j, jac_vel_j, jac_bias];
            for jac in jacs.iter_mut() {
                for (row, w) in weights.iter().enumerate() {
                    for col in 0..jac.ncols() {
                        jac[(row, col)] *= w;
                    }
                }
            }
            jacs
        });

        Ok(Linearization {
            keys: vec![self.pose_i, self.vel_i, self.pose_j, self.vel_j, self.bias_i],
            residual,
            jacobians,
        })
    }
}

fn so3_right_jacobian_inv(theta: &Vector3<f64>) -> nalgebra::Matrix3<f64> {
    let angle = theta.norm();
    let hat = skew(theta);
    if angle < 1e-9 {
        return nalgebra::Matrix3::identity() + 0.5 * hat;
    }
    let half = 0.5 * angle;
    let cot = half.cos() / half.sin();
    nalgebra::Matrix3::identity() + 0.5 * hat
        + ((1.0 - half * cot) / (angle * angle)) * hat * hat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{ImuBias, ImuIntegration};
    use crate::se3::SE3;
    use approx::assert_relative_eq;

    fn keys() -> (Key, Key, Key, Key, Key) {
        (Key::E(1), Key::V(1), Key::E(2), Key::V(2), Key::B(1))
    }

    #[test]
    fn test_stationary_chain_zero_residual() {
        let mut imu = ImuIntegration::new();
        for i in 0..=100 {
            imu.insert_imu(
                i as f64 * 0.01,
                Vector3::new(0.0, 0.0, GRAVITY),
                Vector3::zeros(),
            );
        }
        let (preint, n, _) = imu.integrate(0.0, 1.0, ImuBias::zero());
        assert!(n >= 2);

        let (pi, vi, pj, vj, bi) = keys();
        let mut values = Values::new();
        values.insert_pose(pi, SE3::identity());
        values.insert_velocity(vi, Vector3::zeros());
        values.insert_pose(pj, SE3::identity());
        values.insert_velocity(vj, Vector3::zeros());
        values.insert_bias(bi, ImuBias::zero());

        let factor = ImuChainFactor::new(pi, vi, pj, vj, bi, preint);
        let lin = factor.linearize(&values, true).unwrap();
        // Whitened residual stays tiny for a perfectly consistent chain.
        assert_relative_eq!(lin.residual.norm(), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_velocity_mismatch_raises_residual() {
        let mut imu = ImuIntegration::new();
        for i in 0..=100 {
            imu.insert_imu(
                i as f64 * 0.01,
                Vector3::new(0.0, 0.0, GRAVITY),
                Vector3::zeros(),
            );
        }
        let (preint, _, _) = imu.integrate(0.0, 1.0, ImuBias::zero());

        let (pi, vi, pj, vj, bi) = keys();
        let mut values = Values::new();
        values.insert_pose(pi, SE3::identity());
        values.insert_velocity(vi, Vector3::zeros());
        values.insert_pose(pj, SE3::identity());
        values.insert_velocity(vj, Vector3::new(2.0, 0.0, 0.0));
        values.insert_bias(bi, ImuBias::zero());

        let factor = ImuChainFactor::new(pi, vi, pj, vj, bi, preint);
        let lin = factor.linearize(&values, false).unwrap();
        assert!(lin.residual.norm() > 1.0);
    }
}
