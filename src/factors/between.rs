//! Relative (between) factors on poses, biases, and velocities.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::{bias_at, pose_at, velocity_at, FactorResult, Linearization, NoiseModel};
use crate::imu::ImuBias;
use crate::se3::SE3;

/// Relative pose constraint between two SE(3) variables.
///
/// Residual: `r = Log(measured^-1 * (X1^-1 * X2))`, with right-perturbation
/// Jacobians chained through the adjoint of the relative pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseBetweenFactor {
    pub key1: Key,
    pub key2: Key,
    pub measured: SE3,
    pub noise: NoiseModel,
}

impl PoseBetweenFactor {
    pub fn new(key1: Key, key2: Key, measured: SE3, noise: NoiseModel) -> Self {
        Self { key1, key2, measured, noise }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let pose1 = pose_at(values, self.key1)?;
        let pose2 = pose_at(values, self.key2)?;

        let delta = pose1.delta_to(&pose2);
        let xi = self.measured.delta_to(&delta).log();

        let mut residual = DVector::from_column_slice(xi.as_slice());
        let mut jacobians = compute_jacobian.then(|| {
            let jr_inv = SE3::right_jacobian_inv(&xi);
            let j2 = jr_inv;
            let j1 = -jr_inv * delta.inverse().adjoint();

            let mut jac1 = DMatrix::zeros(6, 6);
            jac1.copy_from(&j1);
            let mut jac2 = DMatrix::zeros(6, 6);
            jac2.copy_from(&j2);
            vec![jac1, jac2]
        });

        self.noise.whiten(&mut residual, jacobians.as_mut())?;
        Ok(Linearization {
            keys: vec![self.key1, self.key2],
            residual,
            jacobians,
        })
    }
}

/// Relative constraint between two IMU biases (usually zero expected change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasBetweenFactor {
    pub key1: Key,
    pub key2: Key,
    pub measured: ImuBias,
    pub noise: NoiseModel,
}

impl BiasBetweenFactor {
    pub fn new(key1: Key, key2: Key, measured: ImuBias, noise: NoiseModel) -> Self {
        Self { key1, key2, measured, noise }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let b1 = bias_at(values, self.key1)?;
        let b2 = bias_at(values, self.key2)?;
        let diff = (b2.to_vector() - b1.to_vector()) - self.measured.to_vector();

        let mut residual = DVector::from_column_slice(diff.as_slice());
        let mut jacobians =
            compute_jacobian.then(|| vec![-DMatrix::identity(6, 6), DMatrix::identity(6, 6)]);

        self.noise.whiten(&mut residual, jacobians.as_mut())?;
        Ok(Linearization {
            keys: vec![self.key1, self.key2],
            residual,
            jacobians,
        })
    }
}

/// Relative constraint between two velocity variables.
///
/// With a zero measurement this is the low-precision fallback that stands in
/// for an IMU factor when too few samples span the interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityBetweenFactor {
    pub key1: Key,
    pub key2: Key,
    pub measured: Vector3<f64>,
    pub noise: NoiseModel,
}

impl VelocityBetweenFactor {
    pub fn new(key1: Key, key2: Key, measured: Vector3<f64>, noise: NoiseModel) -> Self {
        Self { key1, key2, measured, noise }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let v1 = velocity_at(values, self.key1)?;
        let v2 = velocity_at(values, self.key2)?;
        let diff = (v2 - v1) - self.measured;

        let mut residual = DVector::from_column_slice(diff.as_slice());
        let mut jacobians =
            compute_jacobian.then(|| vec![-DMatrix::identity(3, 3), DMatrix::identity(3, 3)]);

        self.noise.whiten(&mut residual, jacobians.as_mut())?;
        Ok(Linearization {
            keys: vec![self.key1, self.key2],
            residual,
            jacobians,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector6;

    #[test]
    fn test_pose_between_zero_residual() {
        let mut values = Values::new();
        values.insert_pose(Key::X(0), SE3::identity());
        values.insert_pose(Key::X(1), SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));

        let factor = PoseBetweenFactor::new(
            Key::X(0),
            Key::X(1),
            SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)),
            NoiseModel::isotropic(6, 1.0),
        );
        let lin = factor.linearize(&values, true).unwrap();
        assert_relative_eq!(lin.residual.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_between_jacobian_numeric() {
        let mut values = Values::new();
        let pose1 = SE3::exp(&Vector6::new(0.2, -0.1, 0.3, 0.05, -0.02, 0.1));
        let pose2 = SE3::exp(&Vector6::new(1.1, 0.2, -0.4, -0.03, 0.08, -0.05));
        values.insert_pose(Key::X(0), pose1);
        values.insert_pose(Key::X(1), pose2);

        let factor = PoseBetweenFactor::new(
            Key::X(0),
            Key::X(1),
            pose1.delta_to(&pose2),
            NoiseModel::isotropic(6, 1.0),
        );
        let lin = factor.linearize(&values, true).unwrap();
        let jacs = lin.jacobians.unwrap();

        // Numeric differentiation against each variable
        let eps = 1e-6;
        for (var_idx, key) in [Key::X(0), Key::X(1)].iter().enumerate() {
            for col in 0..6 {
                let mut perturbed = values.clone();
                let mut xi = [0.0; 6];
                xi[col] = eps;
                let base = perturbed.pose(key).unwrap();
                perturbed.insert_pose(*key, base.retract(&Vector6::from_row_slice(&xi)));

                let lin_p = factor.linearize(&perturbed, false).unwrap();
                for row in 0..6 {
                    let numeric = (lin_p.residual[row] - lin.residual[row]) / eps;
                    assert_relative_eq!(jacs[var_idx][(row, col)], numeric, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_velocity_between_fallback_pulls_together() {
        let mut values = Values::new();
        values.insert_velocity(Key::V(1), Vector3::new(1.0, 0.0, 0.0));
        values.insert_velocity(Key::V(2), Vector3::new(3.0, 0.0, 0.0));

        let factor = VelocityBetweenFactor::new(
            Key::V(1),
            Key::V(2),
            Vector3::zeros(),
            NoiseModel::isotropic(3, 1.0),
        );
        let lin = factor.linearize(&values, true).unwrap();
        assert_relative_eq!(lin.residual[0], 2.0, epsilon = 1e-12);
        let jacs = lin.jacobians.unwrap();
        assert_relative_eq!(jacs[0][(0, 0)], -1.0);
        assert_relative_eq!(jacs[1][(0, 0)], 1.0);
    }

    #[test]
    fn test_bias_between_zero_change() {
        let mut values = Values::new();
        let b = ImuBias::new(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.01, 0.0));
        values.insert_bias(Key::B(1), b);
        values.insert_bias(Key::B(2), b);

        let factor = BiasBetweenFactor::new(
            Key::B(1),
            Key::B(2),
            ImuBias::zero(),
            NoiseModel::isotropic(6, 1e6),
        );
        let lin = factor.linearize(&values, false).unwrap();
        assert_relative_eq!(lin.residual.norm(), 0.0, epsilon = 1e-12);
    }
}
