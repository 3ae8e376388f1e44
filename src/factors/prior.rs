//! Unary prior factors on poses and IMU biases.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::{bias_at, pose_at, FactorResult, Linearization, NoiseModel};
use crate::imu::ImuBias;
use crate::se3::SE3;

/// Prior on an SE(3) pose: `r = Log(measured^-1 * X)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePriorFactor {
    pub key: Key,
    pub measured: SE3,
    pub noise: NoiseModel,
}

impl PosePriorFactor {
    pub fn new(key: Key, measured: SE3, noise: NoiseModel) -> Self {
        Self { key, measured, noise }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let pose = pose_at(values, self.key)?;
        let error = self.measured.delta_to(&pose);
        let xi = error.log();

        let mut residual = DVector::from_column_slice(xi.as_slice());
        let mut jacobians = compute_jacobian.then(|| {
            let jr_inv = SE3::right_jacobian_inv(&xi);
            let mut jac = DMatrix::zeros(6, 6);
            jac.copy_from(&jr_inv);
            vec![jac]
        });

        self.noise.whiten(&mut residual, jacobians.as_mut())?;
        Ok(Linearization {
            keys: vec![self.key],
            residual,
            jacobians,
        })
    }
}

/// Prior on an IMU bias: `r = b - measured`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasPriorFactor {
    pub key: Key,
    pub measured: ImuBias,
    pub noise: NoiseModel,
}

impl BiasPriorFactor {
    pub fn new(key: Key, measured: ImuBias, noise: NoiseModel) -> Self {
        Self { key, measured, noise }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let bias = bias_at(values, self.key)?;
        let diff = bias.to_vector() - self.measured.to_vector();

        let mut residual = DVector::from_column_slice(diff.as_slice());
        let mut jacobians = compute_jacobian.then(|| vec![DMatrix::identity(6, 6)]);

        self.noise.whiten(&mut residual, jacobians.as_mut())?;
        Ok(Linearization {
            keys: vec![self.key],
            residual,
            jacobians,
        })
    }
}
