//! Linear damping factor.
//!
//! Adds isotropic information on a variable's tangent space without pulling
//! the estimate anywhere: the residual is identically zero and the Jacobian
//! is `sqrt(scale) * I`, so the factor contributes `scale * I` to the Hessian
//! around the current linearization point. Used to anchor `X(0)` and to
//! regularize variables reported by an indeterminate linear system.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::{FactorError, FactorResult, Linearization};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDampingFactor {
    pub key: Key,
    pub dim: usize,
    pub scale: f64,
}

impl LinearDampingFactor {
    pub fn new(key: Key, dim: usize, scale: f64) -> Self {
        Self { key, dim, scale }
    }

    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        let value = values
            .get(&self.key)
            .ok_or(FactorError::MissingValue(self.key))?;
        let dim = self.dim.min(value.dim());

        let residual = DVector::zeros(dim);
        let jacobians = compute_jacobian.then(|| {
            vec![DMatrix::identity(dim, value.dim()) * self.scale.sqrt()]
        });

        Ok(Linearization {
            keys: vec![self.key],
            residual,
            jacobians,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se3::SE3;

    #[test]
    fn test_damping_zero_residual_scaled_jacobian() {
        let mut values = Values::new();
        values.insert_pose(Key::X(0), SE3::identity());

        let factor = LinearDampingFactor::new(Key::X(0), 6, 1e4);
        let lin = factor.linearize(&values, true).unwrap();

        assert_eq!(lin.residual.len(), 6);
        assert_eq!(lin.residual.norm(), 0.0);
        let jac = &lin.jacobians.unwrap()[0];
        approx::assert_relative_eq!(jac[(0, 0)], 100.0, epsilon = 1e-9);
        approx::assert_relative_eq!(jac[(0, 1)], 0.0);
    }
}
