//! Factor implementations for the mapping graph.
//!
//! Factors represent measurements or relationships between variables in the
//! factor graph. Each factor computes a whitened residual (error) vector and,
//! on request, its Jacobians with respect to the connected variables.
//!
//! The smoother accepts an open set of factor kinds: between, prior,
//! damping, preintegrated IMU, rotate-vector, and point-cloud registration
//! costs. They are modeled as a tagged [`Factor`] variant whose
//! [`Factor::linearize`] evaluates the active kind around a set of values.
//! Registration factors hold shared references to voxel maps and clouds that
//! live in the submap index; those factors are reconstructed from compact
//! descriptors on reload instead of being serialized.

use nalgebra::{DMatrix, DVector, Matrix6};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod between;
pub mod damping;
pub mod imu_chain;
pub mod prior;
pub mod registration;
pub mod rotate_vector;

pub use between::{BiasBetweenFactor, PoseBetweenFactor, VelocityBetweenFactor};
pub use damping::LinearDampingFactor;
pub use imu_chain::ImuChainFactor;
pub use prior::{BiasPriorFactor, PosePriorFactor};
pub use registration::{GicpFactor, VgicpFactor};
pub use rotate_vector::RotateVectorFactor;

use crate::core::key::Key;
use crate::core::values::Values;
use crate::imu::{ImuBias, PreintegratedImu};
use crate::se3::SE3;

/// Factor-specific error types.
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// A connected variable is absent from the values (or has the wrong kind)
    #[error("value for variable {0} is missing or has the wrong kind")]
    MissingValue(Key),

    /// Noise model dimension does not match the residual dimension
    #[error("noise dimension {noise} does not match residual dimension {residual}")]
    NoiseDimension { noise: usize, residual: usize },
}

/// Result type for factor operations.
pub type FactorResult<T> = Result<T, FactorError>;

/// Gaussian noise model applied by whitening residuals and Jacobians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoiseModel {
    /// Isotropic precision on every residual component.
    Isotropic { dim: usize, precision: f64 },
    /// Full 6x6 information matrix (e.g. derived from a registration Hessian).
    Information(Matrix6<f64>),
}

impl NoiseModel {
    pub fn isotropic(dim: usize, precision: f64) -> Self {
        NoiseModel::Isotropic { dim, precision }
    }

    pub fn information(info: Matrix6<f64>) -> Self {
        NoiseModel::Information(info)
    }

    pub fn dim(&self) -> usize {
        match self {
            NoiseModel::Isotropic { dim, .. } => *dim,
            NoiseModel::Information(_) => 6,
        }
    }

    /// Whiten a residual and (optionally) its Jacobians in place so that the
    /// resulting least-squares term has unit covariance.
    pub fn whiten(
        &self,
        residual: &mut DVector<f64>,
        mut jacobians: Option<&mut Vec<DMatrix<f64>>>,
    ) -> FactorResult<()> {
        if self.dim() != residual.len() {
            return Err(FactorError::NoiseDimension {
                noise: self.dim(),
                residual: residual.len(),
            });
        }

        match self {
            NoiseModel::Isotropic { precision, .. } => {
                let w = precision.sqrt();
                *residual *= w;
                if let Some(jacs) = jacobians.as_deref_mut() {
                    for j in jacs.iter_mut() {
                        *j *= w;
                    }
                }
            }
            NoiseModel::Information(info) => {
                // info = L L^T; whitening with L^T keeps r^T info r = ||L^T r||^2
                let sqrt_info = match info.cholesky() {
                    Some(chol) => chol.l().transpose(),
                    None => Matrix6::from_diagonal(&info.diagonal().map(|d| d.max(0.0).sqrt())),
                };
                let sqrt_info = DMatrix::from_fn(6, 6, |r, c| sqrt_info[(r, c)]);
                let whitened = &sqrt_info * &*residual;
                residual.copy_from(&whitened);
                if let Some(jacs) = jacobians.as_deref_mut() {
                    for j in jacs.iter_mut() {
                        *j = &sqrt_info * &*j;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Kind tag persisted for factors that cannot be serialized directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchingCostKind {
    Gicp,
    Vgicp,
    VgicpGpu,
}

impl std::fmt::Display for MatchingCostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchingCostKind::Gicp => write!(f, "gicp"),
            MatchingCostKind::Vgicp => write!(f, "vgicp"),
            MatchingCostKind::VgicpGpu => write!(f, "vgicp_gpu"),
        }
    }
}

impl std::str::FromStr for MatchingCostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gicp" => Ok(MatchingCostKind::Gicp),
            "vgicp" => Ok(MatchingCostKind::Vgicp),
            "vgicp_gpu" => Ok(MatchingCostKind::VgicpGpu),
            other => Err(format!("unknown matching cost kind: {other}")),
        }
    }
}

/// Whitened linearization of a factor around a set of values.
///
/// `jacobians[i]` is the `residual.len() x tangent_dim(keys[i])` block for
/// the i-th connected variable.
pub struct Linearization {
    pub keys: Vec<Key>,
    pub residual: DVector<f64>,
    pub jacobians: Option<Vec<DMatrix<f64>>>,
}

/// A term in the nonlinear least-squares objective.
#[derive(Debug, Clone)]
pub enum Factor {
    LinearDamping(LinearDampingFactor),
    PosePrior(PosePriorFactor),
    PoseBetween(PoseBetweenFactor),
    BiasPrior(BiasPriorFactor),
    BiasBetween(BiasBetweenFactor),
    VelocityBetween(VelocityBetweenFactor),
    RotateVector(RotateVectorFactor),
    ImuChain(ImuChainFactor),
    Gicp(GicpFactor),
    Vgicp(VgicpFactor),
}

impl Factor {
    pub fn linear_damping(key: Key, dim: usize, scale: f64) -> Self {
        Factor::LinearDamping(LinearDampingFactor::new(key, dim, scale))
    }

    pub fn pose_prior(key: Key, pose: SE3, noise: NoiseModel) -> Self {
        Factor::PosePrior(PosePriorFactor::new(key, pose, noise))
    }

    pub fn pose_between(key1: Key, key2: Key, measured: SE3, noise: NoiseModel) -> Self {
        Factor::PoseBetween(PoseBetweenFactor::new(key1, key2, measured, noise))
    }

    pub fn bias_prior(key: Key, bias: ImuBias, noise: NoiseModel) -> Self {
        Factor::BiasPrior(BiasPriorFactor::new(key, bias, noise))
    }

    pub fn bias_between(key1: Key, key2: Key, measured: ImuBias, noise: NoiseModel) -> Self {
        Factor::BiasBetween(BiasBetweenFactor::new(key1, key2, measured, noise))
    }

    pub fn velocity_between(
        key1: Key,
        key2: Key,
        measured: nalgebra::Vector3<f64>,
        noise: NoiseModel,
    ) -> Self {
        Factor::VelocityBetween(VelocityBetweenFactor::new(key1, key2, measured, noise))
    }

    pub fn rotate_vector(
        pose_key: Key,
        vel_key: Key,
        local: nalgebra::Vector3<f64>,
        noise: NoiseModel,
    ) -> Self {
        Factor::RotateVector(RotateVectorFactor::new(pose_key, vel_key, local, noise))
    }

    pub fn imu_chain(
        pose_i: Key,
        vel_i: Key,
        pose_j: Key,
        vel_j: Key,
        bias_i: Key,
        preint: PreintegratedImu,
    ) -> Self {
        Factor::ImuChain(ImuChainFactor::new(pose_i, vel_i, pose_j, vel_j, bias_i, preint))
    }

    /// Keys of the connected variables, in residual-block order.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::LinearDamping(f) => vec![f.key],
            Factor::PosePrior(f) => vec![f.key],
            Factor::PoseBetween(f) => vec![f.key1, f.key2],
            Factor::BiasPrior(f) => vec![f.key],
            Factor::BiasBetween(f) => vec![f.key1, f.key2],
            Factor::VelocityBetween(f) => vec![f.key1, f.key2],
            Factor::RotateVector(f) => vec![f.pose_key, f.vel_key],
            Factor::ImuChain(f) => vec![f.pose_i, f.vel_i, f.pose_j, f.vel_j, f.bias_i],
            Factor::Gicp(f) => vec![f.key1, f.key2],
            Factor::Vgicp(f) => vec![f.key1, f.key2],
        }
    }

    /// Compute the whitened residual and optionally the Jacobians at the
    /// given values.
    pub fn linearize(&self, values: &Values, compute_jacobian: bool) -> FactorResult<Linearization> {
        match self {
            Factor::LinearDamping(f) => f.linearize(values, compute_jacobian),
            Factor::PosePrior(f) => f.linearize(values, compute_jacobian),
            Factor::PoseBetween(f) => f.linearize(values, compute_jacobian),
            Factor::BiasPrior(f) => f.linearize(values, compute_jacobian),
            Factor::BiasBetween(f) => f.linearize(values, compute_jacobian),
            Factor::VelocityBetween(f) => f.linearize(values, compute_jacobian),
            Factor::RotateVector(f) => f.linearize(values, compute_jacobian),
            Factor::ImuChain(f) => f.linearize(values, compute_jacobian),
            Factor::Gicp(f) => f.linearize(values, compute_jacobian),
            Factor::Vgicp(f) => f.linearize(values, compute_jacobian),
        }
    }

    /// Half the squared whitened residual norm.
    pub fn error(&self, values: &Values) -> FactorResult<f64> {
        let lin = self.linearize(values, false)?;
        Ok(0.5 * lin.residual.norm_squared())
    }

    /// Whether this factor's state is self-contained enough to serialize.
    /// Registration costs reference external voxel maps / clouds and are
    /// persisted as descriptors instead.
    pub fn serializable(&self) -> bool {
        !matches!(self, Factor::Gicp(_) | Factor::Vgicp(_))
    }

    /// Descriptor `(kind, i, j)` for matching-cost factors between submap
    /// poses; `None` for serializable factors.
    pub fn matching_cost_descriptor(&self) -> Option<(MatchingCostKind, u64, u64)> {
        let kind = match self {
            Factor::Gicp(_) => MatchingCostKind::Gicp,
            Factor::Vgicp(f) => {
                if f.gpu {
                    MatchingCostKind::VgicpGpu
                } else {
                    MatchingCostKind::Vgicp
                }
            }
            _ => return None,
        };
        let keys = self.keys();
        match (keys[0], keys[1]) {
            (Key::X(i), Key::X(j)) => Some((kind, i, j)),
            _ => None,
        }
    }
}

/// Fetch helpers shared by the factor implementations.
pub(crate) fn pose_at(values: &Values, key: Key) -> FactorResult<SE3> {
    values.pose(&key).ok_or(FactorError::MissingValue(key))
}

pub(crate) fn velocity_at(values: &Values, key: Key) -> FactorResult<nalgebra::Vector3<f64>> {
    values.velocity(&key).ok_or(FactorError::MissingValue(key))
}

pub(crate) fn bias_at(values: &Values, key: Key) -> FactorResult<ImuBias> {
    values.bias(&key).ok_or(FactorError::MissingValue(key))
}
