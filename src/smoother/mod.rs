//! Incremental smoothing over the mapping factor graph.
//!
//! The backend drives the smoother through a narrow trait so the instance
//! can be rebuilt from its factors and values after an indeterminate-system
//! failure, and swapped for a no-op implementation when optimization is
//! disabled. [`SmootherSettings`] is the factory boundary.

pub mod incremental;
pub mod noop;

pub use incremental::IncrementalSmoother;
pub use noop::NoopSmoother;

use thiserror::Error;
use tracing::error;

use crate::core::graph::FactorGraph;
use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::FactorError;
use crate::linalg::LinAlgError;

/// Smoother error types.
#[derive(Debug, Clone, Error)]
pub enum SmootherError {
    /// The linearized system is rank-deficient or non-positive-definite.
    /// Carries the variable nearest to the unconstrained direction.
    #[error("indeterminate linear system near variable {nearby_key}")]
    IndeterminateSystem { nearby_key: Key },

    /// A factor could not be linearized
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Linear algebra failure other than singularity
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),
}

impl SmootherError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for smoother operations.
pub type SmootherResult<T> = Result<T, SmootherError>;

/// Outcome of one smoother update.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Inner iterations performed by the step method
    pub iterations: usize,
    /// Cost before the update
    pub initial_cost: f64,
    /// Cost after the update
    pub final_cost: f64,
    /// Whether the inner loop reached its convergence tolerance
    pub converged: bool,
}

impl UpdateResult {
    pub(crate) fn trivial() -> Self {
        Self {
            iterations: 0,
            initial_cost: 0.0,
            final_cost: 0.0,
            converged: true,
        }
    }
}

/// Step method used inside the smoother.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMethod {
    #[default]
    LevenbergMarquardt,
    DogLeg,
}

/// Interface the mapping backend drives.
///
/// The instance cannot be reset in place; recovery rebuilds a fresh smoother
/// through [`SmootherSettings::build`] and replays [`Smoother::factors`] and
/// [`Smoother::calculate_estimate`].
pub trait Smoother: Send {
    /// Insert new values and factors, then run one relinearize-and-solve
    /// cycle. Submitting empty inputs re-optimizes the existing graph.
    fn update(&mut self, new_factors: FactorGraph, new_values: Values)
        -> SmootherResult<UpdateResult>;

    /// Current estimate of all variables.
    fn calculate_estimate(&self) -> &Values;

    /// Full factor set accumulated so far.
    fn factors(&self) -> &FactorGraph;

    fn value_exists(&self, key: &Key) -> bool;

    fn is_empty(&self) -> bool;
}

/// Factory configuration for smoother instances.
#[derive(Debug, Clone)]
pub struct SmootherSettings {
    /// When false, build a no-op smoother that stores values and factors
    /// without solving.
    pub enable_optimization: bool,
    /// Dog-leg trust-region steps instead of Levenberg-Marquardt.
    pub use_dogleg: bool,
    /// Updates between full relinearize-and-solve cycles when no new inputs
    /// arrive.
    pub relinearize_skip: usize,
    /// Per-variable update norm above which another relinearization pass is
    /// forced.
    pub relinearize_thresh: f64,
    /// Inner iteration cap per update.
    pub max_iterations: usize,
    /// Levenberg-Marquardt damping applied to the first attempted step of
    /// each iteration. Zero starts from the pure Gauss-Newton step.
    pub initial_lambda: f64,
}

impl Default for SmootherSettings {
    fn default() -> Self {
        Self {
            enable_optimization: true,
            use_dogleg: false,
            relinearize_skip: 1,
            relinearize_thresh: 0.1,
            max_iterations: 10,
            initial_lambda: 0.0,
        }
    }
}

impl SmootherSettings {
    /// Build a fresh smoother instance.
    pub fn build(&self) -> Box<dyn Smoother> {
        if self.enable_optimization {
            Box::new(IncrementalSmoother::new(self.clone()))
        } else {
            Box::new(NoopSmoother::new())
        }
    }
}
