//! Incremental nonlinear smoother.
//!
//! Maintains the accumulated factor graph and a linearization point that is
//! re-adopted on every relinearize-and-solve cycle. Each update appends the
//! new values and factors, then iterates damped Gauss-Newton
//! (Levenberg-Marquardt) or dog-leg trust-region steps until the estimate
//! stops moving.
//!
//! A rank-deficient linearization surfaces as
//! [`SmootherError::IndeterminateSystem`] carrying the variable closest to
//! the unconstrained direction; the backend rebuilds a fresh instance with a
//! damping factor there and replays the graph.

use faer::sparse::Triplet;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::core::graph::FactorGraph;
use crate::core::key::Key;
use crate::core::values::Values;
use crate::linalg::{column_squared_norms, LinAlgError, SparseCholeskySolver};
use crate::smoother::{
    Smoother, SmootherError, SmootherResult, SmootherSettings, StepMethod, UpdateResult,
};

/// Linearized system assembled around the current values.
struct Assembly {
    order: Vec<Key>,
    cols: usize,
    rows: usize,
    triplets: Vec<Triplet<usize, usize, f64>>,
    residual: Vec<f64>,
}

pub struct IncrementalSmoother {
    settings: SmootherSettings,
    method: StepMethod,
    factors: FactorGraph,
    values: Values,
    solver: SparseCholeskySolver,
    update_count: usize,
}

impl IncrementalSmoother {
    pub fn new(settings: SmootherSettings) -> Self {
        let method = if settings.use_dogleg {
            StepMethod::DogLeg
        } else {
            StepMethod::LevenbergMarquardt
        };
        Self {
            settings,
            method,
            factors: FactorGraph::new(),
            values: Values::new(),
            solver: SparseCholeskySolver::new(),
            update_count: 0,
        }
    }

    fn total_cost(&self, values: &Values) -> SmootherResult<f64> {
        let mut cost = 0.0;
        for factor in self.factors.iter() {
            cost += factor.error(values)?;
        }
        Ok(cost)
    }

    fn assemble(&self, values: &Values) -> SmootherResult<Assembly> {
        let order: Vec<Key> = values.keys().copied().collect();
        let mut offsets = HashMap::new();
        let mut cols = 0;
        for key in &order {
            let dim = values.get(key).map(|v| v.dim()).unwrap_or(0);
            offsets.insert(*key, cols);
            cols += dim;
        }

        let mut triplets = Vec::new();
        let mut residual = Vec::new();
        let mut rows = 0;

        for factor in self.factors.iter() {
            let lin = factor.linearize(values, true)?;
            let jacobians = lin.jacobians.unwrap_or_default();
            let block_rows = lin.residual.len();

            for (key, jac) in lin.keys.iter().zip(jacobians.iter()) {
                let Some(&col_base) = offsets.get(key) else {
                    return Err(SmootherError::Factor(
                        crate::factors::FactorError::MissingValue(*key),
                    ));
                };
                for r in 0..jac.nrows() {
                    for c in 0..jac.ncols() {
                        let val = jac[(r, c)];
                        if val != 0.0 {
                            triplets.push(Triplet::new(rows + r, col_base + c, val));
                        }
                    }
                }
            }
            for r in 0..block_rows {
                residual.push(lin.residual[r]);
            }
            rows += block_rows;
        }

        Ok(Assembly {
            order,
            cols,
            rows,
            triplets,
            residual,
        })
    }

    /// Map the weakest column of the Jacobian back to its variable.
    fn nearby_key(&self, assembly: &Assembly) -> Key {
        let norms = column_squared_norms(&assembly.triplets, assembly.cols);
        let weakest_col = norms
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let mut offset = 0;
        for key in &assembly.order {
            let dim = self.values.get(key).map(|v| v.dim()).unwrap_or(0);
            if weakest_col < offset + dim {
                return *key;
            }
            offset += dim;
        }
        *assembly.order.first().unwrap_or(&Key::X(0))
    }

    fn solve_assembly(
        &self,
        assembly: &Assembly,
        lambda: f64,
    ) -> Result<Vec<f64>, LinAlgError> {
        self.solver.solve(
            assembly.rows,
            assembly.cols,
            &assembly.triplets,
            &assembly.residual,
            lambda,
        )
    }

    fn run_optimization(&mut self) -> SmootherResult<UpdateResult> {
        let initial_cost = self.total_cost(&self.values)?;
        let mut cost = initial_cost;
        let mut iterations = 0;
        let mut converged = false;
        let mut radius = 1.0;

        for iter in 0..self.settings.max_iterations {
            iterations = iter + 1;

            let assembly = self.assemble(&self.values)?;
            if assembly.rows == 0 || assembly.cols == 0 {
                converged = true;
                break;
            }

            // The undamped factorization doubles as the indeterminate-system
            // probe: a singular normal matrix means some tangent direction is
            // unconstrained.
            let gn_step = match self.solve_assembly(&assembly, 0.0) {
                Ok(step) => step,
                Err(LinAlgError::SingularMatrix) => {
                    let nearby_key = self.nearby_key(&assembly);
                    return Err(SmootherError::IndeterminateSystem { nearby_key }.log());
                }
                Err(e) => return Err(e.into()),
            };

            let step = match self.method {
                StepMethod::LevenbergMarquardt => {
                    self.levenberg_step(&assembly, gn_step, cost)?
                }
                StepMethod::DogLeg => self.dogleg_step(&assembly, gn_step, cost, &mut radius)?,
            };

            let Some((accepted_values, new_cost, step_norm)) = step else {
                converged = true;
                break;
            };

            trace!(iter, cost, new_cost, step_norm, "smoother iteration");
            self.values = accepted_values;

            let improvement = cost - new_cost;
            cost = new_cost;

            if step_norm < self.settings.relinearize_thresh * 1e-3
                || improvement < 1e-9 * cost.max(1.0)
            {
                converged = true;
                break;
            }
        }

        debug!(
            initial_cost,
            final_cost = cost,
            iterations,
            converged,
            "smoother update finished"
        );

        Ok(UpdateResult {
            iterations,
            initial_cost,
            final_cost: cost,
            converged,
        })
    }

    /// Try the Gauss-Newton step, escalating damping while the cost refuses
    /// to decrease. Returns the accepted values, or `None` when no step
    /// improves the cost.
    fn levenberg_step(
        &self,
        assembly: &Assembly,
        gn_step: Vec<f64>,
        cost: f64,
    ) -> SmootherResult<Option<(Values, f64, f64)>> {
        let mut lambda = self.settings.initial_lambda;
        let mut step = if lambda > 0.0 {
            match self.solve_assembly(assembly, lambda) {
                Ok(step) => step,
                Err(LinAlgError::SingularMatrix) => gn_step,
                Err(e) => return Err(e.into()),
            }
        } else {
            gn_step
        };

        loop {
            let step_norm = step.iter().map(|s| s * s).sum::<f64>().sqrt();
            let mut candidate = self.values.clone();
            candidate.retract_all(&assembly.order, &step);
            let new_cost = self.total_cost(&candidate)?;

            if new_cost <= cost + 1e-12 {
                return Ok(Some((candidate, new_cost, step_norm)));
            }

            lambda = (lambda * 10.0).max(1e-6);
            if lambda > 1e8 {
                return Ok(None);
            }
            step = match self.solve_assembly(assembly, lambda) {
                Ok(step) => step,
                Err(LinAlgError::SingularMatrix) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
        }
    }

    /// Classic dog-leg blend of the Gauss-Newton and steepest-descent steps
    /// within the current trust radius.
    fn dogleg_step(
        &self,
        assembly: &Assembly,
        gn_step: Vec<f64>,
        cost: f64,
        radius: &mut f64,
    ) -> SmootherResult<Option<(Values, f64, f64)>> {
        // g = J^T r, J g
        let mut gradient = vec![0.0; assembly.cols];
        for t in &assembly.triplets {
            gradient[t.col] += t.val * assembly.residual[t.row];
        }
        let mut jg = vec![0.0; assembly.rows];
        for t in &assembly.triplets {
            jg[t.row] += t.val * gradient[t.col];
        }
        let g_norm_sq: f64 = gradient.iter().map(|g| g * g).sum();
        let jg_norm_sq: f64 = jg.iter().map(|v| v * v).sum();
        let alpha = if jg_norm_sq > 0.0 { g_norm_sq / jg_norm_sq } else { 0.0 };
        let cauchy: Vec<f64> = gradient.iter().map(|g| -alpha * g).collect();

        let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();

        for _ in 0..8 {
            let gn_norm = norm(&gn_step);
            let cauchy_norm = norm(&cauchy);

            let step: Vec<f64> = if gn_norm <= *radius {
                gn_step.clone()
            } else if cauchy_norm >= *radius {
                cauchy.iter().map(|c| c * *radius / cauchy_norm).collect()
            } else {
                // Blend along the dog leg so the step lands on the radius
                let diff: Vec<f64> = gn_step
                    .iter()
                    .zip(cauchy.iter())
                    .map(|(g, c)| g - c)
                    .collect();
                let a: f64 = diff.iter().map(|d| d * d).sum();
                let b: f64 = 2.0 * cauchy.iter().zip(diff.iter()).map(|(c, d)| c * d).sum::<f64>();
                let c_term: f64 = cauchy_norm * cauchy_norm - *radius * *radius;
                let disc = (b * b - 4.0 * a * c_term).max(0.0);
                let beta = if a > 0.0 { (-b + disc.sqrt()) / (2.0 * a) } else { 0.0 };
                cauchy
                    .iter()
                    .zip(diff.iter())
                    .map(|(c, d)| c + beta * d)
                    .collect()
            };

            let step_norm = norm(&step);
            if step_norm < 1e-12 {
                return Ok(None);
            }

            let mut candidate = self.values.clone();
            candidate.retract_all(&assembly.order, &step);
            let new_cost = self.total_cost(&candidate)?;

            if new_cost <= cost + 1e-12 {
                if step_norm > 0.8 * *radius {
                    *radius *= 2.0;
                }
                return Ok(Some((candidate, new_cost, step_norm)));
            }

            *radius *= 0.25;
            if *radius < 1e-10 {
                return Ok(None);
            }
        }

        Ok(None)
    }
}

impl Smoother for IncrementalSmoother {
    fn update(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
    ) -> SmootherResult<UpdateResult> {
        let had_new_inputs = !new_factors.is_empty() || !new_values.is_empty();
        self.factors.extend(new_factors);
        self.values.insert_or_assign(new_values);
        self.update_count += 1;

        if self.factors.is_empty() || self.values.is_empty() {
            return Ok(UpdateResult::trivial());
        }

        // Relinearization skip only throttles updates that bring nothing new.
        if !had_new_inputs
            && self.settings.relinearize_skip > 1
            && self.update_count % self.settings.relinearize_skip != 0
        {
            return Ok(UpdateResult::trivial());
        }

        self.run_optimization()
    }

    fn calculate_estimate(&self) -> &Values {
        &self.values
    }

    fn factors(&self) -> &FactorGraph {
        &self.factors
    }

    fn value_exists(&self, key: &Key) -> bool {
        self.values.exists(key)
    }

    fn is_empty(&self) -> bool {
        self.factors.is_empty() && self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{Factor, NoiseModel};
    use crate::se3::SE3;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn settings() -> SmootherSettings {
        SmootherSettings::default()
    }

    fn anchored_chain(smoother: &mut IncrementalSmoother) {
        let mut values = Values::new();
        values.insert_pose(Key::X(0), SE3::identity());
        values.insert_pose(Key::X(1), SE3::from_translation(Vector3::new(0.9, 0.1, 0.0)));

        let mut graph = FactorGraph::new();
        graph.add(Factor::linear_damping(Key::X(0), 6, 1e10));
        graph.add(Factor::pose_between(
            Key::X(0),
            Key::X(1),
            SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)),
            NoiseModel::isotropic(6, 1e4),
        ));
        smoother.update(graph, values).unwrap();
    }

    #[test]
    fn test_chain_converges_to_measurement() {
        let mut smoother = IncrementalSmoother::new(settings());
        anchored_chain(&mut smoother);

        let pose = smoother.calculate_estimate().pose(&Key::X(1)).unwrap();
        assert_relative_eq!(pose.translation().x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(pose.translation().y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_unconstrained_variable_reports_indeterminate() {
        let mut smoother = IncrementalSmoother::new(settings());
        anchored_chain(&mut smoother);

        // A velocity variable with no factor touching it leaves its columns empty.
        let mut values = Values::new();
        values.insert_velocity(Key::V(4), Vector3::zeros());
        let err = smoother.update(FactorGraph::new(), values).unwrap_err();
        match err {
            SmootherError::IndeterminateSystem { nearby_key } => {
                assert_eq!(nearby_key, Key::V(4));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_optimize_idempotent() {
        let mut smoother = IncrementalSmoother::new(settings());
        anchored_chain(&mut smoother);

        let before = smoother.calculate_estimate().pose(&Key::X(1)).unwrap();
        for _ in 0..3 {
            smoother.update(FactorGraph::new(), Values::new()).unwrap();
        }
        let after = smoother.calculate_estimate().pose(&Key::X(1)).unwrap();
        assert_relative_eq!(before.delta_to(&after).log().norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_initial_lambda_damped_start_converges() {
        // The tiny damping used by the local registration refinement must
        // behave like an undamped Gauss-Newton start.
        let mut smoother = IncrementalSmoother::new(SmootherSettings {
            initial_lambda: 1e-12,
            ..settings()
        });
        anchored_chain(&mut smoother);

        let pose = smoother.calculate_estimate().pose(&Key::X(1)).unwrap();
        assert_relative_eq!(pose.translation().x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(pose.translation().y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dogleg_converges_too() {
        let mut smoother = IncrementalSmoother::new(SmootherSettings {
            use_dogleg: true,
            ..settings()
        });
        anchored_chain(&mut smoother);

        let pose = smoother.calculate_estimate().pose(&Key::X(1)).unwrap();
        assert_relative_eq!(pose.translation().x, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_update_on_empty_graph_is_trivial() {
        let mut smoother = IncrementalSmoother::new(settings());
        let result = smoother.update(FactorGraph::new(), Values::new()).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(smoother.is_empty());
    }

    #[test]
    fn test_replay_after_failure_with_damping() {
        let mut smoother = IncrementalSmoother::new(settings());
        anchored_chain(&mut smoother);

        let mut values = Values::new();
        values.insert_velocity(Key::V(4), Vector3::zeros());
        assert!(smoother.update(FactorGraph::new(), values).is_err());

        // Rebuild the way the backend does: replay factors + values with a
        // damping factor on the reported variable.
        let replay_factors: FactorGraph = smoother.factors().clone();
        let replay_values = smoother.calculate_estimate().clone();

        let mut rebuilt = IncrementalSmoother::new(settings());
        let mut graph = replay_factors;
        graph.add(Factor::linear_damping(Key::V(4), 6, 1e4));
        rebuilt.update(graph, replay_values).unwrap();
        assert!(rebuilt.value_exists(&Key::V(4)));
    }
}
