//! Storage-only smoother used when optimization is disabled.
//!
//! Values and factors accumulate exactly as in the real smoother, but no
//! solve ever runs: estimates are the values as inserted. This keeps the
//! save/load machinery and all graph invariants intact with the optimizer
//! switched off.

use crate::core::graph::FactorGraph;
use crate::core::key::Key;
use crate::core::values::Values;
use crate::smoother::{Smoother, SmootherResult, UpdateResult};

#[derive(Debug, Default)]
pub struct NoopSmoother {
    factors: FactorGraph,
    values: Values,
}

impl NoopSmoother {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Smoother for NoopSmoother {
    fn update(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
    ) -> SmootherResult<UpdateResult> {
        self.factors.extend(new_factors);
        self.values.insert_or_assign(new_values);
        Ok(UpdateResult::trivial())
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
    use crate::factors::Factor;
    use crate::se3::SE3;

    #[test]
    fn test_stores_without_solving() {
        let mut smoother = NoopSmoother::new();
        let mut values = Values::new();
        values.insert_pose(Key::X(0), SE3::identity());
        let mut graph = FactorGraph::new();
        graph.add(Factor::linear_damping(Key::X(0), 6, 1e10));

        let result = smoother.update(graph, values).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(smoother.value_exists(&Key::X(0)));
        assert_eq!(smoother.factors().len(), 1);
        assert!(!smoother.is_empty());
    }
}
