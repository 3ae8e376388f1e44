//! Ordered factor container with connectivity queries.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::key::Key;
use crate::factors::Factor;

/// An ordered list of factors forming the nonlinear least-squares objective.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    factors: Vec<Factor>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    pub fn extend(&mut self, other: FactorGraph) {
        self.factors.extend(other.factors);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Factor> {
        self.factors.iter()
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Key -> set-of-neighbor-keys map over all factors. Every key of a
    /// factor is considered adjacent to every key of the same factor,
    /// including itself (so unary factors register their key).
    pub fn connectivity_map(&self) -> HashMap<Key, BTreeSet<Key>> {
        let mut map: HashMap<Key, BTreeSet<Key>> = HashMap::new();
        for factor in &self.factors {
            let keys = factor.keys();
            for &key in &keys {
                let entry = map.entry(key).or_default();
                for &other in &keys {
                    entry.insert(other);
                }
            }
        }
        map
    }

    /// Ordered `(i, j)` index pairs of all 2-key factors connecting two pose
    /// variables. Used to skip already-linked submap pairs during the
    /// overlap search.
    pub fn linked_pose_pairs(&self) -> HashSet<(u64, u64)> {
        let mut pairs = HashSet::new();
        for factor in &self.factors {
            let keys = factor.keys();
            if keys.len() != 2 {
                continue;
            }
            if let (Key::X(i), Key::X(j)) = (keys[0], keys[1]) {
                pairs.insert((i, j));
            }
        }
        pairs
    }
}

impl IntoIterator for FactorGraph {
    type Item = Factor;
    type IntoIter = std::vec::IntoIter<Factor>;

    fn into_iter(self) -> Self::IntoIter {
        self.factors.into_iter()
    }
}

impl FromIterator<Factor> for FactorGraph {
    fn from_iter<T: IntoIterator<Item = Factor>>(iter: T) -> Self {
        Self {
            factors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{Factor, NoiseModel};
    use crate::se3::SE3;

    fn between(i: u64, j: u64) -> Factor {
        Factor::pose_between(
            Key::X(i),
            Key::X(j),
            SE3::identity(),
            NoiseModel::isotropic(6, 1e6),
        )
    }

    #[test]
    fn test_linked_pose_pairs() {
        let mut graph = FactorGraph::new();
        graph.add(between(0, 1));
        graph.add(between(1, 2));
        graph.add(Factor::linear_damping(Key::X(0), 6, 1e10));

        let pairs = graph.linked_pose_pairs();
        assert!(pairs.contains(&(0, 1)));
        assert!(pairs.contains(&(1, 2)));
        assert!(!pairs.contains(&(0, 2)));
    }

    #[test]
    fn test_connectivity_map() {
        let mut graph = FactorGraph::new();
        graph.add(between(0, 1));

        let map = graph.connectivity_map();
        assert!(map[&Key::X(0)].contains(&Key::X(1)));
        assert!(map[&Key::X(1)].contains(&Key::X(0)));
        assert!(map[&Key::X(0)].contains(&Key::X(0)));
    }
}
