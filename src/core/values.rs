//! Variable value storage with tangent-space retraction.

use nalgebra::{Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::key::Key;
use crate::imu::ImuBias;
use crate::se3::SE3;

/// Value of a single graph variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Pose(SE3),
    Velocity(Vector3<f64>),
    Bias(ImuBias),
}

impl VariableValue {
    /// Tangent-space dimension of this value.
    pub fn dim(&self) -> usize {
        match self {
            VariableValue::Pose(_) => 6,
            VariableValue::Velocity(_) => 3,
            VariableValue::Bias(_) => 6,
        }
    }

    /// Apply a tangent step: `x' = x ⊞ delta`.
    ///
    /// Poses retract through the SE(3) exponential; velocities and biases
    /// are Euclidean.
    pub fn retract(&mut self, delta: &[f64]) {
        match self {
            VariableValue::Pose(pose) => {
                let xi = Vector6::from_row_slice(delta);
                *pose = pose.retract(&xi);
            }
            VariableValue::Velocity(v) => {
                *v += Vector3::from_row_slice(delta);
            }
            VariableValue::Bias(b) => {
                let step = Vector6::from_row_slice(delta);
                *b = ImuBias::from_vector(&(b.to_vector() + step));
            }
        }
    }
}

/// Ordered map from variable keys to their current values.
///
/// A `BTreeMap` keeps iteration (and therefore variable column ordering in
/// the linear system) deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Values {
    entries: BTreeMap<Key, VariableValue>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Key, value: VariableValue) {
        self.entries.insert(key, value);
    }

    pub fn insert_pose(&mut self, key: Key, pose: SE3) {
        self.insert(key, VariableValue::Pose(pose));
    }

    pub fn insert_velocity(&mut self, key: Key, v: Vector3<f64>) {
        self.insert(key, VariableValue::Velocity(v));
    }

    pub fn insert_bias(&mut self, key: Key, b: ImuBias) {
        self.insert(key, VariableValue::Bias(b));
    }

    pub fn get(&self, key: &Key) -> Option<&VariableValue> {
        self.entries.get(key)
    }

    pub fn pose(&self, key: &Key) -> Option<SE3> {
        match self.entries.get(key) {
            Some(VariableValue::Pose(p)) => Some(*p),
            _ => None,
        }
    }

    pub fn velocity(&self, key: &Key) -> Option<Vector3<f64>> {
        match self.entries.get(key) {
            Some(VariableValue::Velocity(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bias(&self, key: &Key) -> Option<ImuBias> {
        match self.entries.get(key) {
            Some(VariableValue::Bias(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn exists(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &VariableValue)> {
        self.entries.iter()
    }

    /// Insert every entry of `other`, overwriting on collision.
    pub fn insert_or_assign(&mut self, other: Values) {
        for (key, value) in other.entries {
            self.entries.insert(key, value);
        }
    }

    /// Apply a stacked tangent step laid out by `order`.
    pub fn retract_all(&mut self, order: &[Key], step: &[f64]) {
        let mut offset = 0;
        for key in order {
            if let Some(value) = self.entries.get_mut(key) {
                let dim = value.dim();
                value.retract(&step[offset..offset + dim]);
                offset += dim;
            }
        }
    }
}
