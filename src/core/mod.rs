//! Core pose-graph primitives: variable keys, value maps, and the factor
//! graph container.

pub mod graph;
pub mod key;
pub mod values;

pub use graph::FactorGraph;
pub use key::Key;
pub use values::{Values, VariableValue};
