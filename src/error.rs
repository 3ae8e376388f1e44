//! Error types for the apex-mapper library.
//!
//! The library uses a hierarchical error system where:
//! - **`ApexMapperError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`FactorError`, `SmootherError`, etc.) are wrapped inside it
//! - **Error sources** are preserved, allowing full error chain inspection

use crate::factors::FactorError;
use crate::linalg::LinAlgError;
use crate::mapping::persistence::PersistenceError;
use crate::smoother::SmootherError;
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the apex-mapper library.
pub type ApexMapperResult<T> = Result<T, ApexMapperError>;

/// Top-level error type exposed by public APIs.
///
/// Wraps module-specific errors while preserving the full error chain for
/// debugging.
#[derive(Debug, Error)]
pub enum ApexMapperError {
    /// Factor construction or linearization errors
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Smoother update errors (including unrecovered indeterminate systems)
    #[error(transparent)]
    Smoother(#[from] SmootherError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Persistence (save/load/recover) errors
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Filesystem errors surfaced by save/load
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApexMapperError {
    /// Get the full error chain as a multi-line string for logging.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
