//! Sparse normal-equation solving for the smoother.
//!
//! Assembles `H = J^T J` from the whitened Jacobian and solves the (damped)
//! normal equations with a sparse Cholesky (LLT) factorization. A failed
//! factorization signals a rank-deficient or non-positive-definite
//! linearization, the indeterminate-system condition the smoother driver
//! recovers from.

use faer::{
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
    Mat, Side,
};
use std::ops::Mul;
use thiserror::Error;
use tracing::error;

/// Linear algebra error types.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// The information matrix is singular or not positive definite
    #[error("Singular matrix detected during Cholesky factorization")]
    SingularMatrix,

    /// Sparse matrix construction failed
    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    /// Symbolic factorization failed
    #[error("Symbolic factorization failed: {0}")]
    FactorizationFailed(String),
}

/// Result type for linear algebra operations.
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Sparse LLT solver over the whitened least-squares system.
#[derive(Debug, Default)]
pub struct SparseCholeskySolver;

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self
    }

    /// Build the Jacobian from triplets and solve
    /// `(J^T J + lambda I) dx = -J^T r`.
    ///
    /// `lambda = 0` solves the undamped system. Returns the stacked tangent
    /// step.
    pub fn solve(
        &self,
        rows: usize,
        cols: usize,
        triplets: &[Triplet<usize, usize, f64>],
        residual: &[f64],
        lambda: f64,
    ) -> LinAlgResult<Vec<f64>> {
        let jacobian = SparseColMat::try_new_from_triplets(rows, cols, triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))?;

        let mut r = Mat::zeros(rows, 1);
        for (i, v) in residual.iter().enumerate() {
            r[(i, 0)] = *v;
        }

        // H = J^T J
        let mut hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))?
            .mul(jacobian.as_ref());

        if lambda > 0.0 {
            let damping: Vec<Triplet<usize, usize, f64>> =
                (0..cols).map(|i| Triplet::new(i, i, lambda)).collect();
            let identity = SparseColMat::try_new_from_triplets(cols, cols, &damping)
                .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))?;
            hessian = &hessian + identity;
        }

        // g = J^T r
        let gradient = jacobian.as_ref().transpose().mul(&r);

        let symbolic = SymbolicLlt::try_new(hessian.symbolic(), Side::Lower)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        let cholesky = Llt::try_new_with_symbolic(symbolic, hessian.as_ref(), Side::Lower)
            .map_err(|_| LinAlgError::SingularMatrix)?;

        let dx = cholesky.solve(-&gradient);
        Ok((0..cols).map(|i| dx[(i, 0)]).collect())
    }
}

/// Squared column norms of the Jacobian, i.e. the diagonal of `J^T J`.
///
/// Near-zero entries identify unconstrained tangent directions and locate
/// the variable a failed factorization is nearest to.
pub fn column_squared_norms(triplets: &[Triplet<usize, usize, f64>], cols: usize) -> Vec<f64> {
    let mut norms = vec![0.0; cols];
    for t in triplets {
        norms[t.col] += t.val * t.val;
    }
    norms
}
