//! Re-use of the linearized system at the first Newton iteration of a time step.
//!
//! After a converged time step, the Jacobian differs from the one needed at the start of the
//! next time step mostly through the storage term, which scales with the inverse of the time
//! step size. Instead of relinearizing, the cached storage derivatives on the diagonal are
//! rescaled to the new time step size and the residual is replaced by the negated storage
//! term.
use crate::Real;
use fvrelin_sparse::BlockCsrMatrix;
use nalgebra::{DMatrixView, DMatrixViewMut, DVector, DVectorView, DVectorViewMut, Scalar};

/// Storage terms and their diagonal derivatives, as accumulated by the last full assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageCache<T: Scalar> {
    num_eq: usize,
    storage_term: DVector<T>,
    // One column-major num_eq x num_eq block per degree of freedom
    storage_jacobian: Vec<T>,
    valid: bool,
}

impl<T: Real> StorageCache<T> {
    pub fn new(num_dofs: usize, num_eq: usize) -> Self {
        Self {
            num_eq,
            storage_term: DVector::zeros(num_dofs * num_eq),
            storage_jacobian: vec![T::zero(); num_dofs * num_eq * num_eq],
            valid: false,
        }
    }

    pub fn num_dofs(&self) -> usize {
        if self.num_eq == 0 {
            0
        } else {
            self.storage_term.len() / self.num_eq
        }
    }

    /// Whether the cache holds the storage of a completed assembly.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn mark_valid(&mut self) {
        self.valid = true;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn storage_term(&self, dof: usize) -> DVectorView<T> {
        self.storage_term.rows(dof * self.num_eq, self.num_eq)
    }

    pub fn storage_term_mut(&mut self, dof: usize) -> DVectorViewMut<T> {
        self.storage_term.rows_mut(dof * self.num_eq, self.num_eq)
    }

    pub fn storage_jacobian(&self, dof: usize) -> DMatrixView<T> {
        let b = self.num_eq;
        DMatrixView::from_slice(&self.storage_jacobian[dof * b * b..(dof + 1) * b * b], b, b)
    }

    pub fn storage_jacobian_mut(&mut self, dof: usize) -> DMatrixViewMut<T> {
        let b = self.num_eq;
        DMatrixViewMut::from_slice(&mut self.storage_jacobian[dof * b * b..(dof + 1) * b * b], b, b)
    }

    pub fn reset_storage_terms(&mut self) {
        self.storage_term.fill(T::zero());
    }

    pub fn reset_storage_jacobians(&mut self) {
        self.storage_jacobian.fill(T::zero());
    }

    pub fn reset_storage_jacobian(&mut self, dof: usize) {
        self.storage_jacobian_mut(dof).fill(T::zero());
    }
}

/// Adapts a linearization from the previous time step to the current time step size.
///
/// For every degree of freedom `i`, with `S` the cached storage Jacobian and
/// `ratio = previous_dt / current_dt`:
///
/// ```text
/// J_ii <- J_ii - S + ratio * S
/// r_i  <- -storage_term_i
/// ```
///
/// The cached storage Jacobian is scaled in place, so that repeated recycling stays
/// consistent with the matrix. Off-diagonal blocks are not touched.
pub fn recycle_linearization<T: Real>(
    matrix: &mut BlockCsrMatrix<T>,
    residual: &mut DVector<T>,
    cache: &mut StorageCache<T>,
    time_step_ratio: T,
) {
    let b = cache.num_eq;
    assert_eq!(matrix.block_size(), b, "Cache and matrix must have the same block size.");
    assert_eq!(residual.len(), cache.storage_term.len(), "Cache and residual must match.");

    for dof in 0..cache.num_dofs() {
        let mut storage_jacobian = cache.storage_jacobian_mut(dof);
        if let Some(mut diagonal) = matrix.diagonal_block_mut(dof) {
            diagonal -= &storage_jacobian;
            storage_jacobian *= time_step_ratio;
            diagonal += &storage_jacobian;
        } else {
            storage_jacobian *= time_step_ratio;
        }
    }

    residual.copy_from(&cache.storage_term);
    residual.neg_mut();
}
