//! Cell-local linearization interface.
//!
//! The assembler knows nothing about the equations it linearizes. Instead, a model implements
//! [`LocalOperator`] to evaluate the contributions of a single cell to the equations of the
//! cell's primary degrees of freedom, and [`DofMeasure`] to weigh per-DOF quantities.
use crate::stencil::Stencil;
use crate::Real;
use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector, DVectorView, DVectorViewMut, Scalar};

/// Everything a local operator needs to know about the cell it evaluates.
#[derive(Debug, Clone)]
pub struct CellContext<'a, T: Scalar> {
    pub cell: usize,
    /// Global indices of the degrees of freedom in the cell's stencil, primary degrees of
    /// freedom first.
    pub dofs: &'a [usize],
    pub num_primary_dofs: usize,
    pub num_eq: usize,
    /// The current global solution, `num_eq` consecutive entries per degree of freedom.
    pub solution: DVectorView<'a, T>,
    pub time_step_size: T,
}

impl<'a, T: Scalar> CellContext<'a, T> {
    pub fn num_dofs(&self) -> usize {
        self.dofs.len()
    }

    pub fn primary_dofs(&self) -> &'a [usize] {
        &self.dofs[..self.num_primary_dofs]
    }

    /// The primary variables of the `local_dof`-th degree of freedom of the stencil.
    pub fn dof_values(&self, local_dof: usize) -> DVectorView<T> {
        let global = self.dofs[local_dof];
        self.solution.rows(global * self.num_eq, self.num_eq)
    }
}

/// Residual and storage term of the primary degrees of freedom of a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResidual<T: Scalar> {
    num_eq: usize,
    residual: DVector<T>,
    storage_term: DVector<T>,
}

impl<T: Real> LocalResidual<T> {
    pub fn new() -> Self {
        Self {
            num_eq: 0,
            residual: DVector::zeros(0),
            storage_term: DVector::zeros(0),
        }
    }

    /// Resizes the output for the given cell shape and sets every entry to zero.
    pub fn reset(&mut self, num_eq: usize, num_primary_dofs: usize) {
        let n = num_eq * num_primary_dofs;
        self.num_eq = num_eq;
        self.residual.resize_vertically_mut(n, T::zero());
        self.residual.fill(T::zero());
        self.storage_term.resize_vertically_mut(n, T::zero());
        self.storage_term.fill(T::zero());
    }

    pub fn num_primary_dofs(&self) -> usize {
        if self.num_eq == 0 {
            0
        } else {
            self.residual.len() / self.num_eq
        }
    }

    /// The residual of the equations of the `primary`-th primary degree of freedom.
    ///
    /// The residual includes the storage term.
    pub fn residual(&self, primary: usize) -> DVectorView<T> {
        self.residual.rows(primary * self.num_eq, self.num_eq)
    }

    pub fn residual_mut(&mut self, primary: usize) -> DVectorViewMut<T> {
        self.residual.rows_mut(primary * self.num_eq, self.num_eq)
    }

    /// The time-derivative contribution to the residual of the `primary`-th primary degree
    /// of freedom.
    pub fn storage_term(&self, primary: usize) -> DVectorView<T> {
        self.storage_term.rows(primary * self.num_eq, self.num_eq)
    }

    pub fn storage_term_mut(&mut self, primary: usize) -> DVectorViewMut<T> {
        self.storage_term.rows_mut(primary * self.num_eq, self.num_eq)
    }
}

impl<T: Real> Default for LocalResidual<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Residual, storage term and their derivatives for the primary degrees of freedom of a cell.
///
/// The Jacobian has one `num_eq x num_eq` block for every pair of a primary degree of freedom
/// and a degree of freedom of the stencil. The storage Jacobian only has the diagonal blocks,
/// one per primary degree of freedom.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalLinearization<T: Scalar> {
    residual: LocalResidual<T>,
    jacobian: DMatrix<T>,
    storage_jacobian: DMatrix<T>,
}

impl<T: Real> LocalLinearization<T> {
    pub fn new() -> Self {
        Self {
            residual: LocalResidual::new(),
            jacobian: DMatrix::zeros(0, 0),
            storage_jacobian: DMatrix::zeros(0, 0),
        }
    }

    /// Resizes the output for the given cell shape and sets every entry to zero.
    pub fn reset(&mut self, num_eq: usize, num_primary_dofs: usize, num_dofs: usize) {
        let rows = num_eq * num_primary_dofs;
        self.residual.reset(num_eq, num_primary_dofs);
        self.jacobian.resize_mut(rows, num_eq * num_dofs, T::zero());
        self.jacobian.fill(T::zero());
        self.storage_jacobian.resize_mut(rows, num_eq, T::zero());
        self.storage_jacobian.fill(T::zero());
    }

    fn num_eq(&self) -> usize {
        self.residual.num_eq
    }

    pub fn residual(&self) -> &LocalResidual<T> {
        &self.residual
    }

    pub fn residual_mut(&mut self) -> &mut LocalResidual<T> {
        &mut self.residual
    }

    /// The derivative of the equations of the `primary`-th primary degree of freedom with
    /// respect to the primary variables of the `dof`-th degree of freedom of the stencil.
    pub fn jacobian_block(&self, primary: usize, dof: usize) -> DMatrixView<T> {
        let n = self.num_eq();
        self.jacobian.view((primary * n, dof * n), (n, n))
    }

    pub fn jacobian_block_mut(&mut self, primary: usize, dof: usize) -> DMatrixViewMut<T> {
        let n = self.num_eq();
        self.jacobian.view_mut((primary * n, dof * n), (n, n))
    }

    /// The derivative of the storage term of the `primary`-th primary degree of freedom with
    /// respect to its own primary variables.
    pub fn storage_jacobian(&self, primary: usize) -> DMatrixView<T> {
        let n = self.num_eq();
        self.storage_jacobian.view((primary * n, 0), (n, n))
    }

    pub fn storage_jacobian_mut(&mut self, primary: usize) -> DMatrixViewMut<T> {
        let n = self.num_eq();
        self.storage_jacobian.view_mut((primary * n, 0), (n, n))
    }
}

impl<T: Real> Default for LocalLinearization<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates the local contributions of a single cell.
///
/// Outputs are sized for the cell and zeroed before they are handed to the operator.
/// Errors signal numerical failures (for example a non-physical state) and are handled
/// collectively by the assembler.
pub trait LocalOperator<T: Scalar> {
    /// Number of equations (and primary variables) per degree of freedom.
    fn num_eq(&self) -> usize;

    fn evaluate_full(&self, context: &CellContext<T>, output: &mut LocalLinearization<T>) -> eyre::Result<()>;

    /// Evaluates residual and storage term only. Must produce the same residual and storage term
    /// as [`evaluate_full`](Self::evaluate_full).
    fn evaluate_residual_only(&self, context: &CellContext<T>, output: &mut LocalResidual<T>) -> eyre::Result<()>;
}

/// Geometric and physical weights of degrees of freedom.
pub trait DofMeasure<T: Real> {
    /// Total volume of all cells adjacent to the degree of freedom.
    ///
    /// Degrees of freedom with a non-positive volume are ignored by the discrepancy measure.
    fn dof_total_volume(&self, dof: usize) -> T;

    /// Scaling applied to the given equation of the degree of freedom when measuring errors.
    fn equation_weight(&self, _dof: usize, _eq: usize) -> T {
        T::one()
    }
}

/// Everything the assembler and the Newton driver need from a discretized model.
pub trait Problem<T: Real>: Stencil + LocalOperator<T> + DofMeasure<T> {}

impl<T, P> Problem<T> for P
where
    T: Real,
    P: Stencil + LocalOperator<T> + DofMeasure<T> + ?Sized,
{
}
