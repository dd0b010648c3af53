//! Newton's method on top of [`JacobianAssembler`], and the hooks that keep the assembler's
//! colors in sync with the iteration.
use crate::assembly::{AssemblyError, AssemblyReport, JacobianAssembler};
use crate::comm::{CommError, Communicator, ReduceOp};
use crate::local::{DofMeasure, Problem};
use crate::stencil::Stencil;
use crate::Real;
use fvrelin_sparse::BlockCsrMatrix;
use log::debug;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "T: Real + Deserialize<'de>"))]
pub struct NewtonSettings<T> {
    pub max_iterations: Option<usize>,
    /// The iteration has converged once the weighted maximum norm of the residual is at most
    /// this value.
    pub tolerance: T,
    /// Upper bound for the tolerance that decides which degrees of freedom are relinearized.
    pub max_relinearization_tolerance: T,
    /// Lower bound for the relinearization tolerance, relative to `tolerance`.
    pub min_relinearization_tolerance_factor: T,
}

impl<T: Real> Default for NewtonSettings<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn default() -> Self {
        Self {
            max_iterations: Some(20),
            tolerance: 1e-8,
            max_relinearization_tolerance: 1e-4,
            min_relinearization_tolerance_factor: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewtonReport<T> {
    pub iterations: usize,
    /// Weighted maximum norm of the final residual.
    pub error: T,
    /// One entry per assembly, in order.
    pub assemblies: Vec<AssemblyReport<T>>,
}

#[derive(Debug)]
pub enum NewtonError {
    /// The procedure failed because the maximum number of iterations was reached.
    MaximumIterationsReached(usize),
    /// The update computed by the linear solver is not finite.
    NonFiniteUpdate,
    /// The procedure failed because linearizing the system failed.
    Assembly(AssemblyError),
    /// The procedure failed because solving the Jacobian system failed.
    LinearSolver(Box<dyn Error + Send + Sync>),
    Communication(CommError),
}

impl Display for NewtonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            &NewtonError::MaximumIterationsReached(maxit) => {
                write!(f, "Failed to converge within maximum number of iterations ({}).", maxit)
            }
            &NewtonError::NonFiniteUpdate => write!(f, "Newton update is not finite."),
            &NewtonError::Assembly(ref err) => write!(f, "Failed to linearize the system. Error: {}", err),
            &NewtonError::LinearSolver(ref err) => {
                write!(f, "Failed to solve Jacobian system. Error: {}", err)
            }
            &NewtonError::Communication(ref err) => write!(f, "Communication failed. Error: {}", err),
        }
    }
}

impl Error for NewtonError {}

impl From<AssemblyError> for NewtonError {
    fn from(err: AssemblyError) -> Self {
        NewtonError::Assembly(err)
    }
}

impl From<CommError> for NewtonError {
    fn from(err: CommError) -> Self {
        NewtonError::Communication(err)
    }
}

/// Solves `J x = r` for the assembled Jacobian `J`.
pub trait LinearSolver<T: Real> {
    fn solve(
        &mut self,
        matrix: &BlockCsrMatrix<T>,
        rhs: DVectorView<T>,
        solution: DVectorViewMut<T>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Direct solver based on a dense LU decomposition. Only suitable for small systems.
#[derive(Debug, Copy, Clone, Default)]
pub struct DenseLuSolver;

impl<T: Real> LinearSolver<T> for DenseLuSolver {
    fn solve(
        &mut self,
        matrix: &BlockCsrMatrix<T>,
        rhs: DVectorView<T>,
        mut solution: DVectorViewMut<T>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let x = matrix
            .to_dense()
            .lu()
            .solve(&rhs)
            .ok_or("Jacobian matrix is singular")?;
        solution.copy_from(&x);
        Ok(())
    }
}

/// Newton's method for a finite volume discretization.
///
/// The residual convention is `u <- u - du` with `J du = r`. Between iterations, the method
/// feeds the update into the assembler's discrepancy measure and recomputes colors, so that the
/// next assembly only relinearizes what moved.
#[derive(Debug)]
pub struct FvNewtonMethod<T: Real, C> {
    assembler: JacobianAssembler<T, C>,
    settings: NewtonSettings<T>,
    error: T,
}

impl<T: Real, C: Communicator> FvNewtonMethod<T, C> {
    pub fn new(assembler: JacobianAssembler<T, C>, settings: NewtonSettings<T>) -> Self {
        Self {
            assembler,
            settings,
            error: T::zero(),
        }
    }

    pub fn assembler(&self) -> &JacobianAssembler<T, C> {
        &self.assembler
    }

    pub fn assembler_mut(&mut self) -> &mut JacobianAssembler<T, C> {
        &mut self.assembler
    }

    pub fn settings(&self) -> &NewtonSettings<T> {
        &self.settings
    }

    /// The error of the last assembled residual.
    pub fn error(&self) -> T {
        self.error
    }

    pub fn into_assembler(self) -> JacobianAssembler<T, C> {
        self.assembler
    }

    /// The tolerance for the discrepancy of a degree of freedom above which it is relinearized.
    ///
    /// Tightens quadratically with the current error, within the bounds given by the settings.
    pub fn relinearization_tolerance(&self) -> T {
        let min_tolerance = self.settings.min_relinearization_tolerance_factor * self.settings.tolerance;
        let max_tolerance = self.settings.max_relinearization_tolerance;
        min_tolerance.max(max_tolerance.min(self.error * self.error))
    }

    /// Computes the weighted maximum norm of the assembled residual over all processes.
    ///
    /// Only degrees of freedom owned by a process, i.e. with a positive total volume, contribute.
    pub fn compute_error<M>(&mut self, measure: &M) -> Result<T, CommError>
    where
        M: DofMeasure<T> + ?Sized,
    {
        let residual = self.assembler.residual();
        let num_eq = self.assembler.num_eq();
        let local_error = residual
            .as_slice()
            .chunks_exact(num_eq)
            .enumerate()
            .filter(|&(dof, _)| measure.dof_total_volume(dof) > T::zero())
            .flat_map(|(dof, r)| {
                r.iter()
                    .enumerate()
                    .map(move |(eq, &r_eq)| (r_eq * measure.equation_weight(dof, eq)).abs())
            })
            .fold(T::zero(), T::max);
        let error = self
            .assembler
            .communicator()
            .all_reduce_f64(nalgebra::convert_unchecked(local_error), ReduceOp::Max)?;
        self.error = nalgebra::convert(error);
        Ok(self.error)
    }

    /// Applies the Newton update `solution = last_solution - update`.
    ///
    /// With partial relinearization enabled, first records the update as the discrepancy of
    /// every degree of freedom and recomputes the colors. This is a collective operation.
    pub fn update<P>(
        &mut self,
        problem: &P,
        mut solution: DVectorViewMut<T>,
        last_solution: DVectorView<T>,
        update: DVectorView<T>,
    ) -> Result<(), NewtonError>
    where
        P: Stencil + DofMeasure<T> + Sync + ?Sized,
    {
        if !update.norm_squared().is_finite() {
            return Err(NewtonError::NonFiniteUpdate);
        }

        if self.assembler.settings().enable_partial_relinearization {
            let tolerance = self.relinearization_tolerance();
            self.assembler.update_discrepancy(problem, update);
            self.assembler.compute_colors(problem, tolerance)?;
        }

        solution.copy_from(&last_solution);
        solution -= &update;
        Ok(())
    }

    /// Called after the iteration of a time step failed.
    pub fn failed(&mut self) {
        self.assembler.relinearize_all();
    }

    /// Called after the iteration of a time step converged.
    pub fn succeeded(&mut self) {
        if self.assembler.settings().enable_linearization_recycling {
            self.assembler.set_matrix_reusable(true);
        } else {
            self.assembler.relinearize_all();
        }
    }

    /// Solves the nonlinear system of the current time step, starting from `solution`.
    ///
    /// On success, `solution` holds the converged solution. Calls [`succeeded`](Self::succeeded)
    /// or [`failed`](Self::failed) before returning.
    pub fn solve<P, L>(
        &mut self,
        problem: &P,
        solution: &mut DVector<T>,
        time_step_size: T,
        linear_solver: &mut L,
    ) -> Result<NewtonReport<T>, NewtonError>
    where
        P: Problem<T> + Sync + ?Sized,
        L: LinearSolver<T> + ?Sized,
    {
        match self.iterate(problem, solution, time_step_size, linear_solver) {
            Ok(report) => {
                self.succeeded();
                Ok(report)
            }
            Err(err) => {
                self.failed();
                Err(err)
            }
        }
    }

    fn iterate<P, L>(
        &mut self,
        problem: &P,
        solution: &mut DVector<T>,
        time_step_size: T,
        linear_solver: &mut L,
    ) -> Result<NewtonReport<T>, NewtonError>
    where
        P: Problem<T> + Sync + ?Sized,
        L: LinearSolver<T> + ?Sized,
    {
        let mut last_solution = solution.clone();
        let mut update = DVector::zeros(solution.len());
        let mut assemblies = Vec::new();
        let mut iter = 0;

        loop {
            let assembly = self
                .assembler
                .assemble(problem, solution.as_view(), time_step_size)?;
            assemblies.push(assembly);
            let error = self.compute_error(problem)?;
            debug!(
                "Newton iteration {}: error {}, relinearized {} of {} cells",
                iter, error, assembly.relinearized_cells, assembly.total_cells
            );

            if error <= self.settings.tolerance {
                return Ok(NewtonReport {
                    iterations: iter,
                    error,
                    assemblies,
                });
            }

            if self
                .settings
                .max_iterations
                .map(|max_iter| iter == max_iter)
                .unwrap_or(false)
            {
                return Err(NewtonError::MaximumIterationsReached(iter));
            }

            linear_solver
                .solve(
                    self.assembler.matrix(),
                    self.assembler.residual().as_view(),
                    update.as_view_mut(),
                )
                .map_err(NewtonError::LinearSolver)?;

            last_solution.copy_from(solution);
            self.update(problem, solution.as_view_mut(), last_solution.as_view(), update.as_view())?;
            iter += 1;
        }
    }
}
