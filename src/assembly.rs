//! Assembly of the global Jacobian and residual with partial relinearization.
use crate::color::EntityColor;
use crate::coloring::ColoringEngine;
use crate::comm::{BorderInterface, CommError, Communicator, ReduceOp};
use crate::config::AssemblerSettings;
use crate::local::{CellContext, DofMeasure, LocalLinearization, LocalOperator};
use crate::recycling::{recycle_linearization, StorageCache};
use crate::sparsity::assemble_block_pattern;
use crate::stencil::Stencil;
use crate::Real;
use fvrelin_sparse::BlockCsrMatrix;
use log::{info, warn};
use nalgebra::{DVector, DVectorView};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyError {
    /// At least one process failed to evaluate its local contributions.
    ///
    /// Reported identically on every process.
    Linearization {
        failed_processes: usize,
        num_processes: usize,
    },
    Communication(CommError),
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyError::Linearization {
                failed_processes,
                num_processes,
            } => write!(
                f,
                "A process did not succeed in linearizing the system ({} of {} processes failed)",
                failed_processes, num_processes
            ),
            AssemblyError::Communication(err) => write!(f, "Communication failed during assembly: {}", err),
        }
    }
}

impl Error for AssemblyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AssemblyError::Communication(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CommError> for AssemblyError {
    fn from(err: CommError) -> Self {
        AssemblyError::Communication(err)
    }
}

/// Summary of a call to [`JacobianAssembler::assemble`], reduced over all processes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssemblyReport<T> {
    /// Whether the linearization of the previous time step was re-used.
    pub recycled: bool,
    pub total_cells: usize,
    /// Number of interior cells whose local Jacobian was evaluated.
    pub relinearized_cells: usize,
    /// Largest error among degrees of freedom that were not relinearized.
    pub accuracy: T,
}

#[derive(Debug)]
struct AssemblerWorkspace<T: Real> {
    cell_dofs: Vec<usize>,
    linearization: LocalLinearization<T>,
}

/// Assembles the global Jacobian and residual of a process' partition.
///
/// With partial relinearization enabled, the assembler only evaluates the local Jacobian of
/// cells that the last call to [`compute_colors`](Self::compute_colors) did not classify as
/// green, and only overwrites the rows of non-green degrees of freedom. The rows of green
/// degrees of freedom keep the values of the last assembly that relinearized them. The
/// residual is always recomputed in full.
#[derive(Debug)]
pub struct JacobianAssembler<T: Real, C> {
    settings: AssemblerSettings,
    comm: C,
    border: BorderInterface,
    num_eq: usize,
    matrix: BlockCsrMatrix<T>,
    residual: DVector<T>,
    storage: Option<StorageCache<T>>,
    coloring: ColoringEngine<T>,
    reuse_linearization: bool,
    previous_time_step_size: Option<T>,
    total_cells: usize,
    green_cells: usize,
    relinearization_accuracy: T,
    workspace: AssemblerWorkspace<T>,
}

impl<T: Real, C: Communicator> JacobianAssembler<T, C> {
    /// Allocates the matrix for the stencil of the given problem.
    ///
    /// This is a collective operation. Every entity starts out red.
    pub fn init<P>(
        problem: &P,
        settings: AssemblerSettings,
        comm: C,
        border: BorderInterface,
    ) -> Result<Self, AssemblyError>
    where
        P: Stencil + LocalOperator<T> + ?Sized,
    {
        let num_eq = problem.num_eq();
        assert!(num_eq >= 1, "Need at least one equation per degree of freedom.");
        let num_dofs = problem.num_dofs();
        let num_cells = problem.num_cells();

        let pattern = assemble_block_pattern(problem);
        let matrix = BlockCsrMatrix::from_pattern(Arc::new(pattern), num_eq);
        let storage = settings
            .enable_linearization_recycling
            .then(|| StorageCache::new(num_dofs, num_eq));

        let interior_cells = (0..num_cells)
            .filter(|&cell| problem.is_interior_cell(cell))
            .count();
        let total_cells = comm.all_reduce_usize(interior_cells, ReduceOp::Sum)?;

        let mut assembler = Self {
            settings,
            comm,
            border,
            num_eq,
            matrix,
            residual: DVector::zeros(num_dofs * num_eq),
            storage,
            coloring: ColoringEngine::new(num_dofs, num_cells, settings.enable_partial_relinearization),
            reuse_linearization: false,
            previous_time_step_size: None,
            total_cells,
            green_cells: 0,
            relinearization_accuracy: T::zero(),
            workspace: AssemblerWorkspace {
                cell_dofs: Vec::new(),
                linearization: LocalLinearization::new(),
            },
        };
        assembler.relinearize_all();
        Ok(assembler)
    }

    pub fn settings(&self) -> &AssemblerSettings {
        &self.settings
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    pub fn border(&self) -> &BorderInterface {
        &self.border
    }

    pub fn num_eq(&self) -> usize {
        self.num_eq
    }

    pub fn matrix(&self) -> &BlockCsrMatrix<T> {
        &self.matrix
    }

    pub fn residual(&self) -> &DVector<T> {
        &self.residual
    }

    pub fn coloring(&self) -> &ColoringEngine<T> {
        &self.coloring
    }

    /// Interior cells over all processes.
    pub fn total_cells(&self) -> usize {
        self.total_cells
    }

    /// The largest error of any degree of freedom that was not relinearized by the last
    /// assembly, over all processes.
    pub fn relinearization_accuracy(&self) -> T {
        self.relinearization_accuracy
    }

    /// Always red when partial relinearization is disabled.
    pub fn dof_color(&self, dof: usize) -> EntityColor {
        self.coloring.dof_color(dof)
    }

    /// Always red when partial relinearization is disabled.
    pub fn cell_color(&self, cell: usize) -> EntityColor {
        self.coloring.cell_color(cell)
    }

    /// Forces the given degree of freedom to be relinearized by the next assembly.
    ///
    /// Must be called before [`compute_colors`](Self::compute_colors). Marked afterwards, the
    /// degree of freedom's row is zeroed while its cells may stay green, which leaves the row
    /// empty in the assembled matrix.
    pub fn mark_dof_red(&mut self, dof: usize) {
        self.coloring.mark_dof_red(dof);
    }

    /// Forces the next assembly to relinearize the whole system.
    pub fn relinearize_all(&mut self) {
        self.reuse_linearization = false;
        self.coloring.relinearize_all();
    }

    /// Requests the next assembly to re-use the current linearization.
    ///
    /// Has no effect unless linearization recycling is enabled, and is ignored until a full
    /// assembly has populated the storage cache.
    pub fn set_matrix_reusable(&mut self, reusable: bool) {
        let Some(cache) = &self.storage else {
            return;
        };
        if reusable && !cache.is_valid() {
            warn!("Ignoring request to re-use a linearization that has never been assembled");
            return;
        }
        self.reuse_linearization = reusable;
    }

    pub fn is_matrix_reusable(&self) -> bool {
        self.reuse_linearization
    }

    /// See [`ColoringEngine::update_discrepancy`].
    pub fn update_discrepancy<M>(&mut self, measure: &M, update: DVectorView<T>)
    where
        M: DofMeasure<T> + ?Sized,
    {
        self.coloring.update_discrepancy(measure, update, self.num_eq);
    }

    /// Recomputes colors for the given tolerance. This is a collective operation.
    pub fn compute_colors<S>(&mut self, stencil: &S, tolerance: T) -> Result<(), CommError>
    where
        S: Stencil + Sync + ?Sized,
    {
        self.coloring
            .compute_colors(stencil, &self.comm, &self.border, tolerance)
    }

    /// Linearizes the system around the given solution.
    ///
    /// This is a collective operation. If the local operator fails on any process, every
    /// process returns [`AssemblyError::Linearization`] and the matrix and residual are left
    /// in an unspecified state.
    ///
    /// # Panics
    ///
    /// Panics if the solution does not have `num_eq` entries per degree of freedom.
    pub fn assemble<P>(
        &mut self,
        problem: &P,
        solution: DVectorView<T>,
        time_step_size: T,
    ) -> Result<AssemblyReport<T>, AssemblyError>
    where
        P: Stencil + LocalOperator<T> + ?Sized,
    {
        assert_eq!(
            solution.len(),
            self.residual.len(),
            "Solution must have num_eq entries per degree of freedom."
        );

        let local_result = self.assemble_local(problem, solution, time_step_size);
        let local_failures = match &local_result {
            Ok(_) => 0,
            Err(err) => {
                warn!("Rank {} caught an error while linearizing the system: {:#}", self.comm.rank(), err);
                1
            }
        };
        let failed_processes = self
            .comm
            .all_reduce_usize(local_failures, ReduceOp::Sum)?;
        if failed_processes > 0 {
            if let Some(cache) = &mut self.storage {
                cache.invalidate();
            }
            return Err(AssemblyError::Linearization {
                failed_processes,
                num_processes: self.comm.size(),
            });
        }
        let recycled = matches!(local_result, Ok(true));

        let mut report = AssemblyReport {
            recycled,
            total_cells: self.total_cells,
            relinearized_cells: if recycled { 0 } else { self.total_cells },
            accuracy: T::zero(),
        };

        if recycled {
            info!("Linear system of equations reused from previous time step");
        } else if self.coloring.is_enabled() {
            let green_cells = self
                .comm
                .all_reduce_usize(self.green_cells, ReduceOp::Sum)?;
            let accuracy = self.comm.all_reduce_f64(
                nalgebra::convert_unchecked::<T, f64>(self.coloring.next_accuracy()),
                ReduceOp::Max,
            )?;
            self.relinearization_accuracy = nalgebra::convert(accuracy);
            report.relinearized_cells = self.total_cells - green_cells;
            report.accuracy = self.relinearization_accuracy;

            let percentage = if self.total_cells > 0 {
                100.0 * report.relinearized_cells as f64 / self.total_cells as f64
            } else {
                0.0
            };
            info!(
                "Relinearized {} of {} ({:.1}%) cells. Accuracy: {:e}",
                report.relinearized_cells, self.total_cells, percentage, accuracy
            );
        }

        // Colors only steer a single assembly
        self.coloring.reset_dof_colors();
        Ok(report)
    }

    /// Returns whether the previous linearization was recycled.
    fn assemble_local<P>(&mut self, problem: &P, solution: DVectorView<T>, time_step_size: T) -> eyre::Result<bool>
    where
        P: Stencil + LocalOperator<T> + ?Sized,
    {
        if self.reuse_linearization {
            self.reuse_linearization = false;
            if let (Some(cache), Some(previous_time_step_size)) = (&mut self.storage, self.previous_time_step_size) {
                recycle_linearization(
                    &mut self.matrix,
                    &mut self.residual,
                    cache,
                    previous_time_step_size / time_step_size,
                );
                self.previous_time_step_size = Some(time_step_size);
                return Ok(true);
            }
        }

        self.reset_system();
        self.previous_time_step_size = Some(time_step_size);
        self.green_cells = 0;

        let Self {
            settings,
            num_eq,
            matrix,
            residual,
            storage,
            coloring,
            green_cells,
            workspace,
            ..
        } = self;
        let num_eq = *num_eq;
        let partial = settings.enable_partial_relinearization;

        for cell in 0..problem.num_cells() {
            if !problem.is_interior_cell(cell) {
                continue;
            }

            let AssemblerWorkspace {
                cell_dofs,
                linearization,
            } = &mut *workspace;
            cell_dofs.resize(problem.cell_dof_count(cell), usize::MAX);
            problem.populate_cell_dofs(cell_dofs, cell);
            let num_primary_dofs = problem.cell_primary_dof_count(cell);
            let context = CellContext {
                cell,
                dofs: cell_dofs,
                num_primary_dofs,
                num_eq,
                solution,
                time_step_size,
            };

            let green_cell = partial && coloring.cell_color(cell) == EntityColor::Green;
            if green_cell {
                // Residual only: the Jacobian rows of this cell's degrees of freedom are either
                // green or written by another cell
                *green_cells += 1;
                let local = linearization.residual_mut();
                local.reset(num_eq, num_primary_dofs);
                problem.evaluate_residual_only(&context, local)?;
            } else {
                linearization.reset(num_eq, num_primary_dofs, cell_dofs.len());
                problem.evaluate_full(&context, linearization)?;
            }

            for (p, &row) in cell_dofs[..num_primary_dofs].iter().enumerate() {
                let local = linearization.residual();
                let mut residual_row = residual.rows_mut(row * num_eq, num_eq);
                residual_row += local.residual(p);
                if let Some(cache) = storage.as_mut() {
                    let mut storage_row = cache.storage_term_mut(row);
                    storage_row += local.storage_term(p);
                }

                if green_cell || coloring.dof_color(row) == EntityColor::Green {
                    continue;
                }

                if let Some(cache) = storage.as_mut() {
                    let mut storage_block = cache.storage_jacobian_mut(row);
                    storage_block += linearization.storage_jacobian(p);
                }
                let mut matrix_row = matrix.row_mut(row);
                for (d, &col) in cell_dofs.iter().enumerate() {
                    let mut block = matrix_row
                        .block_mut(col)
                        .expect("Every stencil coupling is part of the sparsity pattern");
                    block += linearization.jacobian_block(p, d);
                }
            }
        }

        if let Some(cache) = storage.as_mut() {
            cache.mark_valid();
        }
        Ok(false)
    }

    /// Zeroes the residual and every matrix row that is about to be relinearized.
    fn reset_system(&mut self) {
        self.residual.fill(T::zero());
        if let Some(cache) = &mut self.storage {
            cache.reset_storage_terms();
        }

        if !self.coloring.is_enabled() {
            self.matrix.fill(T::zero());
            if let Some(cache) = &mut self.storage {
                cache.reset_storage_jacobians();
            }
            return;
        }

        for row in 0..self.matrix.block_rows() {
            if self.coloring.dof_color(row) == EntityColor::Green {
                continue;
            }
            self.matrix.row_mut(row).fill(T::zero());
            if let Some(cache) = &mut self.storage {
                cache.reset_storage_jacobian(row);
            }
        }
    }
}
