//! A small nonlinear reaction-diffusion model used to drive the assembler in tests.
use eyre::eyre;
use fvrelin::local::{CellContext, DofMeasure, LocalLinearization, LocalOperator, LocalResidual};
use fvrelin::stencil::{CellDofTable, Stencil};
use nalgebra::DVector;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per primary degree of freedom `i` of a cell with volume share `V` and equation `e`:
///
/// ```text
/// r_e = V (u_e - u_old_e) / dt                                 (storage)
///     + sum_{j in stencil, j != i} k (u_e - u_j_e)             (flux)
///     + V (c u_e^3 + a (u_e - u_{e+1}) - f_i)                  (reaction)
/// ```
///
/// where the coupling `a` between equations is only present for `num_eq > 1`.
#[derive(Debug)]
pub struct ReactionDiffusion {
    pub table: CellDofTable,
    pub num_eq: usize,
    pub conductivity: f64,
    pub reaction: f64,
    pub coupling: f64,
    pub cell_volume: f64,
    /// One source value per degree of freedom.
    pub source: Vec<f64>,
    pub previous_solution: DVector<f64>,
    pub failing_cell: Option<usize>,
    dof_volumes: Vec<f64>,
    full_evaluations: AtomicUsize,
    residual_evaluations: AtomicUsize,
}

impl ReactionDiffusion {
    pub fn new(table: CellDofTable, num_eq: usize) -> Self {
        let num_dofs = table.num_dofs();
        let cell_volume = 1.0;
        let mut dof_volumes = vec![0.0; num_dofs];
        for cell in 0..table.num_cells() {
            let num_primary = table.cell_primary_dof_count(cell);
            let dofs = table.cell_dofs(cell).unwrap();
            for &dof in &dofs[..num_primary] {
                dof_volumes[dof] += cell_volume / num_primary as f64;
            }
        }

        Self {
            table,
            num_eq,
            conductivity: 1.0,
            reaction: 1.0,
            coupling: if num_eq > 1 { 0.5 } else { 0.0 },
            cell_volume,
            source: vec![1.0; num_dofs],
            previous_solution: DVector::zeros(num_dofs * num_eq),
            failing_cell: None,
            dof_volumes,
            full_evaluations: AtomicUsize::new(0),
            residual_evaluations: AtomicUsize::new(0),
        }
    }

    pub fn with_source(mut self, source: Vec<f64>) -> Self {
        assert_eq!(source.len(), self.table.num_dofs());
        self.source = source;
        self
    }

    pub fn with_failing_cell(mut self, cell: usize) -> Self {
        self.failing_cell = Some(cell);
        self
    }

    pub fn num_unknowns(&self) -> usize {
        self.num_eq * self.table.num_dofs()
    }

    pub fn full_evaluations(&self) -> usize {
        self.full_evaluations.load(Ordering::SeqCst)
    }

    pub fn residual_evaluations(&self) -> usize {
        self.residual_evaluations.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.full_evaluations.store(0, Ordering::SeqCst);
        self.residual_evaluations.store(0, Ordering::SeqCst);
    }

    fn volume_share(&self, context: &CellContext<f64>) -> f64 {
        self.cell_volume / context.num_primary_dofs as f64
    }

    fn check_cell(&self, cell: usize) -> eyre::Result<()> {
        if self.failing_cell == Some(cell) {
            Err(eyre!("non-physical state in cell {}", cell))
        } else {
            Ok(())
        }
    }

    fn evaluate_residual(&self, context: &CellContext<f64>, output: &mut LocalResidual<f64>) {
        let m = self.num_eq;
        let v = self.volume_share(context);
        let dt = context.time_step_size;
        for p in 0..context.num_primary_dofs {
            let global = context.dofs[p];
            let u = context.dof_values(p).clone_owned();
            let u_old = self.previous_solution.rows(global * m, m);
            for e in 0..m {
                let storage = v * (u[e] - u_old[e]) / dt;
                let mut flux = 0.0;
                for q in (0..context.num_dofs()).filter(|&q| q != p) {
                    flux += self.conductivity * (u[e] - context.dof_values(q)[e]);
                }
                let coupled = if m > 1 { self.coupling * (u[e] - u[(e + 1) % m]) } else { 0.0 };
                let reaction = v * (self.reaction * u[e].powi(3) + coupled - self.source[global]);
                output.storage_term_mut(p)[e] = storage;
                output.residual_mut(p)[e] = storage + flux + reaction;
            }
        }
    }
}

impl Stencil for ReactionDiffusion {
    fn num_cells(&self) -> usize {
        self.table.num_cells()
    }

    fn num_dofs(&self) -> usize {
        self.table.num_dofs()
    }

    fn cell_dof_count(&self, cell: usize) -> usize {
        self.table.cell_dof_count(cell)
    }

    fn cell_primary_dof_count(&self, cell: usize) -> usize {
        self.table.cell_primary_dof_count(cell)
    }

    fn populate_cell_dofs(&self, output: &mut [usize], cell: usize) {
        self.table.populate_cell_dofs(output, cell)
    }

    fn is_interior_cell(&self, cell: usize) -> bool {
        self.table.is_interior_cell(cell)
    }
}

impl LocalOperator<f64> for ReactionDiffusion {
    fn num_eq(&self) -> usize {
        self.num_eq
    }

    fn evaluate_full(&self, context: &CellContext<f64>, output: &mut LocalLinearization<f64>) -> eyre::Result<()> {
        self.full_evaluations.fetch_add(1, Ordering::SeqCst);
        self.check_cell(context.cell)?;
        self.evaluate_residual(context, output.residual_mut());

        let m = self.num_eq;
        let v = self.volume_share(context);
        let dt = context.time_step_size;
        let num_neighbors = (context.num_dofs() - 1) as f64;
        for p in 0..context.num_primary_dofs {
            let u = context.dof_values(p).clone_owned();
            for q in 0..context.num_dofs() {
                let mut block = output.jacobian_block_mut(p, q);
                for e in 0..m {
                    if q == p {
                        let coupled = if m > 1 { self.coupling } else { 0.0 };
                        let reaction = 3.0 * self.reaction * u[e].powi(2) + coupled;
                        block[(e, e)] = v / dt + self.conductivity * num_neighbors + v * reaction;
                        if m > 1 {
                            block[(e, (e + 1) % m)] -= v * self.coupling;
                        }
                    } else {
                        block[(e, e)] = -self.conductivity;
                    }
                }
            }
            output.storage_jacobian_mut(p).fill_diagonal(v / dt);
        }
        Ok(())
    }

    fn evaluate_residual_only(&self, context: &CellContext<f64>, output: &mut LocalResidual<f64>) -> eyre::Result<()> {
        self.residual_evaluations.fetch_add(1, Ordering::SeqCst);
        self.check_cell(context.cell)?;
        self.evaluate_residual(context, output);
        Ok(())
    }
}

impl DofMeasure<f64> for ReactionDiffusion {
    fn dof_total_volume(&self, dof: usize) -> f64 {
        self.dof_volumes[dof]
    }
}
