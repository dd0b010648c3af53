//! Classification of degrees of freedom and cells into relinearization colors.
//!
//! Colors are computed by a fixed sequence of local passes separated by two border
//! reconciliations, see [`COLORING_SCHEDULE`]. Each pass only reads what previous passes wrote,
//! so every process performs the same sequence of collective operations.
use crate::color::EntityColor;
use crate::comm::{BorderInterface, CommError, Communicator};
use crate::local::DofMeasure;
use crate::stencil::Stencil;
use crate::Real;
use log::debug;
use nalgebra::DVectorView;
use rayon::prelude::*;
use std::cell::RefCell;
use thread_local::ThreadLocal;

/// A reconciliation of border degree of freedom colors across processes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BorderBarrier {
    /// A degree of freedom that is red on any process becomes red on all of them.
    PropagateRed,
    /// A degree of freedom that is still orange on any process stays orange on all of them,
    /// unless another process demoted it to green.
    ResolveOrange,
}

impl BorderBarrier {
    /// Combines the local color of a border degree of freedom with a remote one.
    pub fn combine(self, local: EntityColor, remote: EntityColor) -> EntityColor {
        match self {
            BorderBarrier::PropagateRed => local.min(remote),
            BorderBarrier::ResolveOrange => local.max(remote),
        }
    }
}

/// A single step of the coloring algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColoringStep {
    /// Degrees of freedom with an error above the tolerance become red. All others keep their
    /// color, which is green after an assembly unless they were explicitly marked red.
    SeedRedDofs,
    /// Cells touching a red degree of freedom become red, all others (provisionally) green.
    ClassifyRedCells,
    /// Non-red degrees of freedom of red cells become orange.
    TintOrangeDofs,
    Barrier(BorderBarrier),
    /// Non-red cells touching an orange degree of freedom become yellow.
    ClassifyYellowCells,
    /// Orange degrees of freedom of green cells become yellow.
    DemoteOrangeDofs,
    /// Degrees of freedom that are still orange become red.
    PromoteOrangeDofs,
}

/// The order in which [`ColoringEngine::compute_colors`] applies its steps.
pub const COLORING_SCHEDULE: [ColoringStep; 8] = [
    ColoringStep::SeedRedDofs,
    ColoringStep::ClassifyRedCells,
    ColoringStep::TintOrangeDofs,
    ColoringStep::Barrier(BorderBarrier::PropagateRed),
    ColoringStep::ClassifyYellowCells,
    ColoringStep::DemoteOrangeDofs,
    ColoringStep::Barrier(BorderBarrier::ResolveOrange),
    ColoringStep::PromoteOrangeDofs,
];

/// Number of entities of each color, indexed by color code.
pub fn count_colors(colors: &[EntityColor]) -> [usize; 4] {
    let mut counts = [0; 4];
    for color in colors {
        counts[color.code() as usize] += 1;
    }
    counts
}

/// Combines the colors of border degrees of freedom with the colors the neighboring
/// processes have for them.
pub fn reduce_border_colors<C: Communicator + ?Sized>(
    comm: &C,
    border: &BorderInterface,
    colors: &mut [EntityColor],
    barrier: BorderBarrier,
) -> Result<(), CommError> {
    if border.is_empty() {
        return Ok(());
    }

    let outgoing = border
        .neighbors()
        .iter()
        .map(|neighbor| {
            neighbor
                .dofs
                .iter()
                .map(|&dof| colors[dof].code())
                .collect()
        })
        .collect();
    let incoming = comm.exchange_border(border, outgoing)?;

    for (neighbor, payload) in border.neighbors().iter().zip(incoming) {
        if payload.len() != neighbor.dofs.len() {
            return Err(CommError::PayloadSizeMismatch {
                peer: neighbor.rank,
                expected: neighbor.dofs.len(),
                actual: payload.len(),
            });
        }
        for (&dof, code) in neighbor.dofs.iter().zip(payload) {
            let remote = EntityColor::from_code(code).ok_or(CommError::InvalidPayload { peer: neighbor.rank })?;
            colors[dof] = barrier.combine(colors[dof], remote);
        }
    }
    Ok(())
}

/// Per-DOF errors and per-DOF/per-cell colors of a process' partition.
///
/// When partial relinearization is disabled, no per-entity state is stored and every entity
/// reports [`EntityColor::Red`].
#[derive(Debug)]
pub struct ColoringEngine<T> {
    enabled: bool,
    dof_colors: Vec<EntityColor>,
    dof_errors: Vec<T>,
    cell_colors: Vec<EntityColor>,
    next_accuracy: T,
    workspace: ThreadLocal<RefCell<StencilWorkspace>>,
}

#[derive(Debug, Default)]
struct StencilWorkspace {
    dofs: Vec<usize>,
    colors: Vec<EntityColor>,
}

impl StencilWorkspace {
    fn update<S: Stencil + ?Sized>(&mut self, stencil: &S, cell: usize) {
        self.dofs.resize(stencil.cell_dof_count(cell), usize::MAX);
        stencil.populate_cell_dofs(&mut self.dofs, cell);
    }
}

impl<T: Real> ColoringEngine<T> {
    /// Creates an engine where every entity is red and every error is zero.
    pub fn new(num_dofs: usize, num_cells: usize, enabled: bool) -> Self {
        let (num_dofs, num_cells) = if enabled { (num_dofs, num_cells) } else { (0, 0) };
        Self {
            enabled,
            dof_colors: vec![EntityColor::Red; num_dofs],
            dof_errors: vec![T::zero(); num_dofs],
            cell_colors: vec![EntityColor::Red; num_cells],
            next_accuracy: T::zero(),
            workspace: ThreadLocal::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dof_color(&self, dof: usize) -> EntityColor {
        if self.enabled {
            self.dof_colors[dof]
        } else {
            EntityColor::Red
        }
    }

    pub fn cell_color(&self, cell: usize) -> EntityColor {
        if self.enabled {
            self.cell_colors[cell]
        } else {
            EntityColor::Red
        }
    }

    /// The stored colors of all degrees of freedom. Empty if disabled.
    pub fn dof_colors(&self) -> &[EntityColor] {
        &self.dof_colors
    }

    /// The stored colors of all cells. Empty if disabled.
    pub fn cell_colors(&self) -> &[EntityColor] {
        &self.cell_colors
    }

    pub fn dof_error(&self, dof: usize) -> T {
        if self.enabled {
            self.dof_errors[dof]
        } else {
            T::zero()
        }
    }

    /// The largest error among degrees of freedom that were not relinearized,
    /// as determined by the last call to [`compute_colors`](Self::compute_colors).
    pub fn next_accuracy(&self) -> T {
        self.next_accuracy
    }

    /// Marks every entity red and forgets accumulated errors.
    pub fn relinearize_all(&mut self) {
        self.next_accuracy = T::zero();
        self.dof_errors.fill(T::zero());
        self.dof_colors.fill(EntityColor::Red);
        self.cell_colors.fill(EntityColor::Red);
    }

    /// Resets all degree of freedom colors to green. Cell colors are left untouched.
    ///
    /// Called after every assembly, so that the next coloring starts from green.
    pub fn reset_dof_colors(&mut self) {
        self.dof_colors.fill(EntityColor::Green);
    }

    /// Forces the given degree of freedom to be red in the next call to
    /// [`compute_colors`](Self::compute_colors).
    pub fn mark_dof_red(&mut self, dof: usize) {
        if self.enabled {
            self.dof_colors[dof] = EntityColor::Red;
        }
    }

    /// Updates the per-DOF error from a Newton update.
    ///
    /// The error of a degree of freedom is the largest weighted magnitude of its entries in
    /// `update`. Degrees of freedom without volume get zero error.
    ///
    /// # Panics
    ///
    /// Panics if `update` does not have `num_eq` entries per degree of freedom.
    pub fn update_discrepancy<M>(&mut self, measure: &M, update: DVectorView<T>, num_eq: usize)
    where
        M: DofMeasure<T> + ?Sized,
    {
        if !self.enabled {
            return;
        }
        assert_eq!(
            update.len(),
            num_eq * self.dof_errors.len(),
            "Update must have num_eq entries per degree of freedom."
        );

        for (dof, error) in self.dof_errors.iter_mut().enumerate() {
            *error = if measure.dof_total_volume(dof) <= T::zero() {
                T::zero()
            } else {
                (0..num_eq)
                    .map(|eq| (update[dof * num_eq + eq] * measure.equation_weight(dof, eq)).abs())
                    .fold(T::zero(), T::max)
            };
        }
    }

    /// Recomputes all colors for the given tolerance.
    ///
    /// This is a collective operation: every process of the communicator must call it.
    pub fn compute_colors<S, C>(
        &mut self,
        stencil: &S,
        comm: &C,
        border: &BorderInterface,
        tolerance: T,
    ) -> Result<(), CommError>
    where
        S: Stencil + Sync + ?Sized,
        C: Communicator + ?Sized,
    {
        if !self.enabled {
            return Ok(());
        }
        assert_eq!(stencil.num_dofs(), self.dof_colors.len(), "Stencil does not match coloring");
        assert_eq!(stencil.num_cells(), self.cell_colors.len(), "Stencil does not match coloring");

        for step in COLORING_SCHEDULE {
            self.apply_step(step, stencil, comm, border, tolerance)?;
        }

        let dofs = count_colors(&self.dof_colors);
        let cells = count_colors(&self.cell_colors);
        debug!(
            "Colors: {} red, {} yellow, {} green DOFs; {} red, {} yellow, {} green cells",
            dofs[0], dofs[1], dofs[3], cells[0], cells[1], cells[3]
        );
        Ok(())
    }

    fn apply_step<S, C>(
        &mut self,
        step: ColoringStep,
        stencil: &S,
        comm: &C,
        border: &BorderInterface,
        tolerance: T,
    ) -> Result<(), CommError>
    where
        S: Stencil + Sync + ?Sized,
        C: Communicator + ?Sized,
    {
        use ColoringStep::*;
        match step {
            SeedRedDofs => self.seed_red_dofs(tolerance),
            ClassifyRedCells => self.classify_cells(stencil, |_, dof_colors| {
                if dof_colors.contains(&EntityColor::Red) {
                    EntityColor::Red
                } else {
                    EntityColor::Green
                }
            }),
            TintOrangeDofs => self.recolor_cell_dofs(stencil, EntityColor::Red, |color| {
                (color != EntityColor::Red).then_some(EntityColor::Orange)
            }),
            Barrier(barrier) => reduce_border_colors(comm, border, &mut self.dof_colors, barrier)?,
            ClassifyYellowCells => self.classify_cells(stencil, |current, dof_colors| {
                if current != EntityColor::Red && dof_colors.contains(&EntityColor::Orange) {
                    EntityColor::Yellow
                } else {
                    current
                }
            }),
            DemoteOrangeDofs => self.recolor_cell_dofs(stencil, EntityColor::Green, |color| {
                (color == EntityColor::Orange).then_some(EntityColor::Yellow)
            }),
            PromoteOrangeDofs => self.promote_orange_dofs(),
        }
        Ok(())
    }

    fn seed_red_dofs(&mut self, tolerance: T) {
        self.next_accuracy = T::zero();
        for (color, &error) in self.dof_colors.iter_mut().zip(&self.dof_errors) {
            if error > tolerance {
                *color = EntityColor::Red;
            } else {
                self.next_accuracy = self.next_accuracy.max(error);
            }
        }
    }

    /// Assigns every cell the color returned by `classify` for its current color and the colors
    /// of its stencil.
    fn classify_cells<S, F>(&mut self, stencil: &S, classify: F)
    where
        S: Stencil + Sync + ?Sized,
        F: Fn(EntityColor, &[EntityColor]) -> EntityColor + Sync,
    {
        let Self {
            dof_colors,
            cell_colors,
            workspace,
            ..
        } = self;
        let dof_colors = &*dof_colors;
        let workspace = &*workspace;
        cell_colors
            .par_iter_mut()
            .with_min_len(64)
            .enumerate()
            .for_each(|(cell, cell_color)| {
                let ws = &mut *workspace.get_or_default().borrow_mut();
                ws.update(stencil, cell);
                ws.colors.clear();
                ws.colors.extend(ws.dofs.iter().map(|&dof| dof_colors[dof]));
                *cell_color = classify(*cell_color, &ws.colors);
            });
    }

    /// Applies `recolor` to the degrees of freedom of all cells with the given color.
    fn recolor_cell_dofs<S, F>(&mut self, stencil: &S, cell_color: EntityColor, recolor: F)
    where
        S: Stencil + ?Sized,
        F: Fn(EntityColor) -> Option<EntityColor>,
    {
        // Cells share degrees of freedom, so this pass stays sequential
        let ws = &mut *self.workspace.get_or_default().borrow_mut();
        for cell in 0..self.cell_colors.len() {
            if self.cell_colors[cell] != cell_color {
                continue;
            }
            ws.update(stencil, cell);
            for &dof in &ws.dofs {
                if let Some(color) = recolor(self.dof_colors[dof]) {
                    self.dof_colors[dof] = color;
                }
            }
        }
    }

    fn promote_orange_dofs(&mut self) {
        for (color, error) in self.dof_colors.iter_mut().zip(&mut self.dof_errors) {
            match *color {
                EntityColor::Green | EntityColor::Yellow => {}
                EntityColor::Red | EntityColor::Orange => {
                    // Relinearized now, so the accumulated error is retired
                    *color = EntityColor::Red;
                    *error = T::zero();
                }
            }
        }
    }
}
