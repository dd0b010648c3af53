//! Cell-to-DOF coupling as seen by the assembler.
use serde::{Deserialize, Serialize};

/// Provides the degrees of freedom each cell of a (local) mesh partition couples to.
///
/// For every cell, the stencil lists the global indices of all degrees of freedom the cell's
/// local equations depend on. The first [`cell_primary_dof_count`](Self::cell_primary_dof_count)
/// entries are the *primary* degrees of freedom: those whose equations the cell contributes to.
pub trait Stencil {
    fn num_cells(&self) -> usize;

    fn num_dofs(&self) -> usize;

    fn cell_dof_count(&self, cell: usize) -> usize;

    fn cell_primary_dof_count(&self, cell: usize) -> usize;

    fn populate_cell_dofs(&self, output: &mut [usize], cell: usize);

    /// Whether the cell belongs to the interior of this process' partition.
    ///
    /// Only interior cells are assembled. Overlap and ghost cells still take part in
    /// coloring.
    fn is_interior_cell(&self, _cell: usize) -> bool {
        true
    }
}

impl<S: Stencil + ?Sized> Stencil for &S {
    fn num_cells(&self) -> usize {
        S::num_cells(self)
    }

    fn num_dofs(&self) -> usize {
        S::num_dofs(self)
    }

    fn cell_dof_count(&self, cell: usize) -> usize {
        S::cell_dof_count(self, cell)
    }

    fn cell_primary_dof_count(&self, cell: usize) -> usize {
        S::cell_primary_dof_count(self, cell)
    }

    fn populate_cell_dofs(&self, output: &mut [usize], cell: usize) {
        S::populate_cell_dofs(self, output, cell)
    }

    fn is_interior_cell(&self, cell: usize) -> bool {
        S::is_interior_cell(self, cell)
    }
}

/// A cursor that holds the stencil of one cell at a time.
///
/// The view owns its index buffer, so updating it repeatedly does not allocate once the buffer
/// has grown to the largest stencil.
#[derive(Debug)]
pub struct StencilView<'a, S: ?Sized> {
    stencil: &'a S,
    dofs: Vec<usize>,
    num_primary: usize,
}

impl<'a, S: Stencil + ?Sized> StencilView<'a, S> {
    pub fn new(stencil: &'a S) -> Self {
        Self {
            stencil,
            dofs: Vec::new(),
            num_primary: 0,
        }
    }

    /// Makes the view refer to the given cell.
    pub fn update(&mut self, cell: usize) {
        let count = self.stencil.cell_dof_count(cell);
        self.dofs.resize(count, usize::MAX);
        self.stencil.populate_cell_dofs(&mut self.dofs, cell);
        self.num_primary = self.stencil.cell_primary_dof_count(cell);
        debug_assert!(self.num_primary <= count);
    }

    pub fn num_dof(&self) -> usize {
        self.dofs.len()
    }

    pub fn num_primary_dof(&self) -> usize {
        self.num_primary
    }

    pub fn global_space_index(&self, local_index: usize) -> usize {
        self.dofs[local_index]
    }

    pub fn dofs(&self) -> &[usize] {
        &self.dofs
    }

    pub fn primary_dofs(&self) -> &[usize] {
        &self.dofs[..self.num_primary]
    }
}

/// An explicit table of cell stencils, stored compactly.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CellDofTable {
    num_dofs: usize,
    offsets: Vec<usize>,
    dofs: Vec<usize>,
    num_primary: Vec<usize>,
    interior: Vec<bool>,
}

impl CellDofTable {
    pub fn new(num_dofs: usize) -> Self {
        Self {
            num_dofs,
            offsets: vec![0],
            dofs: Vec::new(),
            num_primary: Vec::new(),
            interior: Vec::new(),
        }
    }

    /// Appends an interior cell and returns its index.
    ///
    /// # Panics
    ///
    /// Panics if a degree of freedom index is out of bounds or if `num_primary` exceeds the
    /// number of degrees of freedom of the cell.
    pub fn push_cell(&mut self, dofs: &[usize], num_primary: usize) -> usize {
        assert!(
            num_primary <= dofs.len(),
            "Number of primary degrees of freedom must not exceed stencil size."
        );
        assert!(
            dofs.iter().all(|&dof| dof < self.num_dofs),
            "Degree of freedom index out of bounds."
        );
        self.dofs.extend_from_slice(dofs);
        self.offsets.push(self.dofs.len());
        self.num_primary.push(num_primary);
        self.interior.push(true);
        self.num_primary.len() - 1
    }

    /// Appends a cell that is not part of this partition's interior and returns its index.
    pub fn push_ghost_cell(&mut self, dofs: &[usize], num_primary: usize) -> usize {
        let cell = self.push_cell(dofs, num_primary);
        self.interior[cell] = false;
        cell
    }

    pub fn cell_dofs(&self, cell: usize) -> Option<&[usize]> {
        let begin = *self.offsets.get(cell)?;
        let end = *self.offsets.get(cell + 1)?;
        Some(&self.dofs[begin..end])
    }
}

impl Stencil for CellDofTable {
    fn num_cells(&self) -> usize {
        self.num_primary.len()
    }

    fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    fn cell_dof_count(&self, cell: usize) -> usize {
        self.offsets[cell + 1] - self.offsets[cell]
    }

    fn cell_primary_dof_count(&self, cell: usize) -> usize {
        self.num_primary[cell]
    }

    fn populate_cell_dofs(&self, output: &mut [usize], cell: usize) {
        let dofs = self
            .cell_dofs(cell)
            .expect("Cell index out of bounds");
        output.copy_from_slice(dofs);
    }

    fn is_interior_cell(&self, cell: usize) -> bool {
        self.interior[cell]
    }
}
