//! Block sparsity pattern of the global Jacobian.
use crate::stencil::{Stencil, StencilView};
use nalgebra_sparse::pattern::SparsityPattern;
use rustc_hash::FxHashSet;

/// Builds the block sparsity pattern of the Jacobian of the given stencil.
///
/// Block row `i` has a stored block in column `j` whenever some cell has `i` among its
/// primary degrees of freedom and `j` anywhere in its stencil. Rows of degrees of freedom that
/// are not primary in any cell are empty, and no diagonal block is added on top of what the
/// stencils couple.
///
/// # Panics
///
/// Panics if a stencil refers to a degree of freedom outside of `0 .. num_dofs`.
pub fn assemble_block_pattern<S: Stencil + ?Sized>(stencil: &S) -> SparsityPattern {
    let num_dofs = stencil.num_dofs();

    // Duplicate couplings are common (every face is seen from two cells), so we collect
    // neighbors per row in a set and only then commit the row sizes
    let mut neighbors = vec![FxHashSet::default(); num_dofs];
    let mut view = StencilView::new(stencil);
    for cell in 0..stencil.num_cells() {
        view.update(cell);
        assert!(
            view.dofs().iter().all(|&dof| dof < num_dofs),
            "Stencil of cell {} refers to a degree of freedom out of bounds.",
            cell
        );
        for &row in view.primary_dofs() {
            neighbors[row].extend(view.dofs().iter().copied());
        }
    }

    let mut offsets = Vec::with_capacity(num_dofs + 1);
    offsets.push(0);
    for row_neighbors in &neighbors {
        offsets.push(offsets[offsets.len() - 1] + row_neighbors.len());
    }

    let mut column_indices = Vec::with_capacity(offsets[num_dofs]);
    for row_neighbors in neighbors {
        let row_begin = column_indices.len();
        column_indices.extend(row_neighbors);
        column_indices[row_begin..].sort_unstable();
    }

    SparsityPattern::try_from_offsets_and_indices(num_dofs, num_dofs, offsets, column_indices)
        .expect("Offsets and sorted unique column indices always form a valid pattern")
}
