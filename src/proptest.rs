//! Strategies for generating stencils and discrepancies in property tests.
use crate::stencil::{CellDofTable, Stencil};
use ::proptest::collection::vec;
use ::proptest::prelude::*;

/// Parameters for generating arbitrary [`CellDofTable`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellDofTableParams {
    pub max_dofs: usize,
    pub max_cells: usize,
    pub max_stencil_size: usize,
}

impl Default for CellDofTableParams {
    fn default() -> Self {
        Self {
            max_dofs: 20,
            max_cells: 20,
            max_stencil_size: 5,
        }
    }
}

impl Arbitrary for CellDofTable {
    type Parameters = CellDofTableParams;
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(params: Self::Parameters) -> Self::Strategy {
        let CellDofTableParams {
            max_dofs,
            max_cells,
            max_stencil_size,
        } = params;
        assert!(max_dofs >= 1 && max_stencil_size >= 1);
        (1..=max_dofs)
            .prop_flat_map(move |num_dofs| {
                let cell = (vec(0..num_dofs, 1..=max_stencil_size), 1..=max_stencil_size);
                (Just(num_dofs), vec(cell, 0..=max_cells))
            })
            .prop_map(|(num_dofs, cells)| {
                let mut table = CellDofTable::new(num_dofs);
                for (mut dofs, num_primary) in cells {
                    // A stencil lists every degree of freedom once, in order of first appearance
                    let mut seen = vec![false; num_dofs];
                    dofs.retain(|&dof| !std::mem::replace(&mut seen[dof], true));
                    let num_primary = num_primary.min(dofs.len());
                    table.push_cell(&dofs, num_primary);
                }
                table
            })
            .boxed()
    }
}

/// A stencil table together with one non-negative discrepancy per degree of freedom.
pub fn table_with_dof_errors(params: CellDofTableParams) -> impl Strategy<Value = (CellDofTable, Vec<f64>)> {
    any_with::<CellDofTable>(params).prop_flat_map(|table| {
        let num_dofs = table.num_dofs();
        (Just(table), vec(0.0..1.0, num_dofs))
    })
}
