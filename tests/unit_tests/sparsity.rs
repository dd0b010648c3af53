use crate::table_from_stencils;
use fvrelin::sparsity::assemble_block_pattern;
use fvrelin::stencil::{CellDofTable, Stencil};
use proptest::prelude::*;
use std::collections::BTreeSet;
use util::{cell_centered_grid, cell_centered_line, vertex_centered_line};

fn pattern_rows(table: &CellDofTable) -> Vec<Vec<usize>> {
    let pattern = assemble_block_pattern(table);
    (0..pattern.major_dim())
        .map(|row| pattern.lane(row).to_vec())
        .collect()
}

#[test]
fn cell_centered_line_is_tridiagonal() {
    let table = table_from_stencils(4, &cell_centered_line(4));
    assert_eq!(
        pattern_rows(&table),
        vec![vec![0, 1], vec![0, 1, 2], vec![1, 2, 3], vec![2, 3]]
    );
}

#[test]
fn vertex_centered_line_merges_shared_couplings() {
    // Vertex 1 is primary in both cells and sees the diagonal coupling twice
    let table = table_from_stencils(3, &vertex_centered_line(2));
    assert_eq!(pattern_rows(&table), vec![vec![0, 1], vec![0, 1, 2], vec![1, 2]]);
}

#[test]
fn cell_centered_grid_has_five_point_rows() {
    let table = table_from_stencils(9, &cell_centered_grid(3, 3));
    let rows = pattern_rows(&table);
    assert_eq!(rows[4], vec![1, 3, 4, 5, 7]);
    assert_eq!(rows[0], vec![0, 1, 3]);
    assert_eq!(rows[8], vec![5, 7, 8]);
}

#[test]
fn non_primary_dofs_have_empty_rows() {
    let mut table = CellDofTable::new(3);
    table.push_cell(&[0, 2], 1);
    table.push_cell(&[1, 2], 1);
    assert_eq!(pattern_rows(&table), vec![vec![0, 2], vec![1, 2], vec![]]);
}

proptest! {
    #[test]
    fn pattern_contains_exactly_the_stencil_couplings(table in any::<CellDofTable>()) {
        let mut expected = BTreeSet::new();
        for cell in 0..table.num_cells() {
            let dofs = table.cell_dofs(cell).unwrap();
            let num_primary = table.cell_primary_dof_count(cell);
            for &i in &dofs[..num_primary] {
                for &j in dofs {
                    expected.insert((i, j));
                }
            }
        }

        let pattern = assemble_block_pattern(&table);
        prop_assert_eq!(pattern.major_dim(), table.num_dofs());
        let actual: BTreeSet<_> = pattern.entries().collect();
        prop_assert_eq!(actual, expected);
    }
}
