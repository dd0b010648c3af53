//! Test helpers shared by the crates in the workspace.

#[macro_export]
macro_rules! assert_panics {
    ($e:expr) => {{
        use std::panic::catch_unwind;
        use std::stringify;
        let expr_string = stringify!($e);
        let result = catch_unwind(|| $e);
        if result.is_ok() {
            panic!("assert_panics!({}) failed.", expr_string);
        }
    }};
}

/// The degrees of freedom a single cell couples to.
///
/// The first `num_primary` entries of `dofs` are the degrees of freedom whose equations the
/// cell contributes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellStencil {
    pub dofs: Vec<usize>,
    pub num_primary: usize,
}

/// Stencils of a cell-centered finite volume discretization of the unit interval
/// with `num_cells` cells.
///
/// Every cell owns exactly one degree of freedom (its own index) and couples to its left and
/// right neighbors.
pub fn cell_centered_line(num_cells: usize) -> Vec<CellStencil> {
    (0..num_cells)
        .map(|i| {
            let mut dofs = vec![i];
            if i > 0 {
                dofs.push(i - 1);
            }
            if i + 1 < num_cells {
                dofs.push(i + 1);
            }
            CellStencil { dofs, num_primary: 1 }
        })
        .collect()
}

/// Stencils of a vertex-centered (box) discretization of the unit interval with `num_cells`
/// cells and `num_cells + 1` vertices.
///
/// Every cell contributes to the equations of both of its vertices.
pub fn vertex_centered_line(num_cells: usize) -> Vec<CellStencil> {
    (0..num_cells)
        .map(|i| CellStencil {
            dofs: vec![i, i + 1],
            num_primary: 2,
        })
        .collect()
}

/// Stencils of a cell-centered discretization of a structured `nx x ny` grid with a
/// five-point (face neighbor) stencil. Cells are numbered row by row.
pub fn cell_centered_grid(nx: usize, ny: usize) -> Vec<CellStencil> {
    let mut stencils = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            let idx = j * nx + i;
            let mut dofs = vec![idx];
            if i > 0 {
                dofs.push(idx - 1);
            }
            if i + 1 < nx {
                dofs.push(idx + 1);
            }
            if j > 0 {
                dofs.push(idx - nx);
            }
            if j + 1 < ny {
                dofs.push(idx + nx);
            }
            stencils.push(CellStencil { dofs, num_primary: 1 });
        }
    }
    stencils
}
