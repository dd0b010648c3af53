use crate::table_from_stencils;
use crate::unit_tests::mock::ReactionDiffusion;
use fvrelin::comm::{BorderInterface, SerialCommunicator};
use fvrelin::stencil::CellDofTable;
use fvrelin::{AssemblerSettings, AssemblyError, EntityColor, JacobianAssembler};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use util::{cell_centered_line, vertex_centered_line};

type SerialAssembler = JacobianAssembler<f64, SerialCommunicator>;

fn assembler(model: &ReactionDiffusion, settings: AssemblerSettings) -> SerialAssembler {
    JacobianAssembler::init(model, settings, SerialCommunicator, BorderInterface::new()).unwrap()
}

fn partial() -> AssemblerSettings {
    AssemblerSettings::default().with_partial_relinearization(true)
}

fn line_model(num_cells: usize, num_eq: usize) -> ReactionDiffusion {
    ReactionDiffusion::new(table_from_stencils(num_cells, &cell_centered_line(num_cells)), num_eq)
}

/// A smooth, non-trivial state.
fn test_solution(n: usize) -> DVector<f64> {
    DVector::from_fn(n, |i, _| 0.3 + 0.1 * (i as f64).sin())
}

/// Full assembly with partial relinearization disabled.
fn reference_system(model: &ReactionDiffusion, solution: &DVector<f64>, dt: f64) -> (DMatrix<f64>, DVector<f64>) {
    let mut assembler = assembler(model, AssemblerSettings::default());
    assembler.assemble(model, solution.as_view(), dt).unwrap();
    (assembler.matrix().to_dense(), assembler.residual().clone())
}

fn finite_difference_jacobian(model: &ReactionDiffusion, solution: &DVector<f64>, dt: f64) -> DMatrix<f64> {
    let h = 1e-6;
    let n = solution.len();
    let mut jacobian = DMatrix::zeros(n, n);
    for j in 0..n {
        let mut plus = solution.clone();
        let mut minus = solution.clone();
        plus[j] += h;
        minus[j] -= h;
        let (_, r_plus) = reference_system(model, &plus, dt);
        let (_, r_minus) = reference_system(model, &minus, dt);
        jacobian.set_column(j, &((r_plus - r_minus) / (2.0 * h)));
    }
    jacobian
}

#[test]
fn full_assembly_matches_finite_differences() {
    let dt = 0.5;
    for model in [line_model(5, 1), line_model(4, 2)] {
        let solution = test_solution(model.num_unknowns());
        let (jacobian, _) = reference_system(&model, &solution, dt);
        let fd_jacobian = finite_difference_jacobian(&model, &solution, dt);
        assert_matrix_eq!(jacobian, fd_jacobian, comp = abs, tol = 1e-6);
    }

    // Vertex-centered: every cell contributes to two rows
    let model = ReactionDiffusion::new(table_from_stencils(5, &vertex_centered_line(4)), 1);
    let solution = test_solution(5);
    let (jacobian, _) = reference_system(&model, &solution, dt);
    let fd_jacobian = finite_difference_jacobian(&model, &solution, dt);
    assert_matrix_eq!(jacobian, fd_jacobian, comp = abs, tol = 1e-6);
}

#[test]
fn first_partial_assembly_equals_full_assembly() {
    let model = line_model(10, 2);
    let solution = test_solution(model.num_unknowns());
    let mut full = assembler(&model, AssemblerSettings::default());
    let mut part = assembler(&model, partial());

    let full_report = full.assemble(&model, solution.as_view(), 0.1).unwrap();
    let part_report = part.assemble(&model, solution.as_view(), 0.1).unwrap();

    // Everything starts out red, so the same floating point operations happen in the same order
    assert_eq!(full.matrix().values(), part.matrix().values());
    assert_eq!(full.residual(), part.residual());
    assert_eq!(full_report.relinearized_cells, 10);
    assert_eq!(part_report.relinearized_cells, 10);
    assert_eq!(part_report.total_cells, 10);
    assert!(!part_report.recycled);
}

#[test]
fn disabled_partial_relinearization_reports_red() {
    let model = line_model(4, 1);
    let mut assembler = assembler(&model, AssemblerSettings::default());
    assembler.assemble(&model, test_solution(4).as_view(), 1.0).unwrap();
    assert!((0..4).all(|i| assembler.dof_color(i) == EntityColor::Red));
    assert!((0..4).all(|i| assembler.cell_color(i) == EntityColor::Red));

    // Coloring requests are ignored
    assembler.update_discrepancy(&model, DVector::zeros(4).as_view());
    assembler.compute_colors(&model, 1e-6).unwrap();
    assert_eq!(assembler.cell_color(2), EntityColor::Red);

    model.reset_counters();
    let report = assembler.assemble(&model, test_solution(4).as_view(), 1.0).unwrap();
    assert_eq!(model.full_evaluations(), 4);
    assert_eq!(model.residual_evaluations(), 0);
    assert_eq!(report.relinearized_cells, 4);
}

#[test]
fn green_cells_only_update_the_residual() {
    let model = line_model(10, 1);
    let mut assembler = assembler(&model, partial());
    let solution = test_solution(10);
    assembler.assemble(&model, solution.as_view(), 1.0).unwrap();
    let old_matrix = assembler.matrix().clone();

    // All discrepancies below tolerance
    let update = DVector::from_element(10, 1e-8);
    assembler.update_discrepancy(&model, update.as_view());
    assembler.compute_colors(&model, 1e-6).unwrap();
    assert!((0..10).all(|i| assembler.cell_color(i) == EntityColor::Green));

    let new_solution = &solution - &update;
    model.reset_counters();
    let report = assembler.assemble(&model, new_solution.as_view(), 1.0).unwrap();

    assert_eq!(model.full_evaluations(), 0);
    assert_eq!(model.residual_evaluations(), 10);
    assert_eq!(report.relinearized_cells, 0);
    assert_eq!(report.accuracy, 1e-8);
    assert_eq!(assembler.relinearization_accuracy(), 1e-8);
    assert_eq!(assembler.matrix(), &old_matrix);

    let (_, expected_residual) = reference_system(&model, &new_solution, 1.0);
    assert_matrix_eq!(assembler.residual().clone(), expected_residual, comp = abs, tol = 1e-14);
}

#[test]
fn red_dof_relinearizes_only_its_rows() {
    let model = line_model(10, 1);
    let mut assembler = assembler(&model, partial());
    let solution = test_solution(10);
    assembler.assemble(&model, solution.as_view(), 1.0).unwrap();
    let old_matrix = assembler.matrix().to_dense();

    let mut update = DVector::zeros(10);
    update[4] = 0.2;
    assembler.update_discrepancy(&model, update.as_view());
    assembler.compute_colors(&model, 1e-6).unwrap();

    let new_solution = &solution - &update;
    model.reset_counters();
    let report = assembler.assemble(&model, new_solution.as_view(), 1.0).unwrap();

    // Cells 1..=7 are red or yellow
    assert_eq!(report.relinearized_cells, 7);
    assert_eq!(model.full_evaluations(), 7);
    assert_eq!(model.residual_evaluations(), 3);

    let (expected_matrix, expected_residual) = reference_system(&model, &new_solution, 1.0);
    let matrix = assembler.matrix().to_dense();
    for row in 0..10 {
        if (2..=6).contains(&row) {
            assert_eq!(matrix.row(row), expected_matrix.row(row));
        } else {
            assert_eq!(matrix.row(row), old_matrix.row(row));
        }
    }
    assert_matrix_eq!(assembler.residual().clone(), expected_residual, comp = abs, tol = 1e-14);

    // Colors only steer a single assembly
    assert!((0..10).all(|i| assembler.dof_color(i) == EntityColor::Green));
    assert_eq!(assembler.cell_color(4), EntityColor::Red);
}

#[test]
fn mark_dof_red_after_coloring_empties_row() {
    let model = line_model(5, 1);
    let mut assembler = assembler(&model, partial());
    let solution = test_solution(5);
    assembler.assemble(&model, solution.as_view(), 1.0).unwrap();

    // Colors are computed for a tiny change everywhere, so every cell is green
    let update = DVector::from_element(5, 1e-9);
    assembler.update_discrepancy(&model, update.as_view());
    assembler.compute_colors(&model, 1e-6).unwrap();
    assembler.mark_dof_red(2);

    // Row 2 is reset, but only non-green cells write Jacobian rows
    let new_solution = &solution - &update;
    assembler.assemble(&model, new_solution.as_view(), 1.0).unwrap();
    let matrix = assembler.matrix().to_dense();
    assert!(matrix.row(2).iter().all(|&x| x == 0.0));
    assert!(matrix.row(1).iter().any(|&x| x != 0.0));
}

#[test]
fn dof_marked_before_coloring_relinearizes_its_neighborhood() {
    let model = line_model(10, 1);
    let mut assembler = assembler(&model, partial());
    let solution = test_solution(10);
    assembler.assemble(&model, solution.as_view(), 1.0).unwrap();

    assembler.mark_dof_red(2);
    let update = DVector::from_element(10, 1e-9);
    assembler.update_discrepancy(&model, update.as_view());
    assembler.compute_colors(&model, 1e-6).unwrap();

    let new_solution = &solution - &update;
    let report = assembler.assemble(&model, new_solution.as_view(), 1.0).unwrap();
    // Cells 1..=3 are red, cells 0, 4 and 5 yellow
    assert_eq!(report.relinearized_cells, 6);

    let (expected_matrix, _) = reference_system(&model, &new_solution, 1.0);
    let matrix = assembler.matrix().to_dense();
    for row in 0..=4 {
        assert_eq!(matrix.row(row), expected_matrix.row(row));
    }
}

#[test]
fn relinearize_all_restores_full_assembly() {
    let model = line_model(6, 2);
    let mut assembler = assembler(&model, partial());
    let solution = test_solution(12);
    assembler.assemble(&model, solution.as_view(), 1.0).unwrap();
    assembler.update_discrepancy(&model, DVector::zeros(12).as_view());
    assembler.compute_colors(&model, 1e-6).unwrap();

    assembler.relinearize_all();
    assembler.relinearize_all();
    assert!((0..6).all(|i| assembler.dof_color(i) == EntityColor::Red));
    assert!((0..6).all(|i| assembler.cell_color(i) == EntityColor::Red));
    assert!(!assembler.is_matrix_reusable());

    let new_solution = solution.map(|x| 2.0 * x);
    let report = assembler.assemble(&model, new_solution.as_view(), 1.0).unwrap();
    assert_eq!(report.relinearized_cells, 6);

    let (expected_matrix, expected_residual) = reference_system(&model, &new_solution, 1.0);
    assert_eq!(assembler.matrix().to_dense(), expected_matrix);
    assert_eq!(assembler.residual(), &expected_residual);
}

#[test]
fn ghost_cells_are_not_assembled() {
    let mut table = CellDofTable::new(3);
    table.push_cell(&[0, 1], 1);
    table.push_cell(&[1, 0, 2], 1);
    table.push_ghost_cell(&[2, 1], 1);
    let model = ReactionDiffusion::new(table, 1);
    let mut assembler = assembler(&model, partial());
    assert_eq!(assembler.total_cells(), 2);

    let report = assembler.assemble(&model, test_solution(3).as_view(), 1.0).unwrap();
    assert_eq!(model.full_evaluations(), 2);
    assert_eq!(report.total_cells, 2);
    assert_eq!(report.relinearized_cells, 2);
    // The ghost cell's row is part of the pattern, but nobody writes it
    assert!(assembler.matrix().to_dense().row(2).iter().all(|&x| x == 0.0));
    assert_eq!(assembler.residual()[2], 0.0);
}

#[test]
fn local_failure_fails_assembly() {
    let model = line_model(5, 1).with_failing_cell(3);
    let mut assembler = assembler(&model, partial());
    let err = assembler
        .assemble(&model, test_solution(5).as_view(), 1.0)
        .unwrap_err();
    assert_eq!(
        err,
        AssemblyError::Linearization {
            failed_processes: 1,
            num_processes: 1
        }
    );
    assert!(err
        .to_string()
        .starts_with("A process did not succeed in linearizing the system"));
}
