//! Integration tests: total derivatives through complete models.
//!
//! These tests verify that the full pipeline (declaration → setup →
//! linearize → block Jacobi → total extraction) reproduces hand-derived
//! Jacobians in both modes and with every Jacobian representation.

use approx::assert_abs_diff_eq;
use coupled_derivs::{
    compute_totals, Component, DerivError, JacobianMode, LinearSolverOptions, MatrixFormat, Mode, Model,
    PartialDeclaration,
};
use coupled_derivs::linalg::{FactorStrategy, LocalFactor};
use ndarray::{arr2, Array2};
use sprs::TriMat;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

const MODES: [JacobianMode; 4] = [
    JacobianMode::Local,
    JacobianMode::Assembled(MatrixFormat::Dense),
    JacobianMode::Assembled(MatrixFormat::Coo),
    JacobianMode::Assembled(MatrixFormat::Csr),
];

fn assert_block(actual: &Array2<f64>, expected: &Array2<f64>, label: &str) {
    assert_eq!(actual.dim(), expected.dim(), "{label}");
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *e, epsilon = 1e-9);
    }
}

fn finish(mut model: Model) -> Model {
    model.setup().unwrap();
    model.linearize().unwrap();
    model
}

/// Independent outputs x, y1, y2, y3, z feeding a component with constant
/// partials declared in every supported form.
fn const_model(mode: JacobianMode) -> Model {
    let mut indep = Component::explicit("input_comp");
    indep.add_output("x", &[1]).unwrap();
    indep.add_output("y1", &[2]).unwrap();
    indep.add_output("y2", &[2]).unwrap();
    indep.add_output("y3", &[2]).unwrap();
    indep.add_output("z", &[2, 2]).unwrap();

    let mut simple = Component::explicit("simple");
    simple.add_input("x", &[1]).unwrap();
    simple.add_input("y1", &[2]).unwrap();
    simple.add_input("y2", &[2]).unwrap();
    simple.add_input("y3", &[2]).unwrap();
    simple.add_input("z", &[2, 2]).unwrap();
    simple.add_output("f", &[1]).unwrap();
    simple.add_output("g", &[2, 2]).unwrap();

    simple.declare_partials(PartialDeclaration::new_multi(&["f"], &["y1", "y2", "y3"]).dependent(false)).unwrap();
    simple.declare_partials(PartialDeclaration::new("g", "z").dependent(false)).unwrap();
    simple.declare_partials(PartialDeclaration::new("f", "x").val(1.0)).unwrap();
    simple.declare_partials(PartialDeclaration::new("f", "z").val(Array2::<f64>::ones((1, 4)))).unwrap();
    simple
        .declare_partials(
            PartialDeclaration::new("g", "y[13]").val(arr2(&[[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]])),
        )
        .unwrap();
    simple
        .declare_partials(PartialDeclaration::new("g", "y2").val(vec![1.0; 4]).rows_cols(&[0, 2, 1, 3], &[0, 0, 1, 1]))
        .unwrap();
    let coo = TriMat::from_triplets((4, 1), vec![0, 3], vec![0, 0], vec![1.0, 1.0]);
    simple.declare_partials(PartialDeclaration::new("g", "x").val(coo)).unwrap();

    let mut model = Model::new().with_jacobian_mode(mode);
    model.add_component(indep).unwrap();
    model.add_component(simple).unwrap();
    for name in ["x", "y1", "y2", "y3", "z"] {
        model.connect(&format!("input_comp.{name}"), &format!("simple.{name}"));
    }
    finish(model)
}

/// `y1 = a * y2 + x`, `y2 = b * y1 + x`, split over two components.
fn cycle_model(a: f64, b: f64, mode: JacobianMode, options: LinearSolverOptions) -> Model {
    let mut p = Component::explicit("p");
    p.add_output("x", &[1]).unwrap();

    let mut c1 = Component::explicit("c1");
    c1.add_input("x", &[1]).unwrap();
    c1.add_input("y2", &[1]).unwrap();
    c1.add_output("y1", &[1]).unwrap();
    c1.declare_partials(PartialDeclaration::new("y1", "y2").val(a)).unwrap();
    c1.declare_partials(PartialDeclaration::new("y1", "x").val(1.0)).unwrap();

    let mut c2 = Component::explicit("c2");
    c2.add_input("x", &[1]).unwrap();
    c2.add_input("y1", &[1]).unwrap();
    c2.add_output("y2", &[1]).unwrap();
    c2.declare_partials(PartialDeclaration::new("y2", "y1").val(b)).unwrap();
    c2.declare_partials(PartialDeclaration::new("y2", "x").val(1.0)).unwrap();

    let mut model = Model::new().with_jacobian_mode(mode).with_options(options);
    model.add_component(p).unwrap();
    model.add_component(c1).unwrap();
    model.add_component(c2).unwrap();
    model.connect("p.x", "c1.x");
    model.connect("p.x", "c2.x");
    model.connect("c2.y2", "c1.y2");
    model.connect("c1.y1", "c2.y1");
    finish(model)
}

/// Implicit `A u − a = 0` with `A` given as the `(u, u)` block.
fn implicit_model(a_block: Array2<f64>, mode: JacobianMode) -> Model {
    let mut indep = Component::explicit("indep");
    indep.add_output("a", &[2]).unwrap();

    let mut lin = Component::implicit("lin");
    lin.add_input("a", &[2]).unwrap();
    lin.add_output("u", &[2]).unwrap();
    lin.declare_partials(PartialDeclaration::new("u", "u").val(a_block)).unwrap();
    lin.declare_partials(PartialDeclaration::new("u", "a").rows_cols(&[0, 1], &[0, 1]).val(-1.0)).unwrap();

    let mut model = Model::new().with_jacobian_mode(mode);
    model.add_component(indep).unwrap();
    model.add_component(lin).unwrap();
    model.connect("indep.a", "lin.a");
    finish(model)
}

// ─────────────────────────────────────────────────────────────
//  Constant partials
// ─────────────────────────────────────────────────────────────

#[test]
fn const_jacobian_totals() {
    let wrt = ["input_comp.x", "input_comp.y1", "input_comp.y2", "input_comp.y3", "input_comp.z"];
    let expected: Vec<(&str, &str, Array2<f64>)> = vec![
        ("simple.f", "input_comp.x", arr2(&[[1.0]])),
        ("simple.f", "input_comp.z", Array2::ones((1, 4))),
        ("simple.f", "input_comp.y1", Array2::zeros((1, 2))),
        ("simple.f", "input_comp.y2", Array2::zeros((1, 2))),
        ("simple.f", "input_comp.y3", Array2::zeros((1, 2))),
        ("simple.g", "input_comp.y1", arr2(&[[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]])),
        ("simple.g", "input_comp.y2", arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]])),
        ("simple.g", "input_comp.y3", arr2(&[[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]])),
        ("simple.g", "input_comp.x", arr2(&[[1.0], [0.0], [0.0], [1.0]])),
        ("simple.g", "input_comp.z", Array2::zeros((4, 4))),
    ];

    for jac_mode in MODES {
        let model = const_model(jac_mode);
        for mode in [Mode::Forward, Mode::Reverse] {
            let totals = compute_totals(&model, &["simple.f", "simple.g"], &wrt, mode).unwrap();
            assert!(totals.report.converged, "{jac_mode:?} {mode}");
            for (of, w, block) in &expected {
                let label = format!("{jac_mode:?} {mode} d({of})/d({w})");
                assert_block(totals.get(of, w).unwrap(), block, &label);
            }
        }
    }
}

#[test]
fn inputs_stand_for_their_sources() {
    let model = const_model(JacobianMode::Local);
    let via_input = compute_totals(&model, &["simple.g"], &["simple.x"], Mode::Forward).unwrap();
    let via_output = compute_totals(&model, &["simple.g"], &["input_comp.x"], Mode::Forward).unwrap();
    assert_eq!(via_input.get("simple.g", "simple.x"), via_output.get("simple.g", "input_comp.x"));
}

#[test]
fn stacked_total_matrix() {
    let model = const_model(JacobianMode::Assembled(MatrixFormat::Csr));
    let totals = compute_totals(&model, &["simple.f", "simple.g"], &["input_comp.x", "input_comp.z"], Mode::Reverse)
        .unwrap();
    let dense = totals.to_dense();
    assert_eq!(dense.dim(), (5, 5));
    assert_eq!(dense.row(0).to_vec(), vec![1.0, 1.0, 1.0, 1.0, 1.0]);
    assert_eq!(dense.column(0).to_vec(), vec![1.0, 1.0, 0.0, 0.0, 1.0]);
    assert_eq!(totals.of().collect::<Vec<_>>(), vec!["simple.f", "simple.g"]);
}

// ─────────────────────────────────────────────────────────────
//  Coupled cycle
// ─────────────────────────────────────────────────────────────

#[test]
fn cycle_converges_to_analytic_totals() {
    let options = LinearSolverOptions { max_iterations: 100, ..Default::default() };
    for jac_mode in [JacobianMode::Local, JacobianMode::Assembled(MatrixFormat::Csr)] {
        let model = cycle_model(0.5, 0.25, jac_mode, options.clone());
        for mode in [Mode::Forward, Mode::Reverse] {
            let totals = compute_totals(&model, &["c1.y1", "c2.y2"], &["p.x"], mode).unwrap();
            assert!(totals.report.converged, "{jac_mode:?} {mode}");
            assert!(totals.report.iterations > 2);
            assert_abs_diff_eq!(totals.get("c1.y1", "p.x").unwrap()[[0, 0]], 12.0 / 7.0, epsilon = 1e-8);
            assert_abs_diff_eq!(totals.get("c2.y2", "p.x").unwrap()[[0, 0]], 10.0 / 7.0, epsilon = 1e-8);
        }
    }
}

#[test]
fn cycle_modes_agree() {
    let options = LinearSolverOptions { max_iterations: 100, ..Default::default() };
    let model = cycle_model(0.3, -0.6, JacobianMode::Local, options);
    let of = ["c1.y1", "c2.y2"];
    let wrt = ["p.x", "c1.y2"];
    let fwd = compute_totals(&model, &of, &wrt, Mode::Forward).unwrap();
    let rev = compute_totals(&model, &of, &wrt, Mode::Reverse).unwrap();
    assert_block(&fwd.to_dense(), &rev.to_dense(), "fwd vs rev");
}

#[test]
fn divergent_cycle_reports_non_convergence() {
    let model = cycle_model(2.0, 2.0, JacobianMode::Local, LinearSolverOptions::default());
    let totals = compute_totals(&model, &["c1.y1"], &["p.x"], Mode::Forward).unwrap();
    assert!(!totals.report.converged);
    assert_eq!(totals.report.iterations, 10);

    let strict = LinearSolverOptions { err_on_non_convergence: true, ..Default::default() };
    let model = cycle_model(2.0, 2.0, JacobianMode::Assembled(MatrixFormat::Coo), strict);
    let err = compute_totals(&model, &["c1.y1"], &["p.x"], Mode::Reverse).unwrap_err();
    assert!(matches!(err, DerivError::NonConvergence { iterations: 10, .. }));
}

// ─────────────────────────────────────────────────────────────
//  Implicit components
// ─────────────────────────────────────────────────────────────

#[test]
fn implicit_general_block() {
    let expected = arr2(&[[0.5, -0.125], [0.0, 0.25]]);
    for jac_mode in [JacobianMode::Local, JacobianMode::Assembled(MatrixFormat::Dense)] {
        let model = implicit_model(arr2(&[[2.0, 1.0], [0.0, 4.0]]), jac_mode);
        for mode in [Mode::Forward, Mode::Reverse] {
            let totals = compute_totals(&model, &["lin.u"], &["indep.a"], mode).unwrap();
            assert_block(totals.get("lin.u", "indep.a").unwrap(), &expected, &format!("{jac_mode:?} {mode}"));
        }
    }
}

#[test]
fn implicit_symmetric_block() {
    let expected = arr2(&[[0.6, -0.2], [-0.2, 0.4]]);
    let model = implicit_model(arr2(&[[2.0, 1.0], [1.0, 3.0]]), JacobianMode::Assembled(MatrixFormat::Csr));
    for mode in [Mode::Forward, Mode::Reverse] {
        let totals = compute_totals(&model, &["lin.u"], &["lin.a"], mode).unwrap();
        assert_block(totals.get("lin.u", "lin.a").unwrap(), &expected, &format!("{mode}"));
    }
}

#[test]
fn implicit_symmetric_indefinite_block() {
    // Symmetric and nonsingular, but unpivoted LDLᵀ meets a zero pivot.
    let expected = arr2(&[[0.0, 1.0], [1.0, 0.0]]);
    for jac_mode in [JacobianMode::Local, JacobianMode::Assembled(MatrixFormat::Csr)] {
        let model = implicit_model(expected.clone(), jac_mode);
        for mode in [Mode::Forward, Mode::Reverse] {
            let totals = compute_totals(&model, &["lin.u"], &["indep.a"], mode).unwrap();
            assert_block(totals.get("lin.u", "indep.a").unwrap(), &expected, &format!("{jac_mode:?} {mode}"));
        }
    }
}

#[test]
fn local_factor_strategy_follows_the_block() {
    let spd = LocalFactor::new(&arr2(&[[2.0, 1.0], [1.0, 3.0]])).unwrap();
    assert_eq!(spd.strategy(), FactorStrategy::Ldl);

    let indefinite = LocalFactor::new(&arr2(&[[0.0, 1.0], [1.0, 0.0]])).unwrap();
    assert_eq!(indefinite.strategy(), FactorStrategy::Lu);
    assert_eq!(indefinite.solve(&[2.0, 3.0]), vec![3.0, 2.0]);

    let general = LocalFactor::new(&arr2(&[[2.0, 1.0], [0.0, 4.0]])).unwrap();
    assert_eq!(general.strategy(), FactorStrategy::Lu);
}

#[test]
fn singular_local_block_fails_the_solve() {
    let model = implicit_model(arr2(&[[1.0, 2.0], [1.0, 2.0]]), JacobianMode::Local);
    let err = compute_totals(&model, &["lin.u"], &["indep.a"], Mode::Forward).unwrap_err();
    match err {
        DerivError::LocalSolve { subsystem, vec_name, reason } => {
            assert_eq!(subsystem, "lin");
            assert_eq!(vec_name, "indep.a[0]");
            assert!(reason.contains("singular"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn set_partial_then_relinearize() {
    let mut model = implicit_model(arr2(&[[2.0, 0.0], [0.0, 2.0]]), JacobianMode::Assembled(MatrixFormat::Coo));
    model.set_partial("lin", "u", "u", arr2(&[[4.0, 0.0], [0.0, 5.0]])).unwrap();
    model.linearize().unwrap();
    let totals = compute_totals(&model, &["lin.u"], &["indep.a"], Mode::Forward).unwrap();
    assert_block(totals.get("lin.u", "indep.a").unwrap(), &arr2(&[[0.25, 0.0], [0.0, 0.2]]), "refreshed");
}

// ─────────────────────────────────────────────────────────────
//  Errors
// ─────────────────────────────────────────────────────────────

#[test]
fn solve_before_linearize() {
    let mut model = Model::new();
    let mut indep = Component::explicit("indep");
    indep.add_output("a", &[1]).unwrap();
    model.add_component(indep).unwrap();
    model.setup().unwrap();
    let err = compute_totals(&model, &["indep.a"], &["indep.a"], Mode::Forward).unwrap_err();
    assert!(matches!(err, DerivError::NotLinearized));
}

#[test]
fn unconnected_input_has_no_totals() {
    let mut indep = Component::explicit("indep");
    indep.add_output("a", &[1]).unwrap();
    let mut free = Component::explicit("free");
    free.add_input("b", &[1]).unwrap();
    free.add_output("c", &[1]).unwrap();

    let mut model = Model::new();
    model.add_component(indep).unwrap();
    model.add_component(free).unwrap();
    let model = finish(model);
    let err = compute_totals(&model, &["free.c"], &["free.b"], Mode::Forward).unwrap_err();
    assert_eq!(err.to_string(), "connection error: input 'free.b' is not connected to any output");
}
