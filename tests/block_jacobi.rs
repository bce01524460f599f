//! Block Jacobi solver tests against a mock single-process system: one
//! scalar subsystem per row of a small dense matrix, no transport.

use approx::assert_abs_diff_eq;
use coupled_derivs::types::{DerivError, LinearSolverOptions, Mode};
use coupled_derivs::vectors::{LinearVectors, Scope};
use coupled_derivs::{BlockJacobi, LocalOperator, LocalSolveError, Transfer};
use ndarray::{arr2, Array2};
use std::collections::BTreeMap;

// ─────────────────────────────────────────────────────────────
//  Mock system
// ─────────────────────────────────────────────────────────────

struct DenseSystem {
    a: Array2<f64>,
    names: Vec<String>,
    coupling: Vec<Scope>,
    full: Scope,
}

impl DenseSystem {
    fn new(a: Array2<f64>) -> Self {
        let n = a.nrows();
        Self {
            names: (0..n).map(|i| format!("row{i}")).collect(),
            coupling: (0..n)
                .map(|i| Scope { outputs: (0..n).map(|j| j != i).collect(), inputs: Vec::new() })
                .collect(),
            full: Scope::full(n, 0),
            a,
        }
    }

    fn n(&self) -> usize {
        self.a.nrows()
    }
}

impl LocalOperator for DenseSystem {
    fn num_subsystems(&self) -> usize {
        self.n()
    }

    fn subsystem_name(&self, i: usize) -> &str {
        &self.names[i]
    }

    fn vector_sizes(&self) -> (usize, usize) {
        (self.n(), 0)
    }

    fn coupling_scope(&self, i: usize) -> &Scope {
        &self.coupling[i]
    }

    fn full_scope(&self) -> &Scope {
        &self.full
    }

    fn apply_linear(
        &self,
        i: usize,
        names: &[String],
        mode: Mode,
        scope: &Scope,
        vectors: &mut LinearVectors,
    ) -> Result<(), DerivError> {
        for name in names {
            let v = vectors.get_mut(name)?;
            for c in 0..self.n() {
                if !scope.outputs[c] {
                    continue;
                }
                match mode {
                    Mode::Forward => v.residual[i] += self.a[[i, c]] * v.output[c],
                    Mode::Reverse => v.output[c] += self.a[[i, c]] * v.residual[i],
                }
            }
        }
        Ok(())
    }

    fn solve_linear(&self, i: usize, names: &[String], mode: Mode, vectors: &mut LinearVectors)
        -> Result<(), LocalSolveError> {
        let d = self.a[[i, i]];
        for name in names {
            if d == 0.0 {
                return Err(LocalSolveError::Failed { vec_name: name.clone(), reason: "zero diagonal".to_string() });
            }
            let v = vectors.get_mut(name)?;
            match mode {
                Mode::Forward => v.output[i] = v.residual[i] / d,
                Mode::Reverse => v.residual[i] = v.output[i] / d,
            }
        }
        Ok(())
    }
}

impl Transfer for DenseSystem {
    fn transfer(&self, _vectors: &mut LinearVectors, _name: &str, _mode: Mode) -> Result<(), DerivError> {
        Ok(())
    }
}

fn rhs(entries: &[(&str, Vec<f64>)]) -> BTreeMap<String, Vec<f64>> {
    entries.iter().map(|(n, b)| (n.to_string(), b.clone())).collect()
}

fn tight(max_iterations: usize) -> LinearSolverOptions {
    LinearSolverOptions { atol: 1e-13, rtol: 1e-13, max_iterations, ..Default::default() }
}

fn mat_vec(a: &Array2<f64>, x: &[f64]) -> Vec<f64> {
    a.outer_iter().map(|row| row.iter().zip(x).map(|(p, q)| p * q).sum()).collect()
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn default_options() {
    let opts = LinearSolverOptions::default();
    assert_eq!(opts.atol, 1e-10);
    assert_eq!(opts.rtol, 1e-10);
    assert_eq!(opts.max_iterations, 10);
    assert!(!opts.err_on_non_convergence);
}

#[test]
fn forward_solves_diagonally_dominant_system() {
    let a = arr2(&[[4.0, 1.0, 0.0], [2.0, 5.0, 1.0], [0.0, 1.0, 3.0]]);
    let system = DenseSystem::new(a.clone());
    let b = vec![1.0, -2.0, 0.5];
    let (vectors, report) = BlockJacobi::new(tight(200)).solve(&system, Mode::Forward, &rhs(&[("b", b.clone())])).unwrap();

    assert!(report.converged);
    assert!(report.iterations > 1);
    let x = &vectors.get("b").unwrap().output;
    for (ax, bi) in mat_vec(&a, x).iter().zip(&b) {
        assert_abs_diff_eq!(*ax, *bi, epsilon = 1e-10);
    }
}

#[test]
fn reverse_solves_transposed_system() {
    let a = arr2(&[[4.0, 1.0, 0.0], [2.0, 5.0, 1.0], [0.0, 1.0, 3.0]]);
    let system = DenseSystem::new(a.clone());
    let b = vec![1.0, -2.0, 0.5];
    let (vectors, report) = BlockJacobi::new(tight(200)).solve(&system, Mode::Reverse, &rhs(&[("b", b.clone())])).unwrap();

    assert!(report.converged);
    let y = &vectors.get("b").unwrap().residual;
    let at = a.t().to_owned();
    for (aty, bi) in mat_vec(&at, y).iter().zip(&b) {
        assert_abs_diff_eq!(*aty, *bi, epsilon = 1e-10);
    }
}

#[test]
fn forward_and_reverse_agree_on_symmetric_system() {
    let a = arr2(&[[4.0, 1.0, 0.5], [1.0, 3.0, 1.0], [0.5, 1.0, 2.0]]);
    let system = DenseSystem::new(a);
    let seeds = rhs(&[("e0", vec![1.0, 0.0, 0.0]), ("e2", vec![0.0, 0.0, 1.0])]);
    let solver = BlockJacobi::new(tight(500));

    let (fwd, fwd_report) = solver.solve(&system, Mode::Forward, &seeds).unwrap();
    let (rev, rev_report) = solver.solve(&system, Mode::Reverse, &seeds).unwrap();
    assert!(fwd_report.converged && rev_report.converged);
    assert_eq!(fwd_report.iterations, rev_report.iterations);

    for name in ["e0", "e2"] {
        let x = &fwd.get(name).unwrap().output;
        let y = &rev.get(name).unwrap().residual;
        for (xi, yi) in x.iter().zip(y) {
            assert_abs_diff_eq!(*xi, *yi, epsilon = 1e-10);
        }
    }
}

#[test]
fn multiple_rhs_share_iteration_count() {
    let a = arr2(&[[3.0, 1.0], [1.0, 3.0]]);
    let system = DenseSystem::new(a);
    let seeds = rhs(&[("a", vec![1.0, 0.0]), ("b", vec![0.0, 2.0]), ("zero", vec![0.0, 0.0])]);
    let (_, report) = BlockJacobi::new(tight(100)).solve(&system, Mode::Forward, &seeds).unwrap();

    assert!(report.converged);
    assert_eq!(report.initial_norms.len(), 3);
    assert_eq!(report.final_norms.len(), 3);
    assert_abs_diff_eq!(report.initial_norms["b"], 2.0);
    assert_abs_diff_eq!(report.final_norms["zero"], 0.0);
}

#[test]
fn zero_rhs_converges_without_iterating() {
    let system = DenseSystem::new(arr2(&[[2.0, 1.0], [1.0, 2.0]]));
    let (vectors, report) = BlockJacobi::default().solve(&system, Mode::Forward, &rhs(&[("z", vec![0.0, 0.0])])).unwrap();
    assert!(report.converged);
    assert_eq!(report.iterations, 0);
    assert_eq!(vectors.get("z").unwrap().output, vec![0.0, 0.0]);
}

#[test]
fn non_convergence_is_reported_not_raised() {
    // Jacobi iteration matrix has spectral radius 2.
    let system = DenseSystem::new(arr2(&[[1.0, 2.0], [2.0, 1.0]]));
    let seeds = rhs(&[("b", vec![1.0, 1.0])]);
    let (vectors, report) = BlockJacobi::default().solve(&system, Mode::Forward, &seeds).unwrap();

    assert!(!report.converged);
    assert_eq!(report.iterations, 10);
    assert!(report.max_norm() > report.initial_norms["b"]);
    // Last iterate is still there.
    assert!(vectors.get("b").unwrap().output.iter().any(|v| *v != 0.0));
}

#[test]
fn non_convergence_can_be_made_fatal() {
    let system = DenseSystem::new(arr2(&[[1.0, 2.0], [2.0, 1.0]]));
    let options = LinearSolverOptions { err_on_non_convergence: true, max_iterations: 4, ..Default::default() };
    let err = BlockJacobi::new(options).solve(&system, Mode::Reverse, &rhs(&[("b", vec![1.0, 0.0])])).unwrap_err();
    assert!(matches!(err, DerivError::NonConvergence { iterations: 4, .. }));
}

#[test]
fn local_solve_failure_names_subsystem_and_rhs() {
    let system = DenseSystem::new(arr2(&[[2.0, 1.0], [1.0, 0.0]]));
    let err = BlockJacobi::default()
        .solve(&system, Mode::Forward, &rhs(&[("seed", vec![1.0, 1.0])]))
        .unwrap_err();
    assert_eq!(err.to_string(), "linear solve failed in subsystem 'row1' for 'seed': zero diagonal");
}

#[test]
fn rhs_length_is_checked() {
    let system = DenseSystem::new(arr2(&[[2.0, 1.0], [1.0, 2.0]]));
    let err = BlockJacobi::default().solve(&system, Mode::Forward, &rhs(&[("b", vec![1.0])])).unwrap_err();
    assert_eq!(err.to_string(), "right-hand side 'b' has length 1, expected 2");
}
