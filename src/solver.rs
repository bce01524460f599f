//! Block Jacobi linear solver.
//!
//! The solver never sees a monolithic matrix.  It drives two collaborating
//! interfaces: a [`LocalOperator`] that applies and inverts each
//! subsystem's blocks, and a [`Transfer`] that moves coupling values between
//! subsystems.  Every child is updated from the previous iterate only, so
//! the order of children within one sweep does not matter.
//!
//! Forward mode solves `J · d_out = rhs`, reverse mode `Jᵀ · d_res = rhs`,
//! with `J = D + O` split into the children's diagonal blocks `D` and the
//! coupling blocks `O`:
//!
//! ```text
//!   forward:  d_out ← D⁻¹ (rhs − O · d_out)
//!   reverse:  d_res ← D⁻ᵀ (rhs − Oᵀ · d_res)
//! ```

use crate::types::{DerivError, LinearSolverOptions, Mode, SolveReport};
use crate::vectors::{LinearVectors, Scope, VectorRole};
use log::{debug, info, warn};
use std::collections::BTreeMap;

// ─────────────────────────────────────────────────────────────
//  Collaborating interfaces
// ─────────────────────────────────────────────────────────────

/// Per-subsystem apply and solve operators over shared linear vectors.
pub trait LocalOperator {
    fn num_subsystems(&self) -> usize;

    fn subsystem_name(&self, i: usize) -> &str;

    /// Lengths of the flattened `(output/residual, input)` vectors.
    fn vector_sizes(&self) -> (usize, usize);

    /// What child `i` reads (forward) or writes (reverse) during a sweep:
    /// everything except its own outputs.
    fn coupling_scope(&self, i: usize) -> &Scope;

    /// Every variable; used to evaluate the full operator for the norm.
    fn full_scope(&self) -> &Scope;

    /// Forward: `residual += J_i · [output; input]` restricted to `scope`.
    /// Reverse: `[output; input] += J_iᵀ · residual` restricted to `scope`.
    fn apply_linear(
        &self,
        i: usize,
        names: &[String],
        mode: Mode,
        scope: &Scope,
        vectors: &mut LinearVectors,
    ) -> Result<(), DerivError>;

    /// Forward: `output_i ← D_i⁻¹ residual_i`.
    /// Reverse: `residual_i ← D_i⁻ᵀ output_i`.
    ///
    /// Failures do not name the subsystem; the solver adds
    /// [`LocalOperator::subsystem_name`] when it reports them.
    fn solve_linear(&self, i: usize, names: &[String], mode: Mode, vectors: &mut LinearVectors)
        -> Result<(), LocalSolveError>;
}

/// Error returned by [`LocalOperator::solve_linear`].
#[derive(Debug)]
pub enum LocalSolveError {
    /// The diagonal block could not be inverted for right-hand side `vec_name`.
    Failed { vec_name: String, reason: String },
    Other(DerivError),
}

impl From<DerivError> for LocalSolveError {
    fn from(err: DerivError) -> Self {
        Self::Other(err)
    }
}

/// Moves coupling values between subsystems for one right-hand side.
///
/// Forward copies source outputs into connected inputs.  Reverse scatters
/// input adjoints back onto their source outputs.
pub trait Transfer {
    fn transfer(&self, vectors: &mut LinearVectors, name: &str, mode: Mode) -> Result<(), DerivError>;
}

// ─────────────────────────────────────────────────────────────
//  Block Jacobi
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct BlockJacobi {
    pub options: LinearSolverOptions,
}

impl BlockJacobi {
    pub fn new(options: LinearSolverOptions) -> Self {
        Self { options }
    }

    /// Solve one linear system per entry of `rhs`, all with the same
    /// iteration count.
    ///
    /// Returns the vectors (solution in `output` for forward, `residual`
    /// for reverse) and a report.  Non-convergence is only an error when
    /// `err_on_non_convergence` is set; otherwise the last iterate is kept.
    pub fn solve<S: LocalOperator + Transfer>(
        &self,
        system: &S,
        mode: Mode,
        rhs: &BTreeMap<String, Vec<f64>>,
    ) -> Result<(LinearVectors, SolveReport), DerivError> {
        let (n_out, n_in) = system.vector_sizes();
        for (name, b) in rhs {
            if b.len() != n_out {
                return Err(DerivError::RhsSize { name: name.clone(), expected: n_out, found: b.len() });
            }
        }
        let names: Vec<String> = rhs.keys().cloned().collect();
        // Zero initial iterate in both modes.
        let mut vectors = LinearVectors::new(&names, n_out, n_in);

        let initial_norms = self.residual_norms(system, mode, &names, rhs, &mut vectors)?;
        let mut final_norms = initial_norms.clone();
        info!(
            "block Jacobi ({}): {} rhs, {} subsystems, initial norm {:.6e}",
            mode,
            names.len(),
            system.num_subsystems(),
            max_value(&initial_norms)
        );

        let mut iterations = 0;
        let mut converged = self.is_converged(&initial_norms, &final_norms);
        while !converged && iterations < self.options.max_iterations {
            match mode {
                Mode::Forward => self.forward_sweep(system, &names, rhs, &mut vectors)?,
                Mode::Reverse => self.reverse_sweep(system, &names, rhs, &mut vectors)?,
            }
            iterations += 1;
            final_norms = self.residual_norms(system, mode, &names, rhs, &mut vectors)?;
            converged = self.is_converged(&initial_norms, &final_norms);

            let freq = self.options.report_frequency;
            if freq > 0 && iterations % freq == 0 {
                info!("block Jacobi ({}) iter {:>3}: norm {:.6e}", mode, iterations, max_value(&final_norms));
            }
        }

        let report = SolveReport { mode, iterations, converged, initial_norms, final_norms };
        if converged {
            info!("block Jacobi ({}) converged in {} iteration(s)", mode, iterations);
        } else {
            warn!(
                "block Jacobi ({}) did not converge in {} iteration(s), norm {:.6e}",
                mode,
                iterations,
                report.max_norm()
            );
            if self.options.err_on_non_convergence {
                return Err(DerivError::NonConvergence { iterations, norm: report.max_norm() });
            }
        }
        Ok((vectors, report))
    }

    // ── Sweeps ──────────────────────────────────────────────

    fn forward_sweep<S: LocalOperator + Transfer>(
        &self,
        system: &S,
        names: &[String],
        rhs: &BTreeMap<String, Vec<f64>>,
        vectors: &mut LinearVectors,
    ) -> Result<(), DerivError> {
        for name in names {
            system.transfer(vectors, name, Mode::Forward)?;
        }
        vectors.zero(names, VectorRole::Residual)?;
        for i in 0..system.num_subsystems() {
            system.apply_linear(i, names, Mode::Forward, system.coupling_scope(i), vectors)?;
        }
        for (name, b) in rhs {
            negate_add(&mut vectors.get_mut(name)?.residual, b);
        }
        self.solve_subsystems(system, names, Mode::Forward, vectors)
    }

    fn reverse_sweep<S: LocalOperator + Transfer>(
        &self,
        system: &S,
        names: &[String],
        rhs: &BTreeMap<String, Vec<f64>>,
        vectors: &mut LinearVectors,
    ) -> Result<(), DerivError> {
        vectors.zero(names, VectorRole::Output)?;
        vectors.zero(names, VectorRole::Input)?;
        for i in 0..system.num_subsystems() {
            system.apply_linear(i, names, Mode::Reverse, system.coupling_scope(i), vectors)?;
        }
        for name in names {
            system.transfer(vectors, name, Mode::Reverse)?;
        }
        for (name, b) in rhs {
            negate_add(&mut vectors.get_mut(name)?.output, b);
        }
        self.solve_subsystems(system, names, Mode::Reverse, vectors)
    }

    fn solve_subsystems<S: LocalOperator>(
        &self,
        system: &S,
        names: &[String],
        mode: Mode,
        vectors: &mut LinearVectors,
    ) -> Result<(), DerivError> {
        for i in 0..system.num_subsystems() {
            system.solve_linear(i, names, mode, vectors).map_err(|err| match err {
                LocalSolveError::Failed { vec_name, reason } => DerivError::LocalSolve {
                    subsystem: system.subsystem_name(i).to_string(),
                    vec_name,
                    reason,
                },
                LocalSolveError::Other(err) => err,
            })?;
        }
        Ok(())
    }

    // ── Convergence ─────────────────────────────────────────

    /// `‖J x − rhs‖` (forward) or `‖Jᵀ x − rhs‖` (reverse) per name.
    ///
    /// Overwrites the role that is not the unknown: `residual` in forward,
    /// `output` and `input` in reverse.
    fn residual_norms<S: LocalOperator + Transfer>(
        &self,
        system: &S,
        mode: Mode,
        names: &[String],
        rhs: &BTreeMap<String, Vec<f64>>,
        vectors: &mut LinearVectors,
    ) -> Result<BTreeMap<String, f64>, DerivError> {
        let role = match mode {
            Mode::Forward => {
                for name in names {
                    system.transfer(vectors, name, Mode::Forward)?;
                }
                vectors.zero(names, VectorRole::Residual)?;
                VectorRole::Residual
            }
            Mode::Reverse => {
                vectors.zero(names, VectorRole::Output)?;
                vectors.zero(names, VectorRole::Input)?;
                VectorRole::Output
            }
        };
        for i in 0..system.num_subsystems() {
            system.apply_linear(i, names, mode, system.full_scope(), vectors)?;
        }
        if mode == Mode::Reverse {
            for name in names {
                system.transfer(vectors, name, Mode::Reverse)?;
            }
        }

        let mut norms = BTreeMap::new();
        for (name, b) in rhs {
            let ax = vectors.get(name)?.role(role);
            let norm = ax.iter().zip(b).map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt();
            norms.insert(name.clone(), norm);
        }
        Ok(norms)
    }

    fn is_converged(&self, initial: &BTreeMap<String, f64>, current: &BTreeMap<String, f64>) -> bool {
        current.iter().all(|(name, &norm)| {
            let norm0 = match initial.get(name) {
                Some(&n) if n != 0.0 => n,
                _ => 1.0,
            };
            let ok = norm <= self.options.atol || norm / norm0 <= self.options.rtol;
            if !ok {
                debug!("'{}' not converged: norm {:.3e} (relative {:.3e})", name, norm, norm / norm0);
            }
            ok
        })
    }
}

/// `v ← −v + b`
fn negate_add(v: &mut [f64], b: &[f64]) {
    for (x, &bi) in v.iter_mut().zip(b) {
        *x = bi - *x;
    }
}

fn max_value(norms: &BTreeMap<String, f64>) -> f64 {
    norms.values().fold(0.0_f64, |m, &v| m.max(v))
}
