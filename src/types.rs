use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, DerivError>`
/// instead of panicking.  Messages are deterministic for a given model so
/// callers can match on the exact text.
#[derive(Debug, Error)]
pub enum DerivError {
    /// A partial declaration is inconsistent with the variable sizes.
    #[error("{component}: d({of})/d({wrt}): {issue}")]
    Declaration {
        component: String,
        of: String,
        wrt: String,
        issue: DeclarationIssue,
    },
    #[error("{component}: variable '{name}' not found")]
    UnknownVariable { component: String, name: String },
    #[error("{component}: variable '{name}' already exists")]
    DuplicateVariable { component: String, name: String },
    #[error("{component}: variable '{name}' has shape {shape}, dimensions must be positive")]
    InvalidShape { component: String, name: String, shape: String },
    #[error("component '{0}' not found")]
    UnknownComponent(String),
    #[error("component '{0}' already exists")]
    DuplicateComponent(String),
    #[error("connection error: {0}")]
    Connection(String),
    /// Values were supplied for a block that is absent from the Jacobian.
    #[error("{component}: d({of})/d({wrt}) is not a declared dependency")]
    PartialNotDeclared {
        component: String,
        of: String,
        wrt: String,
    },
    #[error("{component}: d({of})/d({wrt}): expected {expected} values but got {found}")]
    PartialSize {
        component: String,
        of: String,
        wrt: String,
        expected: usize,
        found: usize,
    },
    /// The model has not been set up yet (call `Model::setup` first).
    #[error("model is not set up (call setup first)")]
    NotSetUp,
    #[error("model is not linearized (call linearize first)")]
    NotLinearized,
    /// A subsystem could not invert its local diagonal block.
    #[error("linear solve failed in subsystem '{subsystem}' for '{vec_name}': {reason}")]
    LocalSolve {
        subsystem: String,
        vec_name: String,
        reason: String,
    },
    /// Only raised when `LinearSolverOptions::err_on_non_convergence` is set.
    #[error("block Jacobi failed to converge in {iterations} iterations (norm {norm:.6e})")]
    NonConvergence { iterations: usize, norm: f64 },
    #[error("right-hand side '{0}' has not been allocated")]
    UnknownRhs(String),
    #[error("right-hand side '{name}' has length {found}, expected {expected}")]
    RhsSize {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// The precise mismatch found while validating one `(of, wrt)` declaration.
///
/// Variants are listed in the order the checks run; the first failure wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclarationIssue {
    #[error("If one of rows/cols is specified, then both must be specified")]
    OneOfRowsCols,
    #[error("rows and cols must have the same shape, rows: ({rows},), cols: ({cols},)")]
    RowsColsLength { rows: usize, cols: usize },
    #[error("row indices must be non-negative")]
    NegativeRows,
    #[error("col indices must be non-negative")]
    NegativeCols,
    // Role checks on literal names, before any size is looked at.
    #[error("'{0}' is an input, partials are declared of outputs only")]
    OfNotOutput(String),
    #[error("'{0}' is an output, explicit components declare partials with respect to inputs only")]
    WrtIsOutput(String),
    #[error("Expected {expected_rows}x{expected_cols} but declared at least {declared_rows}x{declared_cols}")]
    IndexOutOfRange {
        expected_rows: usize,
        expected_cols: usize,
        declared_rows: usize,
        declared_cols: usize,
    },
    #[error("Expected {expected_rows}x{expected_cols} but val is {found_rows}x{found_cols}")]
    ValueShape {
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },
    #[error("If rows and cols are specified, val must be a scalar or have the same shape, val: {val_shape}, rows/cols: ({nnz},)")]
    ValueLength { val_shape: String, nnz: usize },
}

// ─────────────────────────────────────────────────────────────
//  Variables
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Input,
    Output,
}

/// One named variable owned by a component.  Shape is fixed at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: VarKind,
}

impl Variable {
    pub fn input(name: &str, shape: &[usize]) -> Self {
        Self { name: name.to_string(), shape: shape.to_vec(), kind: VarKind::Input }
    }

    pub fn output(name: &str, shape: &[usize]) -> Self {
        Self { name: name.to_string(), shape: shape.to_vec(), kind: VarKind::Output }
    }

    /// Flattened size: product of the shape (a scalar `[]` has size 1).
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_output(&self) -> bool {
        self.kind == VarKind::Output
    }
}

/// Stable index of a variable inside the model-wide output or input arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

impl VarId {
    pub fn index(&self) -> usize {
        self.0
    }
}

// ─────────────────────────────────────────────────────────────
//  Modes / formats
// ─────────────────────────────────────────────────────────────

/// Direction of a linear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Tangent: propagate input perturbations to outputs.
    Forward,
    /// Adjoint: propagate output seeds back through transposed operators.
    Reverse,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "fwd"),
            Self::Reverse => write!(f, "rev"),
        }
    }
}

/// Explicit components compute outputs directly, so their diagonal block is
/// always the −1 identity.  Implicit components own a general
/// output-output block that must be factorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Explicit,
    Implicit,
}

/// Storage representation of the assembled global Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixFormat {
    /// Row-major dense `Array2`.
    Dense,
    /// Unordered triplet list.
    Coo,
    /// Compressed sparse row, indices sorted within each row.
    Csr,
}

/// Where subsystem apply-linear operators read their blocks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianMode {
    /// Each component applies its own validated blocks.
    Local,
    /// One global matrix is assembled and shared by all subsystems.
    Assembled(MatrixFormat),
}

// ─────────────────────────────────────────────────────────────
//  Solver options
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinearSolverOptions {
    pub atol: f64,
    pub rtol: f64,
    pub max_iterations: usize,
    /// Turn non-convergence into `DerivError::NonConvergence`.
    pub err_on_non_convergence: bool,
    /// Log every n-th iteration at info level (0 disables).
    pub report_frequency: usize,
}

impl Default for LinearSolverOptions {
    fn default() -> Self {
        Self {
            atol: 1e-10,
            rtol: 1e-10,
            max_iterations: 10,
            err_on_non_convergence: false,
            report_frequency: 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Solve report  (returned from every linear solve)
// ─────────────────────────────────────────────────────────────

/// Outcome of one block-Jacobi solve.  A non-converged report still comes
/// with usable vectors: the last iterate is left in place.
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub mode: Mode,
    pub iterations: usize,
    pub converged: bool,
    /// Residual norm of each right-hand side before the first iteration.
    pub initial_norms: BTreeMap<String, f64>,
    /// Residual norm of each right-hand side after the last iteration.
    pub final_norms: BTreeMap<String, f64>,
}

impl SolveReport {
    /// Largest final norm across all right-hand sides (0 when there are none).
    pub fn max_norm(&self) -> f64 {
        self.final_norms.values().fold(0.0_f64, |m, &v| m.max(v))
    }
}

/// Format a shape the way declaration errors print it: `(3,)`, `(4, 2)`.
pub fn format_shape(shape: &[usize]) -> String {
    match shape {
        [n] => format!("({n},)"),
        dims => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}
