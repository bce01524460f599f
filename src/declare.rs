//! Partial-derivative declarations and their validation.
//!
//! A [`PartialDeclaration`] is what a component registers for one or more
//! `(of, wrt)` pairs.  During setup each concrete pair is validated against
//! the flattened sizes of the two variables and normalized into a
//! [`SubJacobian`]: a dense block, a sparse triplet block, or an explicit
//! "not dependent" marker.

use crate::types::{format_shape, DeclarationIssue};
use ndarray::Array2;
use sprs::TriMat;

// ─────────────────────────────────────────────────────────────
//  Declared values
// ─────────────────────────────────────────────────────────────

/// Numeric value attached to a declaration or to a value refresh.
#[derive(Debug)]
pub enum PartialValue {
    /// Broadcast to every structural entry.
    Scalar(f64),
    /// 1-D values.  One per sparsity entry when rows/cols are given,
    /// otherwise promoted to a single row.
    Vector(Vec<f64>),
    Dense(Array2<f64>),
    /// Coordinate matrix; its triplets become the block's sparsity.
    Coo(TriMat<f64>),
}

// `TriMat` has no `Clone`; rebuild it from its triplets.
impl Clone for PartialValue {
    fn clone(&self) -> Self {
        match self {
            Self::Scalar(v) => Self::Scalar(*v),
            Self::Vector(v) => Self::Vector(v.clone()),
            Self::Dense(a) => Self::Dense(a.clone()),
            Self::Coo(t) => Self::Coo(TriMat::from_triplets(
                (t.rows(), t.cols()),
                t.row_inds().to_vec(),
                t.col_inds().to_vec(),
                t.data().to_vec(),
            )),
        }
    }
}

impl PartialValue {
    /// Shape as printed in declaration errors.
    fn shape_label(&self) -> String {
        match self {
            Self::Scalar(_) => "()".to_string(),
            Self::Vector(v) => format_shape(&[v.len()]),
            Self::Dense(a) => format_shape(&[a.nrows(), a.ncols()]),
            Self::Coo(t) => format_shape(&[t.rows(), t.cols()]),
        }
    }

    /// Number of raw values carried (scalars count as one).
    fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Vector(v) => v.len(),
            Self::Dense(a) => a.len(),
            Self::Coo(t) => t.nnz(),
        }
    }
}

impl From<f64> for PartialValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for PartialValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<&[f64]> for PartialValue {
    fn from(v: &[f64]) -> Self {
        Self::Vector(v.to_vec())
    }
}

impl From<Array2<f64>> for PartialValue {
    fn from(a: Array2<f64>) -> Self {
        Self::Dense(a)
    }
}

impl From<TriMat<f64>> for PartialValue {
    fn from(t: TriMat<f64>) -> Self {
        Self::Coo(t)
    }
}

// ─────────────────────────────────────────────────────────────
//  Declaration
// ─────────────────────────────────────────────────────────────

/// One `declare_partials` call.  `of` and `wrt` hold names or glob patterns.
///
/// Row/column indices are signed so that negative input can be reported
/// instead of being unrepresentable.
#[derive(Debug, Clone)]
pub struct PartialDeclaration {
    pub of: Vec<String>,
    pub wrt: Vec<String>,
    pub dependent: bool,
    pub rows: Option<Vec<i64>>,
    pub cols: Option<Vec<i64>>,
    pub val: Option<PartialValue>,
}

impl PartialDeclaration {
    pub fn new(of: &str, wrt: &str) -> Self {
        Self::new_multi(&[of], &[wrt])
    }

    /// Declare for every combination of the listed names/patterns.
    pub fn new_multi(of: &[&str], wrt: &[&str]) -> Self {
        Self {
            of: of.iter().map(|s| s.to_string()).collect(),
            wrt: wrt.iter().map(|s| s.to_string()).collect(),
            dependent: true,
            rows: None,
            cols: None,
            val: None,
        }
    }

    pub fn dependent(mut self, dependent: bool) -> Self {
        self.dependent = dependent;
        self
    }

    pub fn val(mut self, val: impl Into<PartialValue>) -> Self {
        self.val = Some(val.into());
        self
    }

    pub fn rows(mut self, rows: &[i64]) -> Self {
        self.rows = Some(rows.to_vec());
        self
    }

    pub fn cols(mut self, cols: &[i64]) -> Self {
        self.cols = Some(cols.to_vec());
        self
    }

    pub fn rows_cols(self, rows: &[i64], cols: &[i64]) -> Self {
        self.rows(rows).cols(cols)
    }

    pub fn of_label(&self) -> String {
        self.of.join(",")
    }

    pub fn wrt_label(&self) -> String {
        self.wrt.join(",")
    }
}

// ─────────────────────────────────────────────────────────────
//  Normalized block
// ─────────────────────────────────────────────────────────────

/// A validated sub-Jacobian, ready for assembly.
///
/// Structural entries are enumerated in a fixed order (row-major for
/// dense blocks, declaration order for sparse ones); the assembler relies
/// on that order to map entries onto global slots.
#[derive(Debug, Clone, PartialEq)]
pub enum SubJacobian {
    Dense { array: Array2<f64> },
    /// `shape` is the full `(n_of, n_wrt)` extent of the block.
    Sparse { shape: (usize, usize), rows: Vec<usize>, cols: Vec<usize>, values: Vec<f64> },
    NotDependent,
}

/// Wrong number of values supplied when refreshing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMismatch {
    pub expected: usize,
    pub found: usize,
}

impl SubJacobian {
    pub fn is_dependent(&self) -> bool {
        !matches!(self, Self::NotDependent)
    }

    /// Structural nonzero count; dense blocks count every entry.
    pub fn nnz(&self) -> usize {
        match self {
            Self::Dense { array } => array.len(),
            Self::Sparse { rows, .. } => rows.len(),
            Self::NotDependent => 0,
        }
    }

    /// Visit `(row, col, value)` for every structural entry, in slot order.
    pub fn for_each_entry(&self, mut f: impl FnMut(usize, usize, f64)) {
        match self {
            Self::Dense { array } => {
                for ((r, c), &v) in array.indexed_iter() {
                    f(r, c, v);
                }
            }
            Self::Sparse { rows, cols, values, .. } => {
                for k in 0..rows.len() {
                    f(rows[k], cols[k], values[k]);
                }
            }
            Self::NotDependent => {}
        }
    }

    /// Entry values in slot order.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Dense { array } => array.iter().copied().collect(),
            Self::Sparse { values, .. } => values.clone(),
            Self::NotDependent => Vec::new(),
        }
    }

    /// `y += B x`
    pub fn matvec_add(&self, x: &[f64], y: &mut [f64]) {
        match self {
            Self::Dense { array } => {
                for (r, row) in array.outer_iter().enumerate() {
                    y[r] += row.iter().zip(x).map(|(a, b)| a * b).sum::<f64>();
                }
            }
            Self::Sparse { rows, cols, values, .. } => {
                for k in 0..rows.len() {
                    y[rows[k]] += values[k] * x[cols[k]];
                }
            }
            Self::NotDependent => {}
        }
    }

    /// `y += Bᵀ x`
    pub fn matvec_transpose_add(&self, x: &[f64], y: &mut [f64]) {
        match self {
            Self::Dense { array } => {
                for (r, row) in array.outer_iter().enumerate() {
                    let xr = x[r];
                    for (c, &a) in row.iter().enumerate() {
                        y[c] += a * xr;
                    }
                }
            }
            Self::Sparse { rows, cols, values, .. } => {
                for k in 0..rows.len() {
                    y[cols[k]] += values[k] * x[rows[k]];
                }
            }
            Self::NotDependent => {}
        }
    }

    /// Write this block into a dense `(n_of, n_wrt)` buffer (accumulating).
    pub fn add_to_dense(&self, out: &mut Array2<f64>) {
        self.for_each_entry(|r, c, v| out[[r, c]] += v);
    }

    /// Overwrite the numeric values without touching the structure.
    pub fn set_values(&mut self, value: &PartialValue) -> Result<(), SizeMismatch> {
        match self {
            Self::Dense { array } => {
                let expected = array.len();
                match value {
                    PartialValue::Scalar(v) => array.fill(*v),
                    PartialValue::Vector(v) if v.len() == expected => {
                        for (dst, &src) in array.iter_mut().zip(v) {
                            *dst = src;
                        }
                    }
                    PartialValue::Dense(a) if a.dim() == array.dim() => array.assign(a),
                    PartialValue::Coo(t) if (t.rows(), t.cols()) == array.dim() => {
                        array.fill(0.0);
                        for k in 0..t.nnz() {
                            array[[t.row_inds()[k], t.col_inds()[k]]] += t.data()[k];
                        }
                    }
                    other => return Err(SizeMismatch { expected, found: other.len() }),
                }
            }
            Self::Sparse { shape, rows, cols, values } => {
                let expected = values.len();
                match value {
                    PartialValue::Scalar(v) => values.fill(*v),
                    PartialValue::Vector(v) if v.len() == expected => values.copy_from_slice(v),
                    // Gather from the full block at the declared positions.
                    PartialValue::Dense(a) if a.dim() == *shape => {
                        for k in 0..expected {
                            values[k] = a[[rows[k], cols[k]]];
                        }
                    }
                    other => return Err(SizeMismatch { expected, found: other.len() }),
                }
            }
            Self::NotDependent => {
                return Err(SizeMismatch { expected: 0, found: value.len() });
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Validation
// ─────────────────────────────────────────────────────────────

/// Shape-independent checks (rules 1–3), run as soon as a declaration is
/// registered.
pub fn check_sparsity_form(decl: &PartialDeclaration) -> Result<(), DeclarationIssue> {
    match (&decl.rows, &decl.cols) {
        (Some(_), None) | (None, Some(_)) => Err(DeclarationIssue::OneOfRowsCols),
        (Some(rows), Some(cols)) => {
            if rows.len() != cols.len() {
                return Err(DeclarationIssue::RowsColsLength { rows: rows.len(), cols: cols.len() });
            }
            if rows.iter().any(|&r| r < 0) {
                return Err(DeclarationIssue::NegativeRows);
            }
            if cols.iter().any(|&c| c < 0) {
                return Err(DeclarationIssue::NegativeCols);
            }
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

/// Validate one declaration against a concrete `(n_of, n_wrt)` block and
/// normalize it.  Checks run in order; the first failure is returned.
pub fn validate_declaration(
    decl: &PartialDeclaration,
    n_of: usize,
    n_wrt: usize,
) -> Result<SubJacobian, DeclarationIssue> {
    check_sparsity_form(decl)?;

    if !decl.dependent {
        return Ok(SubJacobian::NotDependent);
    }

    if let (Some(rows), Some(cols)) = (&decl.rows, &decl.cols) {
        // Rule 3 guarantees non-negative indices from here on.
        let rows: Vec<usize> = rows.iter().map(|&r| r as usize).collect();
        let cols: Vec<usize> = cols.iter().map(|&c| c as usize).collect();

        if !rows.is_empty() {
            let min_rows = rows.iter().max().map_or(0, |&r| r + 1);
            let min_cols = cols.iter().max().map_or(0, |&c| c + 1);
            if min_rows > n_of || min_cols > n_wrt {
                return Err(DeclarationIssue::IndexOutOfRange {
                    expected_rows: n_of,
                    expected_cols: n_wrt,
                    declared_rows: min_rows,
                    declared_cols: min_cols,
                });
            }
        }

        let nnz = rows.len();
        let values = match &decl.val {
            None => vec![0.0; nnz],
            Some(PartialValue::Scalar(v)) => vec![*v; nnz],
            Some(PartialValue::Vector(v)) if v.len() == nnz => v.clone(),
            Some(other) => {
                return Err(DeclarationIssue::ValueLength { val_shape: other.shape_label(), nnz });
            }
        };
        return Ok(SubJacobian::Sparse { shape: (n_of, n_wrt), rows, cols, values });
    }

    let shape_error = |found_rows: usize, found_cols: usize| DeclarationIssue::ValueShape {
        expected_rows: n_of,
        expected_cols: n_wrt,
        found_rows,
        found_cols,
    };

    match &decl.val {
        None => Ok(SubJacobian::Dense { array: Array2::zeros((n_of, n_wrt)) }),
        Some(PartialValue::Scalar(v)) => Ok(SubJacobian::Dense { array: Array2::from_elem((n_of, n_wrt), *v) }),
        Some(PartialValue::Vector(v)) => {
            if (1, v.len()) != (n_of, n_wrt) {
                return Err(shape_error(1, v.len()));
            }
            let array = Array2::from_shape_vec((1, v.len()), v.clone()).map_err(|_| shape_error(1, v.len()))?;
            Ok(SubJacobian::Dense { array })
        }
        Some(PartialValue::Dense(a)) => {
            if a.dim() != (n_of, n_wrt) {
                return Err(shape_error(a.nrows(), a.ncols()));
            }
            Ok(SubJacobian::Dense { array: a.clone() })
        }
        Some(PartialValue::Coo(t)) => {
            if (t.rows(), t.cols()) != (n_of, n_wrt) {
                return Err(shape_error(t.rows(), t.cols()));
            }
            Ok(SubJacobian::Sparse {
                shape: (n_of, n_wrt),
                rows: t.row_inds().to_vec(),
                cols: t.col_inds().to_vec(),
                values: t.data().to_vec(),
            })
        }
    }
}
