//! Local factorizations used by implicit components to invert their own
//! output-output block during `solve_linear`.
//!
//! Symmetric blocks go through `sprs-ldl`; everything else uses a dense LU
//! with partial pivoting, which also supports the transposed solve needed
//! in reverse mode.  LDLᵀ does not pivot, so a symmetric block whose
//! elimination meets a small pivot (indefinite blocks such as `[[0,1],[1,0]]`)
//! is refactored with the LU instead.

use log::debug;
use ndarray::Array2;
use sprs::{FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};

/// Pivots smaller than this are treated as exact zeros.
const PIVOT_TOLERANCE: f64 = 1e-30;

/// LDLᵀ pivots below this fraction of the largest block entry send the
/// block to the pivoting LU.
const LDL_PIVOT_RATIO: f64 = 1e-12;

// ─────────────────────────────────────────────────────────────
//  Factorisation strategy
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorStrategy {
    /// Symmetric block: sparse LDLᵀ, same factor for both modes.
    Ldl,
    /// General block: dense LU with partial pivoting.
    Lu,
}

impl FactorStrategy {
    /// Choose from the structure and values of the block.
    pub fn for_block(block: &Array2<f64>) -> Self {
        let n = block.nrows();
        if n != block.ncols() {
            return Self::Lu;
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if block[[i, j]] != block[[j, i]] {
                    return Self::Lu;
                }
            }
        }
        Self::Ldl
    }
}

// ─────────────────────────────────────────────────────────────
//  Dense LU
// ─────────────────────────────────────────────────────────────

/// Row-pivoted LU of a square dense matrix, `P A = L U`, stored packed.
#[derive(Debug, Clone)]
pub struct DenseLu {
    lu: Array2<f64>,
    perm: Vec<usize>,
}

impl DenseLu {
    /// Gaussian elimination with partial pivoting.  Fails on a zero pivot
    /// and reports the column where elimination broke down.
    pub fn factor(a: &Array2<f64>) -> Result<Self, String> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(format!("block is {}x{}, not square", n, a.ncols()));
        }
        let mut m = a.clone();
        let mut perm: Vec<usize> = (0..n).collect();

        for col in 0..n {
            let mut max_row = col;
            let mut max_val = m[[col, col]].abs();
            for row in (col + 1)..n {
                let v = m[[row, col]].abs();
                if v > max_val {
                    max_val = v;
                    max_row = row;
                }
            }
            if max_val < PIVOT_TOLERANCE {
                return Err(format!("singular matrix (zero pivot in column {col})"));
            }
            if max_row != col {
                for j in 0..n {
                    m.swap([col, j], [max_row, j]);
                }
                perm.swap(col, max_row);
            }

            let pivot = m[[col, col]];
            for row in (col + 1)..n {
                let factor = m[[row, col]] / pivot;
                m[[row, col]] = factor;
                for j in (col + 1)..n {
                    m[[row, j]] -= factor * m[[col, j]];
                }
            }
        }

        Ok(Self { lu: m, perm })
    }

    /// Solve `A x = b`.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.perm.len();
        let mut x: Vec<f64> = self.perm.iter().map(|&p| b[p]).collect();
        // L y = P b  (unit lower)
        for i in 0..n {
            for j in 0..i {
                x[i] -= self.lu[[i, j]] * x[j];
            }
        }
        // U x = y
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                x[i] -= self.lu[[i, j]] * x[j];
            }
            x[i] /= self.lu[[i, i]];
        }
        x
    }

    /// Solve `Aᵀ x = b`.
    pub fn solve_transpose(&self, b: &[f64]) -> Vec<f64> {
        let n = self.perm.len();
        let mut z = b.to_vec();
        // Uᵀ z = b
        for i in 0..n {
            for j in 0..i {
                z[i] -= self.lu[[j, i]] * z[j];
            }
            z[i] /= self.lu[[i, i]];
        }
        // Lᵀ w = z  (unit upper)
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                z[i] -= self.lu[[j, i]] * z[j];
            }
        }
        // x = Pᵀ w
        let mut x = vec![0.0; n];
        for (i, &p) in self.perm.iter().enumerate() {
            x[p] = z[i];
        }
        x
    }
}

// ─────────────────────────────────────────────────────────────
//  Local factorization
// ─────────────────────────────────────────────────────────────

/// Holds the numeric factorization of one component's diagonal block.
pub enum LocalFactor {
    Ldl(LdlNumeric<f64, usize>),
    Lu(DenseLu),
}

impl std::fmt::Debug for LocalFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ldl(_) => write!(f, "LocalFactor::Ldl(...)"),
            Self::Lu(_) => write!(f, "LocalFactor::Lu(...)"),
        }
    }
}

impl LocalFactor {
    /// Factorize a dense block with the strategy its values call for.
    pub fn new(block: &Array2<f64>) -> Result<Self, String> {
        match FactorStrategy::for_block(block) {
            FactorStrategy::Ldl => match Self::ldl(block) {
                Some(ldl) => Ok(Self::Ldl(ldl)),
                None => {
                    debug!("symmetric {}x{} block has a small LDL pivot, using LU", block.nrows(), block.ncols());
                    Ok(Self::Lu(DenseLu::factor(block)?))
                }
            },
            FactorStrategy::Lu => Ok(Self::Lu(DenseLu::factor(block)?)),
        }
    }

    /// Unpivoted LDLᵀ; `None` when it breaks down or a pivot is too small
    /// relative to the block.
    fn ldl(block: &Array2<f64>) -> Option<LdlNumeric<f64, usize>> {
        let n = block.nrows();
        let mut tri = TriMat::new((n, n));
        for ((r, c), &v) in block.indexed_iter() {
            if v != 0.0 || r == c {
                tri.add_triplet(r, c, v);
            }
        }
        let csc = tri.to_csc();
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(csc.view())
            .ok()?;
        let scale = block.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let threshold = (LDL_PIVOT_RATIO * scale).max(PIVOT_TOLERANCE);
        if ldl.d().iter().any(|d| !d.is_finite() || d.abs() < threshold) {
            return None;
        }
        Some(ldl)
    }

    /// Solve `A x = b`.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        match self {
            Self::Ldl(ldl) => ldl.solve(b),
            Self::Lu(lu) => lu.solve(b),
        }
    }

    /// Solve `Aᵀ x = b`; identical to `solve` for the symmetric path.
    pub fn solve_transpose(&self, b: &[f64]) -> Vec<f64> {
        match self {
            Self::Ldl(ldl) => ldl.solve(b),
            Self::Lu(lu) => lu.solve_transpose(b),
        }
    }

    /// Which factorization was actually kept.
    pub fn strategy(&self) -> FactorStrategy {
        match self {
            Self::Ldl(_) => FactorStrategy::Ldl,
            Self::Lu(_) => FactorStrategy::Lu,
        }
    }
}
