//! Total derivatives of model outputs through the coupled linear system.
//!
//! Forward mode seeds one right-hand side per `wrt` entry and reads the
//! solution from the output vectors; reverse mode seeds one per `of` entry
//! and reads the adjoint from the residual vectors.  All seeds of one call
//! are solved together.

use crate::model::Model;
use crate::types::{DerivError, Mode, SolveReport};
use crate::vectors::VectorRole;
use log::debug;
use ndarray::{s, Array2};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

/// Dense total-derivative blocks keyed by the requested `(of, wrt)` paths.
#[derive(Debug, Clone)]
pub struct TotalJacobian {
    of: Vec<(String, usize)>,
    wrt: Vec<(String, usize)>,
    blocks: HashMap<(String, String), Array2<f64>>,
    pub report: SolveReport,
}

impl TotalJacobian {
    pub fn get(&self, of: &str, wrt: &str) -> Option<&Array2<f64>> {
        self.blocks.get(&(of.to_string(), wrt.to_string()))
    }

    pub fn of(&self) -> impl Iterator<Item = &str> {
        self.of.iter().map(|(p, _)| p.as_str())
    }

    pub fn wrt(&self) -> impl Iterator<Item = &str> {
        self.wrt.iter().map(|(p, _)| p.as_str())
    }

    /// All blocks stitched into one matrix, rows in `of` order and columns
    /// in `wrt` order.
    pub fn to_dense(&self) -> Array2<f64> {
        let n_rows: usize = self.of.iter().map(|(_, n)| n).sum();
        let n_cols: usize = self.wrt.iter().map(|(_, n)| n).sum();
        let mut out = Array2::zeros((n_rows, n_cols));
        let mut r0 = 0;
        for (o, rows) in &self.of {
            let mut c0 = 0;
            for (w, cols) in &self.wrt {
                if let Some(b) = self.blocks.get(&(o.clone(), w.clone())) {
                    out.slice_mut(s![r0..r0 + rows, c0..c0 + cols]).assign(b);
                }
                c0 += cols;
            }
            r0 += rows;
        }
        out
    }
}

fn seed_name(path: &str, k: usize) -> String {
    format!("{path}[{k}]")
}

/// Compute `d(of)/d(wrt)` for every pair of requested paths.
///
/// The model must be set up and linearized.  Input paths stand for their
/// connected source output.
pub fn compute_totals(model: &Model, of: &[&str], wrt: &[&str], mode: Mode) -> Result<TotalJacobian, DerivError> {
    let n = model.layout()?.output_size;
    let of_ranges: Vec<Range<usize>> = of.iter().map(|p| model.output_range(p)).collect::<Result<_, _>>()?;
    let wrt_ranges: Vec<Range<usize>> = wrt.iter().map(|p| model.output_range(p)).collect::<Result<_, _>>()?;

    let (seeds, seed_ranges) = match mode {
        Mode::Forward => (wrt, &wrt_ranges),
        Mode::Reverse => (of, &of_ranges),
    };
    let mut rhs = BTreeMap::new();
    for (path, range) in seeds.iter().zip(seed_ranges) {
        for (k, idx) in range.clone().enumerate() {
            let mut b = vec![0.0; n];
            b[idx] = -1.0;
            rhs.insert(seed_name(path, k), b);
        }
    }
    debug!("compute_totals ({}): {} of x {} wrt, {} seeds", mode, of.len(), wrt.len(), rhs.len());

    let (vectors, report) = model.solve(mode, &rhs)?;

    let mut blocks = HashMap::new();
    for (o, o_range) in of.iter().zip(&of_ranges) {
        for (w, w_range) in wrt.iter().zip(&wrt_ranges) {
            let mut block = Array2::zeros((o_range.len(), w_range.len()));
            match mode {
                Mode::Forward => {
                    for j in 0..w_range.len() {
                        let sol = vectors.get(&seed_name(w, j))?.role(VectorRole::Output);
                        for (i, idx) in o_range.clone().enumerate() {
                            block[[i, j]] = sol[idx];
                        }
                    }
                }
                Mode::Reverse => {
                    for i in 0..o_range.len() {
                        let sol = vectors.get(&seed_name(o, i))?.role(VectorRole::Residual);
                        for (j, idx) in w_range.clone().enumerate() {
                            block[[i, j]] = sol[idx];
                        }
                    }
                }
            }
            blocks.insert((o.to_string(), w.to_string()), block);
        }
    }

    Ok(TotalJacobian {
        of: of.iter().zip(&of_ranges).map(|(p, r)| (p.to_string(), r.len())).collect(),
        wrt: wrt.iter().zip(&wrt_ranges).map(|(p, r)| (p.to_string(), r.len())).collect(),
        blocks,
        report,
    })
}
