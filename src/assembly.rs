//! Global Jacobian assembly.
//!
//! The global matrix is square over every output of the model.  A block
//! taken with respect to an input lands in the column range of that
//! input's source output, so the matrix describes the whole coupled
//! linear system.
//!
//! Structure is computed once: every structural entry of every dependent
//! block, plus the default −1 identity, is mapped to a slot.  Entries that
//! land on the same position share a slot and are summed.  `linearize`
//! then zeroes the values and re-accumulates them through the precomputed
//! slot map, so the index arrays never change after the first assembly
//! and explicit zeros are never dropped.

use crate::component::Component;
use crate::model::Layout;
use crate::types::{DerivError, MatrixFormat, VarId};
use log::debug;
use ndarray::Array2;
use sprs::{CsMat, TriMat};
use std::collections::{HashMap, HashSet};
use std::ops::Range;

// ─────────────────────────────────────────────────────────────
//  Slot mapping
// ─────────────────────────────────────────────────────────────

/// For one component block: the slot of each structural entry, in the
/// block's own entry order.
#[derive(Debug, Clone)]
struct BlockSlots {
    component: usize,
    block: usize,
    slots: Vec<usize>,
}

#[derive(Debug, Clone)]
enum Storage {
    Dense(Array2<f64>),
    Coo {
        data: Vec<f64>,
        /// Slots grouped by row: `row_slots[row_ptr[r]..row_ptr[r + 1]]`.
        row_ptr: Vec<usize>,
        row_slots: Vec<usize>,
    },
    Csr(CsMat<f64>),
}

// ─────────────────────────────────────────────────────────────
//  Global Jacobian
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GlobalJacobian {
    format: MatrixFormat,
    n: usize,
    /// Structural position of each slot.
    rows: Vec<usize>,
    cols: Vec<usize>,
    storage: Storage,
    block_slots: Vec<BlockSlots>,
    identity_slots: Vec<usize>,
    /// `(row output, column output)` variable pairs with at least one slot.
    presence: HashSet<(VarId, VarId)>,
}

impl GlobalJacobian {
    /// Build the fixed structure from set-up components.  Values are all
    /// zero until the first `linearize`.
    pub fn new(format: MatrixFormat, components: &[Component], layout: &Layout) -> Result<Self, DerivError> {
        let n = layout.output_size;
        let mut positions: Vec<(usize, usize)> = Vec::new();
        let mut position_slot: HashMap<(usize, usize), usize> = HashMap::new();
        let mut slot_of = |r: usize, c: usize| -> usize {
            *position_slot.entry((r, c)).or_insert_with(|| {
                positions.push((r, c));
                positions.len() - 1
            })
        };

        let mut block_slots = Vec::new();
        let mut identity_slots = Vec::new();
        let mut presence = HashSet::new();

        for (ci, comp) in components.iter().enumerate() {
            if !comp.is_setup() {
                return Err(DerivError::NotSetUp);
            }
            let ids = &layout.var_ids[ci];
            for (vi, var) in comp.variables().iter().enumerate() {
                if !var.is_output() {
                    continue;
                }
                let row_id = ids[vi];
                let row0 = layout.outputs[row_id.index()].offset;

                if !comp.overrides_diagonal(vi) {
                    for k in 0..var.size() {
                        identity_slots.push(slot_of(row0 + k, row0 + k));
                    }
                    presence.insert((row_id, row_id));
                }

                for (bi, block) in comp.blocks().iter().enumerate() {
                    if block.of != vi || !block.sub.is_dependent() {
                        continue;
                    }
                    let col_id = match layout.column_of(ci, block.wrt) {
                        Some(id) => id,
                        None => {
                            debug!(
                                "{}: d({})/d({}) has no source output, left out of the global Jacobian",
                                comp.name,
                                var.name,
                                comp.variables()[block.wrt].name
                            );
                            continue;
                        }
                    };
                    let col0 = layout.outputs[col_id.index()].offset;
                    let mut slots = Vec::with_capacity(block.sub.nnz());
                    block.sub.for_each_entry(|r, c, _| slots.push(slot_of(row0 + r, col0 + c)));
                    presence.insert((row_id, col_id));
                    block_slots.push(BlockSlots { component: ci, block: bi, slots });
                }
            }
        }
        drop(slot_of);

        // Compressed and dense storage want positions sorted row-major; the
        // coordinate form keeps discovery order.
        if format != MatrixFormat::Coo {
            let mut order: Vec<usize> = (0..positions.len()).collect();
            order.sort_by_key(|&k| positions[k]);
            let mut remap = vec![0; positions.len()];
            for (new, &old) in order.iter().enumerate() {
                remap[old] = new;
            }
            positions = order.iter().map(|&k| positions[k]).collect();
            for b in &mut block_slots {
                for s in &mut b.slots {
                    *s = remap[*s];
                }
            }
            for s in &mut identity_slots {
                *s = remap[*s];
            }
        }

        let rows: Vec<usize> = positions.iter().map(|p| p.0).collect();
        let cols: Vec<usize> = positions.iter().map(|p| p.1).collect();
        let nnz = rows.len();

        let storage = match format {
            MatrixFormat::Dense => Storage::Dense(Array2::zeros((n, n))),
            MatrixFormat::Coo => {
                let (row_ptr, row_slots) = group_by_row(n, &rows);
                Storage::Coo { data: vec![0.0; nnz], row_ptr, row_slots }
            }
            MatrixFormat::Csr => {
                let (indptr, _) = group_by_row(n, &rows);
                Storage::Csr(CsMat::new((n, n), indptr, cols.clone(), vec![0.0; nnz]))
            }
        };

        debug!("global Jacobian ({:?}): {}x{}, {} structural nonzeros", format, n, n, nnz);

        Ok(Self { format, n, rows, cols, storage, block_slots, identity_slots, presence })
    }

    pub fn format(&self) -> MatrixFormat {
        self.format
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n, self.n)
    }

    /// Structural nonzeros, explicit zeros included.
    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    /// Row and column index of every slot.
    pub fn structure(&self) -> (&[usize], &[usize]) {
        (&self.rows, &self.cols)
    }

    pub fn has_block(&self, row: VarId, col: VarId) -> bool {
        self.presence.contains(&(row, col))
    }

    fn add_at(&mut self, slot: usize, value: f64) {
        let (r, c) = (self.rows[slot], self.cols[slot]);
        match &mut self.storage {
            Storage::Dense(a) => a[[r, c]] += value,
            Storage::Coo { data, .. } => data[slot] += value,
            Storage::Csr(m) => m.data_mut()[slot] += value,
        }
    }

    /// Value currently held by one slot.
    pub fn value(&self, slot: usize) -> f64 {
        match &self.storage {
            Storage::Dense(a) => a[[self.rows[slot], self.cols[slot]]],
            Storage::Coo { data, .. } => data[slot],
            Storage::Csr(m) => m.data()[slot],
        }
    }

    /// Slot values, in slot order.
    pub fn values(&self) -> Vec<f64> {
        (0..self.nnz()).map(|k| self.value(k)).collect()
    }

    /// Overwrite every value from the components' current blocks.
    /// Structure is untouched.
    pub fn linearize(&mut self, components: &[Component]) {
        match &mut self.storage {
            Storage::Dense(a) => a.fill(0.0),
            Storage::Coo { data, .. } => data.fill(0.0),
            Storage::Csr(m) => m.data_mut().fill(0.0),
        }
        for s in self.identity_slots.clone() {
            self.add_at(s, -1.0);
        }
        for bi in 0..self.block_slots.len() {
            let (ci, block) = (self.block_slots[bi].component, self.block_slots[bi].block);
            let values = components[ci].blocks()[block].sub.values();
            for (k, v) in values.into_iter().enumerate() {
                let slot = self.block_slots[bi].slots[k];
                self.add_at(slot, v);
            }
        }
    }

    /// Visit `(row, col, value)` for every stored entry in `rows`.
    ///
    /// The dense form visits every column of each row.
    pub fn for_each_in_rows(&self, rows: Range<usize>, mut f: impl FnMut(usize, usize, f64)) {
        match &self.storage {
            Storage::Dense(a) => {
                for r in rows {
                    for c in 0..self.n {
                        f(r, c, a[[r, c]]);
                    }
                }
            }
            Storage::Coo { data, row_ptr, row_slots } => {
                for r in rows {
                    for &k in &row_slots[row_ptr[r]..row_ptr[r + 1]] {
                        f(r, self.cols[k], data[k]);
                    }
                }
            }
            Storage::Csr(m) => {
                let indptr = m.indptr();
                let indptr = indptr.raw_storage();
                for r in rows {
                    for idx in indptr[r]..indptr[r + 1] {
                        f(r, m.indices()[idx], m.data()[idx]);
                    }
                }
            }
        }
    }

    // ── Conversions ────────────────────────────────────────

    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.n, self.n));
        for k in 0..self.nnz() {
            out[[self.rows[k], self.cols[k]]] = self.value(k);
        }
        out
    }

    /// Coordinate copy, one triplet per slot.
    pub fn to_coo(&self) -> TriMat<f64> {
        TriMat::from_triplets((self.n, self.n), self.rows.clone(), self.cols.clone(), self.values())
    }

    /// Compressed-row copy with every structural slot kept.
    pub fn to_csr(&self) -> CsMat<f64> {
        if let Storage::Csr(m) = &self.storage {
            return m.clone();
        }
        let mut order: Vec<usize> = (0..self.nnz()).collect();
        order.sort_by_key(|&k| (self.rows[k], self.cols[k]));
        let sorted_rows: Vec<usize> = order.iter().map(|&k| self.rows[k]).collect();
        let (indptr, _) = group_by_row(self.n, &sorted_rows);
        let indices = order.iter().map(|&k| self.cols[k]).collect();
        let data = order.iter().map(|&k| self.value(k)).collect();
        CsMat::new((self.n, self.n), indptr, indices, data)
    }
}

/// Counting sort of slots by row.  Returns `(row_ptr, slots)` where
/// `slots[row_ptr[r]..row_ptr[r + 1]]` lists the slots of row `r` in
/// ascending slot order.
fn group_by_row(n: usize, rows: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut row_ptr = vec![0usize; n + 1];
    for &r in rows {
        row_ptr[r + 1] += 1;
    }
    for r in 0..n {
        row_ptr[r + 1] += row_ptr[r];
    }
    let mut next = row_ptr.clone();
    let mut slots = vec![0usize; rows.len()];
    for (k, &r) in rows.iter().enumerate() {
        slots[next[r]] = k;
        next[r] += 1;
    }
    (row_ptr, slots)
}
