//! Linear vectors: one set of flattened buffers per right-hand-side name.
//!
//! Each set carries the `output` and `residual` roles sized to the model's
//! total output length, plus an `input` buffer the coupling transfer
//! writes into.  A set is allocated per solve call and dropped with it.

use crate::types::{DerivError, VarId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorRole {
    Output,
    Residual,
    Input,
}

/// Buffers for one right-hand-side name.
#[derive(Debug, Clone)]
pub struct LinearVector {
    pub output: Vec<f64>,
    pub residual: Vec<f64>,
    pub input: Vec<f64>,
}

impl LinearVector {
    pub fn zeros(n_outputs: usize, n_inputs: usize) -> Self {
        Self {
            output: vec![0.0; n_outputs],
            residual: vec![0.0; n_outputs],
            input: vec![0.0; n_inputs],
        }
    }

    pub fn role(&self, role: VectorRole) -> &[f64] {
        match role {
            VectorRole::Output => &self.output,
            VectorRole::Residual => &self.residual,
            VectorRole::Input => &self.input,
        }
    }

    pub fn role_mut(&mut self, role: VectorRole) -> &mut [f64] {
        match role {
            VectorRole::Output => &mut self.output,
            VectorRole::Residual => &mut self.residual,
            VectorRole::Input => &mut self.input,
        }
    }
}

/// Mapping from right-hand-side name to its buffers.
#[derive(Debug, Clone)]
pub struct LinearVectors {
    vectors: BTreeMap<String, LinearVector>,
}

impl LinearVectors {
    /// Allocate zeroed buffers for every name.
    pub fn new<S: AsRef<str>>(names: &[S], n_outputs: usize, n_inputs: usize) -> Self {
        let vectors = names
            .iter()
            .map(|n| (n.as_ref().to_string(), LinearVector::zeros(n_outputs, n_inputs)))
            .collect();
        Self { vectors }
    }

    pub fn get(&self, name: &str) -> Result<&LinearVector, DerivError> {
        self.vectors.get(name).ok_or_else(|| DerivError::UnknownRhs(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut LinearVector, DerivError> {
        self.vectors.get_mut(name).ok_or_else(|| DerivError::UnknownRhs(name.to_string()))
    }

    /// Zero one role of the named vectors.
    pub fn zero(&mut self, names: &[String], role: VectorRole) -> Result<(), DerivError> {
        for name in names {
            self.get_mut(name)?.role_mut(role).fill(0.0);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Scope
// ─────────────────────────────────────────────────────────────

/// The variables an apply-linear call may read (forward) or write
/// (reverse), as masks over the model's output and input arenas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub outputs: Vec<bool>,
    pub inputs: Vec<bool>,
}

impl Scope {
    /// Every variable in scope.
    pub fn full(n_output_vars: usize, n_input_vars: usize) -> Self {
        Self { outputs: vec![true; n_output_vars], inputs: vec![true; n_input_vars] }
    }

    pub fn contains_output(&self, id: VarId) -> bool {
        self.outputs.get(id.index()).copied().unwrap_or(false)
    }

    pub fn contains_input(&self, id: VarId) -> bool {
        self.inputs.get(id.index()).copied().unwrap_or(false)
    }
}
