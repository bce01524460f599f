//! Components: ordered variables plus the partial declarations between them.
//!
//! A component is built in two phases.  While building, variables are added
//! and declarations registered (shape-independent checks run immediately).
//! `setup_partials` then expands every pattern against the variable list,
//! validates each concrete pair and stores one normalized block per pair.
//! After setup only numeric values may change.

use crate::declare::{check_sparsity_form, validate_declaration, PartialDeclaration, PartialValue, SubJacobian};
use crate::linalg::LocalFactor;
use crate::pattern::{is_pattern, ExpansionCache};
use crate::types::{format_shape, ComponentKind, DeclarationIssue, DerivError, Mode, VarKind, Variable};
use log::{debug, warn};
use ndarray::Array2;
use std::collections::{HashMap, HashSet};

/// One validated `(of, wrt)` block, addressed by local variable index.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialBlock {
    pub of: usize,
    pub wrt: usize,
    pub sub: SubJacobian,
}

#[derive(Debug)]
pub struct Component {
    pub name: String,
    pub kind: ComponentKind,
    variables: Vec<Variable>,
    declarations: Vec<PartialDeclaration>,
    /// Offset of each variable inside the component's own output or
    /// input space (depending on its kind).
    local_offsets: Vec<usize>,
    output_size: usize,
    input_size: usize,
    blocks: Vec<PartialBlock>,
    block_lookup: HashMap<(usize, usize), usize>,
    /// Factorization of the output-output block (implicit only).
    factor: Option<Result<LocalFactor, String>>,
    is_setup: bool,
}

impl Component {
    pub fn new(name: &str, kind: ComponentKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            variables: Vec::new(),
            declarations: Vec::new(),
            local_offsets: Vec::new(),
            output_size: 0,
            input_size: 0,
            blocks: Vec::new(),
            block_lookup: HashMap::new(),
            factor: None,
            is_setup: false,
        }
    }

    pub fn explicit(name: &str) -> Self {
        Self::new(name, ComponentKind::Explicit)
    }

    pub fn implicit(name: &str) -> Self {
        Self::new(name, ComponentKind::Implicit)
    }

    // ── Variables ──────────────────────────────────────────

    pub fn add_input(&mut self, name: &str, shape: &[usize]) -> Result<(), DerivError> {
        self.add_variable(Variable::input(name, shape))
    }

    pub fn add_output(&mut self, name: &str, shape: &[usize]) -> Result<(), DerivError> {
        self.add_variable(Variable::output(name, shape))
    }

    fn add_variable(&mut self, var: Variable) -> Result<(), DerivError> {
        if self.variable_index(&var.name).is_some() {
            return Err(DerivError::DuplicateVariable { component: self.name.clone(), name: var.name });
        }
        if var.shape.contains(&0) {
            return Err(DerivError::InvalidShape {
                component: self.name.clone(),
                shape: format_shape(&var.shape),
                name: var.name,
            });
        }
        let size = var.size();
        let offset = match var.kind {
            VarKind::Output => {
                self.output_size += size;
                self.output_size - size
            }
            VarKind::Input => {
                self.input_size += size;
                self.input_size - size
            }
        };
        self.local_offsets.push(offset);
        self.variables.push(var);
        self.is_setup = false;
        Ok(())
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Ordered `(name, shape)` list, outputs and inputs interleaved as added.
    pub fn list_variables(&self) -> Vec<(&str, &[usize])> {
        self.variables.iter().map(|v| (v.name.as_str(), v.shape.as_slice())).collect()
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    pub fn local_offset(&self, var: usize) -> usize {
        self.local_offsets[var]
    }

    /// Flattened length of all outputs.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Flattened length of all inputs.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    fn require_variable(&self, name: &str) -> Result<usize, DerivError> {
        self.variable_index(name).ok_or_else(|| DerivError::UnknownVariable {
            component: self.name.clone(),
            name: name.to_string(),
        })
    }

    // ── Declarations ───────────────────────────────────────

    /// Register a declaration.  Rows/cols consistency is checked now;
    /// everything that needs variable sizes waits for `setup_partials`.
    pub fn declare_partials(&mut self, decl: PartialDeclaration) -> Result<(), DerivError> {
        check_sparsity_form(&decl).map_err(|issue| DerivError::Declaration {
            component: self.name.clone(),
            of: decl.of_label(),
            wrt: decl.wrt_label(),
            issue,
        })?;
        self.declarations.push(decl);
        self.is_setup = false;
        Ok(())
    }

    pub fn declarations(&self) -> &[PartialDeclaration] {
        &self.declarations
    }

    /// Local indices `wrt` patterns expand against.
    fn wrt_candidates(&self) -> Vec<usize> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, v)| self.kind == ComponentKind::Implicit || !v.is_output())
            .map(|(i, _)| i)
            .collect()
    }

    fn output_indices(&self) -> Vec<usize> {
        self.variables.iter().enumerate().filter(|(_, v)| v.is_output()).map(|(i, _)| i).collect()
    }

    /// Expand, validate and normalize every declaration.
    ///
    /// Pairs never mentioned default to a dense zero block when `wrt` is an
    /// input.  `dependent=false` wins over any numeric declaration of the
    /// same pair; among numeric declarations the last one wins.
    pub fn setup_partials(&mut self) -> Result<(), DerivError> {
        let outputs = self.output_indices();
        let wrt_vars = self.wrt_candidates();
        let mut of_cache = ExpansionCache::new(outputs.iter().map(|&i| self.variables[i].name.clone()).collect());
        let mut wrt_cache = ExpansionCache::new(wrt_vars.iter().map(|&i| self.variables[i].name.clone()).collect());

        let mut declared: HashMap<(usize, usize), SubJacobian> = HashMap::new();
        let mut independent: HashSet<(usize, usize)> = HashSet::new();

        for decl in &self.declarations {
            self.check_literal_roles(decl, &wrt_vars)?;
            let of_hits: Vec<usize> = of_cache.expand_all(&decl.of).into_iter().map(|k| outputs[k]).collect();
            let wrt_hits: Vec<usize> = wrt_cache.expand_all(&decl.wrt).into_iter().map(|k| wrt_vars[k]).collect();
            // Only reachable through patterns; literals were checked above.
            if of_hits.is_empty() || wrt_hits.is_empty() {
                debug!(
                    "{}: d({})/d({}) matched no variables, ignored",
                    self.name,
                    decl.of_label(),
                    decl.wrt_label()
                );
                continue;
            }
            debug!(
                "{}: d({})/d({}) expands to {} pair(s)",
                self.name,
                decl.of_label(),
                decl.wrt_label(),
                of_hits.len() * wrt_hits.len()
            );

            for &of in &of_hits {
                for &wrt in &wrt_hits {
                    let n_of = self.variables[of].size();
                    let n_wrt = self.variables[wrt].size();
                    let sub = validate_declaration(decl, n_of, n_wrt).map_err(|issue| DerivError::Declaration {
                        component: self.name.clone(),
                        of: self.variables[of].name.clone(),
                        wrt: self.variables[wrt].name.clone(),
                        issue,
                    })?;
                    if sub.is_dependent() {
                        declared.insert((of, wrt), sub);
                    } else {
                        independent.insert((of, wrt));
                    }
                }
            }
        }

        // Canonical block order: outputs by declaration order, then wrt.
        let mut blocks = Vec::new();
        for &of in &outputs {
            for &wrt in &wrt_vars {
                let key = (of, wrt);
                let sub = if independent.contains(&key) {
                    SubJacobian::NotDependent
                } else if let Some(sub) = declared.remove(&key) {
                    sub
                } else if !self.variables[wrt].is_output() {
                    let shape = (self.variables[of].size(), self.variables[wrt].size());
                    SubJacobian::Dense { array: Array2::zeros(shape) }
                } else {
                    continue;
                };
                blocks.push(PartialBlock { of, wrt, sub });
            }
        }

        self.block_lookup = blocks.iter().enumerate().map(|(k, b)| ((b.of, b.wrt), k)).collect();
        self.blocks = blocks;
        self.factor = None;
        self.is_setup = true;
        Ok(())
    }

    /// Literal names must exist and sit on the right side of the pair.
    fn check_literal_roles(&self, decl: &PartialDeclaration, wrt_vars: &[usize]) -> Result<(), DerivError> {
        let misplaced = |issue| DerivError::Declaration {
            component: self.name.clone(),
            of: decl.of_label(),
            wrt: decl.wrt_label(),
            issue,
        };
        for name in decl.of.iter().filter(|n| !is_pattern(n)) {
            if !self.variables[self.require_variable(name)?].is_output() {
                return Err(misplaced(DeclarationIssue::OfNotOutput(name.clone())));
            }
        }
        for name in decl.wrt.iter().filter(|n| !is_pattern(n)) {
            if !wrt_vars.contains(&self.require_variable(name)?) {
                return Err(misplaced(DeclarationIssue::WrtIsOutput(name.clone())));
            }
        }
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    /// Validated blocks in canonical order (includes `NotDependent` markers).
    pub fn blocks(&self) -> &[PartialBlock] {
        &self.blocks
    }

    pub fn partial(&self, of: &str, wrt: &str) -> Option<&SubJacobian> {
        let key = (self.variable_index(of)?, self.variable_index(wrt)?);
        self.block_lookup.get(&key).map(|&k| &self.blocks[k].sub)
    }

    /// True when the diagonal `(of, of)` block was declared explicitly,
    /// replacing the default −1 identity.
    pub fn overrides_diagonal(&self, of: usize) -> bool {
        self.block_lookup.contains_key(&(of, of))
    }

    /// Refresh the numeric values of one block in place.
    pub fn set_partial(&mut self, of: &str, wrt: &str, value: impl Into<PartialValue>) -> Result<(), DerivError> {
        let of_idx = self.require_variable(of)?;
        let wrt_idx = self.require_variable(wrt)?;
        let not_declared = || DerivError::PartialNotDeclared {
            component: self.name.clone(),
            of: of.to_string(),
            wrt: wrt.to_string(),
        };
        let k = match self.block_lookup.get(&(of_idx, wrt_idx)) {
            Some(&k) if self.blocks[k].sub.is_dependent() => k,
            _ => return Err(not_declared()),
        };
        let value = value.into();
        self.blocks[k].sub.set_values(&value).map_err(|m| DerivError::PartialSize {
            component: self.name.clone(),
            of: of.to_string(),
            wrt: wrt.to_string(),
            expected: m.expected,
            found: m.found,
        })
    }

    // ── Linearization ──────────────────────────────────────

    /// Dense output-output block: declared output blocks plus the default
    /// −1 identity on every diagonal that was not overridden.
    pub fn own_block(&self) -> Array2<f64> {
        let n = self.output_size;
        let mut block = Array2::zeros((n, n));
        for b in &self.blocks {
            if !self.variables[b.wrt].is_output() {
                continue;
            }
            let r0 = self.local_offsets[b.of];
            let c0 = self.local_offsets[b.wrt];
            b.sub.for_each_entry(|r, c, v| block[[r0 + r, c0 + c]] += v);
        }
        for (i, var) in self.variables.iter().enumerate() {
            if var.is_output() && !self.overrides_diagonal(i) {
                let off = self.local_offsets[i];
                for k in 0..var.size() {
                    block[[off + k, off + k]] = -1.0;
                }
            }
        }
        block
    }

    /// Refresh the local factorization from the current values.
    ///
    /// A singular block is not an error here: it is recorded and reported
    /// by the first `solve_linear` that needs it.
    pub fn linearize(&mut self) {
        if self.kind != ComponentKind::Implicit {
            return;
        }
        let result = LocalFactor::new(&self.own_block());
        if let Err(reason) = &result {
            warn!("{}: local factorization failed: {}", self.name, reason);
        }
        self.factor = Some(result);
    }

    /// `residuals += J · [outputs; inputs]` over the variables `include`
    /// accepts (forward), or `[outputs; inputs] += Jᵀ · residuals` (reverse).
    ///
    /// All slices are the component's own ranges of the model vectors.
    pub fn apply_linear(
        &self,
        mode: Mode,
        include: impl Fn(usize) -> bool,
        outputs: &mut [f64],
        inputs: &mut [f64],
        residuals: &mut [f64],
    ) {
        for b in &self.blocks {
            if !b.sub.is_dependent() || !include(b.wrt) {
                continue;
            }
            let wrt_var = &self.variables[b.wrt];
            let (r0, r1) = (self.local_offsets[b.of], self.local_offsets[b.of] + self.variables[b.of].size());
            let (c0, c1) = (self.local_offsets[b.wrt], self.local_offsets[b.wrt] + wrt_var.size());
            match (mode, wrt_var.is_output()) {
                (Mode::Forward, true) => b.sub.matvec_add(&outputs[c0..c1], &mut residuals[r0..r1]),
                (Mode::Forward, false) => b.sub.matvec_add(&inputs[c0..c1], &mut residuals[r0..r1]),
                (Mode::Reverse, true) => b.sub.matvec_transpose_add(&residuals[r0..r1], &mut outputs[c0..c1]),
                (Mode::Reverse, false) => b.sub.matvec_transpose_add(&residuals[r0..r1], &mut inputs[c0..c1]),
            }
        }
        // Default identity blocks.
        for (i, var) in self.variables.iter().enumerate() {
            if !var.is_output() || self.overrides_diagonal(i) || !include(i) {
                continue;
            }
            let off = self.local_offsets[i];
            for k in off..off + var.size() {
                match mode {
                    Mode::Forward => residuals[k] -= outputs[k],
                    Mode::Reverse => outputs[k] -= residuals[k],
                }
            }
        }
    }

    /// Invert the output-output block: forward maps `residuals` into
    /// `outputs`, reverse maps `outputs` into `residuals` with the transpose.
    pub fn solve_linear(&self, mode: Mode, outputs: &mut [f64], residuals: &mut [f64]) -> Result<(), String> {
        match self.kind {
            ComponentKind::Explicit => {
                match mode {
                    Mode::Forward => {
                        for (o, r) in outputs.iter_mut().zip(residuals.iter()) {
                            *o = -*r;
                        }
                    }
                    Mode::Reverse => {
                        for (r, o) in residuals.iter_mut().zip(outputs.iter()) {
                            *r = -*o;
                        }
                    }
                }
                Ok(())
            }
            ComponentKind::Implicit => {
                let factor = match &self.factor {
                    Some(Ok(f)) => f,
                    Some(Err(reason)) => return Err(reason.clone()),
                    None => return Err("factorization not computed (call linearize first)".to_string()),
                };
                match mode {
                    Mode::Forward => outputs.copy_from_slice(&factor.solve(residuals)),
                    Mode::Reverse => residuals.copy_from_slice(&factor.solve_transpose(outputs)),
                }
                Ok(())
            }
        }
    }
}
