//! A flat coupled model: components, the connections between them, and
//! the global variable layout resolved at setup.
//!
//! Every variable gets a stable [`VarId`] in its arena (outputs or inputs)
//! and a fixed offset into the flattened vectors.  Outputs are laid out in
//! component order, then local declaration order, so each component's
//! outputs (and inputs) occupy one contiguous range.

use crate::assembly::GlobalJacobian;
use crate::component::Component;
use crate::declare::PartialValue;
use crate::solver::{BlockJacobi, LocalOperator, LocalSolveError, Transfer};
use crate::types::{
    DerivError, JacobianMode, LinearSolverOptions, MatrixFormat, Mode, SolveReport, VarId, VarKind,
};
use crate::vectors::{LinearVector, LinearVectors, Scope};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

// ─────────────────────────────────────────────────────────────
//  Layout
// ─────────────────────────────────────────────────────────────

/// Where one variable lives in the flattened model vectors.
#[derive(Debug, Clone)]
pub struct VarSlot {
    /// `"component.variable"`
    pub path: String,
    pub component: usize,
    /// Index in the component's variable list.
    pub local: usize,
    pub offset: usize,
    pub size: usize,
}

impl VarSlot {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Name → index tables computed once at setup.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub outputs: Vec<VarSlot>,
    pub inputs: Vec<VarSlot>,
    pub output_size: usize,
    pub input_size: usize,
    /// Per component, per local variable: id in the output or input arena.
    pub var_ids: Vec<Vec<VarId>>,
    /// Source output of each input (`None` when unconnected).
    pub sources: Vec<Option<VarId>>,
    pub output_ranges: Vec<Range<usize>>,
    pub input_ranges: Vec<Range<usize>>,
    /// Output id of every flattened output position.
    pub column_owner: Vec<VarId>,
    lookup: HashMap<String, (VarKind, VarId)>,
}

impl Layout {
    pub fn resolve(&self, path: &str) -> Option<(VarKind, VarId)> {
        self.lookup.get(path).copied()
    }

    /// Output whose columns hold derivatives with respect to local variable
    /// `local` of component `comp`: the variable itself for an output, the
    /// connected source for an input.
    pub fn column_of(&self, comp: usize, local: usize) -> Option<VarId> {
        let id = self.var_ids[comp][local];
        if self.outputs.get(id.index()).map_or(false, |s| s.component == comp && s.local == local) {
            Some(id)
        } else {
            self.sources[id.index()]
        }
    }

    /// Resolve a path to the output that carries its values.
    pub fn output_for(&self, path: &str) -> Result<VarId, DerivError> {
        match self.resolve(path) {
            Some((VarKind::Output, id)) => Ok(id),
            Some((VarKind::Input, id)) => self.sources[id.index()]
                .ok_or_else(|| DerivError::Connection(format!("input '{path}' is not connected to any output"))),
            None => Err(unknown_path(path)),
        }
    }
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    path.split_once('.')
}

fn unknown_path(path: &str) -> DerivError {
    match split_path(path) {
        Some((comp, var)) => DerivError::UnknownVariable { component: comp.to_string(), name: var.to_string() },
        None => DerivError::Connection(format!("'{path}' is not a 'component.variable' path")),
    }
}

// ─────────────────────────────────────────────────────────────
//  Model
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Model {
    components: Vec<Component>,
    connections: Vec<(String, String)>,
    pub jacobian_mode: JacobianMode,
    pub options: LinearSolverOptions,
    layout: Option<Layout>,
    jacobian: Option<GlobalJacobian>,
    coupling_scopes: Vec<Scope>,
    full_scope: Scope,
    linearized: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            connections: Vec::new(),
            jacobian_mode: JacobianMode::Local,
            options: LinearSolverOptions::default(),
            layout: None,
            jacobian: None,
            coupling_scopes: Vec::new(),
            full_scope: Scope::default(),
            linearized: false,
        }
    }

    pub fn with_jacobian_mode(mut self, mode: JacobianMode) -> Self {
        self.jacobian_mode = mode;
        self
    }

    pub fn with_options(mut self, options: LinearSolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn add_component(&mut self, component: Component) -> Result<(), DerivError> {
        if self.components.iter().any(|c| c.name == component.name) {
            return Err(DerivError::DuplicateComponent(component.name));
        }
        self.components.push(component);
        self.invalidate();
        Ok(())
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Feed `source` (an output path) into `target` (an input path).
    /// Paths are checked at setup.
    pub fn connect(&mut self, source: &str, target: &str) {
        self.connections.push((source.to_string(), target.to_string()));
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.layout = None;
        self.jacobian = None;
        self.linearized = false;
    }

    pub fn is_setup(&self) -> bool {
        self.layout.is_some() && self.components.iter().all(|c| c.is_setup())
    }

    pub fn layout(&self) -> Result<&Layout, DerivError> {
        self.layout.as_ref().ok_or(DerivError::NotSetUp)
    }

    /// Assembled global Jacobian.  Built at setup in every mode, so its
    /// structure can be inspected even when the solver applies component
    /// blocks directly.
    pub fn jacobian(&self) -> Result<&GlobalJacobian, DerivError> {
        self.jacobian.as_ref().ok_or(DerivError::NotSetUp)
    }

    // ── Setup ──────────────────────────────────────────────

    /// Validate every declaration, resolve the layout and connections,
    /// and build the global Jacobian structure.
    pub fn setup(&mut self) -> Result<(), DerivError> {
        self.invalidate();
        for comp in &mut self.components {
            comp.setup_partials()?;
        }
        let layout = self.build_layout()?;

        self.coupling_scopes = (0..self.components.len())
            .map(|ci| Scope {
                outputs: layout.outputs.iter().map(|s| s.component != ci).collect(),
                inputs: layout.sources.iter().map(|s| s.is_some()).collect(),
            })
            .collect();
        self.full_scope = Scope::full(layout.outputs.len(), layout.inputs.len());

        let format = match self.jacobian_mode {
            JacobianMode::Assembled(format) => format,
            JacobianMode::Local => MatrixFormat::Csr,
        };
        let jacobian = GlobalJacobian::new(format, &self.components, &layout)?;
        info!(
            "model setup: {} components, {} outputs ({} entries), {} inputs, {} connections, nnz {}",
            self.components.len(),
            layout.outputs.len(),
            layout.output_size,
            layout.inputs.len(),
            self.connections.len(),
            jacobian.nnz()
        );
        self.layout = Some(layout);
        self.jacobian = Some(jacobian);
        Ok(())
    }

    fn build_layout(&self) -> Result<Layout, DerivError> {
        let mut layout = Layout::default();
        for (ci, comp) in self.components.iter().enumerate() {
            let out_start = layout.output_size;
            let in_start = layout.input_size;
            let mut ids = Vec::with_capacity(comp.variables().len());
            for (vi, var) in comp.variables().iter().enumerate() {
                let path = format!("{}.{}", comp.name, var.name);
                let size = var.size();
                let (arena, total) = match var.kind {
                    VarKind::Output => (&mut layout.outputs, &mut layout.output_size),
                    VarKind::Input => (&mut layout.inputs, &mut layout.input_size),
                };
                let id = VarId(arena.len());
                arena.push(VarSlot { path: path.clone(), component: ci, local: vi, offset: *total, size });
                *total += size;
                if var.kind == VarKind::Output {
                    layout.column_owner.extend(std::iter::repeat(id).take(size));
                }
                layout.lookup.insert(path, (var.kind, id));
                ids.push(id);
            }
            layout.var_ids.push(ids);
            layout.output_ranges.push(out_start..layout.output_size);
            layout.input_ranges.push(in_start..layout.input_size);
        }

        layout.sources = vec![None; layout.inputs.len()];
        for (src, tgt) in &self.connections {
            let src_id = match layout.resolve(src) {
                Some((VarKind::Output, id)) => id,
                Some((VarKind::Input, _)) => {
                    return Err(DerivError::Connection(format!("source '{src}' is an input, not an output")))
                }
                None => return Err(self.missing(src)),
            };
            let tgt_id = match layout.resolve(tgt) {
                Some((VarKind::Input, id)) => id,
                Some((VarKind::Output, _)) => {
                    return Err(DerivError::Connection(format!("target '{tgt}' is an output, not an input")))
                }
                None => return Err(self.missing(tgt)),
            };
            let (s, t) = (&layout.outputs[src_id.index()], &layout.inputs[tgt_id.index()]);
            if s.size != t.size {
                return Err(DerivError::Connection(format!(
                    "cannot connect '{src}' (size {}) to '{tgt}' (size {})",
                    s.size, t.size
                )));
            }
            if s.component == t.component {
                return Err(DerivError::Connection(format!(
                    "'{src}' and '{tgt}' belong to the same component"
                )));
            }
            if let Some(prev) = layout.sources[tgt_id.index()] {
                return Err(DerivError::Connection(format!(
                    "input '{tgt}' is already connected to '{}'",
                    layout.outputs[prev.index()].path
                )));
            }
            debug!("connect {} -> {}", src, tgt);
            layout.sources[tgt_id.index()] = Some(src_id);
        }
        Ok(layout)
    }

    fn missing(&self, path: &str) -> DerivError {
        match split_path(path) {
            Some((comp, _)) if self.component(comp).is_none() => DerivError::UnknownComponent(comp.to_string()),
            _ => unknown_path(path),
        }
    }

    // ── Linearization ──────────────────────────────────────

    /// Refresh local factorizations and the global Jacobian's values in
    /// place.  The structure never changes after setup.
    pub fn linearize(&mut self) -> Result<(), DerivError> {
        if !self.is_setup() {
            return Err(DerivError::NotSetUp);
        }
        for comp in &mut self.components {
            comp.linearize();
        }
        let jacobian = self.jacobian.as_mut().ok_or(DerivError::NotSetUp)?;
        jacobian.linearize(&self.components);
        self.linearized = true;
        Ok(())
    }

    /// Overwrite the values of one declared block.  Takes effect at the
    /// next `linearize`.
    pub fn set_partial(
        &mut self,
        component: &str,
        of: &str,
        wrt: &str,
        value: impl Into<PartialValue>,
    ) -> Result<(), DerivError> {
        let comp = self
            .components
            .iter_mut()
            .find(|c| c.name == component)
            .ok_or_else(|| DerivError::UnknownComponent(component.to_string()))?;
        comp.set_partial(of, wrt, value)
    }

    // ── Introspection ──────────────────────────────────────

    /// True when `d(of)/d(wrt)` occupies at least one slot of the global
    /// Jacobian.  An input `wrt` is looked up through its source output.
    pub fn has_block(&self, of: &str, wrt: &str) -> Result<bool, DerivError> {
        let layout = self.layout()?;
        let row = match layout.resolve(of) {
            Some((VarKind::Output, id)) => id,
            Some((VarKind::Input, _)) => return Ok(false),
            None => return Err(unknown_path(of)),
        };
        let col = match layout.resolve(wrt) {
            Some((VarKind::Output, id)) => id,
            Some((VarKind::Input, id)) => match layout.sources[id.index()] {
                Some(src) => src,
                None => return Ok(false),
            },
            None => return Err(unknown_path(wrt)),
        };
        Ok(self.jacobian()?.has_block(row, col))
    }

    /// Flattened range of an output path, or of an input's source.
    pub fn output_range(&self, path: &str) -> Result<Range<usize>, DerivError> {
        let layout = self.layout()?;
        let id = layout.output_for(path)?;
        Ok(layout.outputs[id.index()].range())
    }

    // ── Solve ──────────────────────────────────────────────

    /// Run block Jacobi with this model's options.
    pub fn solve(
        &self,
        mode: Mode,
        rhs: &BTreeMap<String, Vec<f64>>,
    ) -> Result<(LinearVectors, SolveReport), DerivError> {
        if !self.is_setup() {
            return Err(DerivError::NotSetUp);
        }
        if !self.linearized {
            return Err(DerivError::NotLinearized);
        }
        BlockJacobi::new(self.options.clone()).solve(self, mode, rhs)
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver interfaces
// ─────────────────────────────────────────────────────────────

impl LocalOperator for Model {
    fn num_subsystems(&self) -> usize {
        self.components.len()
    }

    fn subsystem_name(&self, i: usize) -> &str {
        &self.components[i].name
    }

    fn vector_sizes(&self) -> (usize, usize) {
        self.layout.as_ref().map_or((0, 0), |l| (l.output_size, l.input_size))
    }

    fn coupling_scope(&self, i: usize) -> &Scope {
        &self.coupling_scopes[i]
    }

    fn full_scope(&self) -> &Scope {
        &self.full_scope
    }

    fn apply_linear(
        &self,
        i: usize,
        names: &[String],
        mode: Mode,
        scope: &Scope,
        vectors: &mut LinearVectors,
    ) -> Result<(), DerivError> {
        let layout = self.layout()?;
        let out_r = layout.output_ranges[i].clone();

        match self.jacobian_mode {
            JacobianMode::Local => {
                let comp = &self.components[i];
                let ids = &layout.var_ids[i];
                let in_r = layout.input_ranges[i].clone();
                let include = |local: usize| {
                    if comp.variables()[local].is_output() {
                        scope.contains_output(ids[local])
                    } else {
                        scope.contains_input(ids[local])
                    }
                };
                for name in names {
                    let LinearVector { output, residual, input } = vectors.get_mut(name)?;
                    comp.apply_linear(
                        mode,
                        &include,
                        &mut output[out_r.clone()],
                        &mut input[in_r.clone()],
                        &mut residual[out_r.clone()],
                    );
                }
            }
            JacobianMode::Assembled(_) => {
                let jacobian = self.jacobian()?;
                let in_scope = |c: usize| scope.contains_output(layout.column_owner[c]);
                for name in names {
                    let LinearVector { output, residual, .. } = vectors.get_mut(name)?;
                    match mode {
                        Mode::Forward => jacobian.for_each_in_rows(out_r.clone(), |r, c, v| {
                            if in_scope(c) {
                                residual[r] += v * output[c];
                            }
                        }),
                        Mode::Reverse => jacobian.for_each_in_rows(out_r.clone(), |r, c, v| {
                            if in_scope(c) {
                                output[c] += v * residual[r];
                            }
                        }),
                    }
                }
            }
        }
        Ok(())
    }

    fn solve_linear(
        &self,
        i: usize,
        names: &[String],
        mode: Mode,
        vectors: &mut LinearVectors,
    ) -> Result<(), LocalSolveError> {
        let comp = &self.components[i];
        let out_r = self.layout()?.output_ranges[i].clone();
        for name in names {
            let LinearVector { output, residual, .. } = vectors.get_mut(name)?;
            comp.solve_linear(mode, &mut output[out_r.clone()], &mut residual[out_r.clone()])
                .map_err(|reason| LocalSolveError::Failed { vec_name: name.clone(), reason })?;
        }
        Ok(())
    }
}

impl Transfer for Model {
    fn transfer(&self, vectors: &mut LinearVectors, name: &str, mode: Mode) -> Result<(), DerivError> {
        let layout = self.layout()?;
        let LinearVector { output, input, .. } = vectors.get_mut(name)?;
        for (k, source) in layout.sources.iter().enumerate() {
            let tgt = layout.inputs[k].range();
            match (mode, source) {
                (Mode::Forward, Some(src)) => {
                    input[tgt].copy_from_slice(&output[layout.outputs[src.index()].range()]);
                }
                (Mode::Forward, None) => input[tgt].fill(0.0),
                (Mode::Reverse, Some(src)) => {
                    let s0 = layout.outputs[src.index()].offset;
                    for (j, t) in tgt.enumerate() {
                        output[s0 + j] += input[t];
                    }
                }
                (Mode::Reverse, None) => {}
            }
        }
        Ok(())
    }
}
