use crate::ast::Env;
use crate::builtins;
use crate::error::{Error, MultiError, Warning};
use crate::merge::merge;
use crate::operator::{Action, Opcall, Phase, Registry};
use crate::path::Path;
use crate::tree::Value;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Default limit for the structural recursion check.
pub const DEFAULT_MAX_DEPTH: usize = 4096;

/// Knobs for one evaluation run.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Depth at which the tree is assumed to contain itself.
    pub max_depth: usize,
    /// Paths removed from the final tree; `*` segments are expanded.
    pub prune: Vec<Path>,
    /// Skip operator evaluation entirely and only prune.
    pub skip_eval: bool,
    pub env: Env,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            max_depth: DEFAULT_MAX_DEPTH,
            prune: Vec::new(),
            skip_eval: false,
            env: Env::Process,
        }
    }
}

/// State owned by one run and reset by operator `setup` hooks.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Static address -> `job/instance` that claimed it.
    pub ledger: BTreeMap<String, String>,
    /// Call sites that asked to be pruned once evaluation is done.
    pub pending_prune: Vec<Path>,
}

/// Resolves operator calls in a document tree, in place.
#[derive(Debug)]
pub struct Evaluator {
    pub tree: Value,
    /// Location of the operator call currently running.
    pub here: Option<Path>,
    pub state: RunState,
    pub options: EvalOptions,
    pub warnings: Vec<Warning>,
    registry: Registry,
}

impl Evaluator {
    /// An evaluator with every built-in operator registered.
    pub fn new(tree: Value) -> Self {
        Evaluator::with_registry(tree, builtins::registry())
    }

    pub fn with_registry(tree: Value, registry: Registry) -> Self {
        Evaluator {
            tree,
            here: None,
            state: RunState::default(),
            options: EvalOptions::default(),
            warnings: Vec::new(),
            registry,
        }
    }

    pub fn with_options(mut self, options: EvalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn env(&self) -> &Env {
        &self.options.env
    }

    pub fn into_tree(self) -> Value {
        self.tree
    }

    // ── Data flow ───────────────────────────────────────────────────

    /// Find every `phase` operator call and order them so that each call
    /// runs after the calls it depends on.
    ///
    /// Calls belonging to other phases take part in the graph, so cycles
    /// through them are caught, but are left out of the result. Ties are
    /// broken by canonical path, making the order identical across runs.
    pub fn data_flow(&mut self, phase: Phase) -> Result<Vec<Opcall>, MultiError> {
        let mut errors = MultiError::new();
        let mut found = Vec::new();
        let mut here = Path::root();
        scan_node(
            &self.tree,
            &mut here,
            &self.registry,
            phase,
            &mut found,
            &mut errors,
        );

        // Keyed by canonical path; the last call seen at a location wins.
        let mut calls: BTreeMap<String, Opcall> = BTreeMap::new();
        for (location, call) in found {
            let call = call.at(location, &self.tree);
            calls.insert(call.canonical().to_string(), call);
        }
        let known: Vec<Path> = calls.values().map(|c| c.canonical().clone()).collect();

        for call in calls.values().filter(|c| c.phase() == phase) {
            for w in call.warnings() {
                warn!("{}", w);
                self.warnings.push(w.clone());
            }
        }

        // (dependency, dependent)
        let mut edges: Vec<(String, String)> = Vec::new();
        for (key, call) in &calls {
            self.here = Some(call.location().clone());
            for dep in call.dependencies(self, &known) {
                let dep = dep.to_string();
                if calls.contains_key(&dep) {
                    trace!("dataflow: `{}` depends on `{}`", key, dep);
                    edges.push((dep, key.clone()));
                }
            }
        }
        self.here = None;

        if !errors.is_empty() {
            return Err(errors);
        }

        let order = topological_order(&calls, edges).map_err(MultiError::from)?;
        let ops: Vec<Opcall> = order
            .into_iter()
            .filter_map(|key| calls.remove(&key))
            .filter(|c| c.phase() == phase)
            .collect();
        debug!("dataflow: {} {} operation(s) scheduled", ops.len(), phase);
        Ok(ops)
    }

    // ── Running ─────────────────────────────────────────────────────

    /// Run each call in order, collecting failures instead of stopping.
    pub fn run_ops(&mut self, ops: &[Opcall]) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for op in ops {
            if let Err(e) = self.run_op(op) {
                debug!("op `{}` at $.{} failed: {}", op.src(), op.location(), e);
                errors.push(e);
            }
        }
        errors.into_result()
    }

    /// Run one call and apply its response to the tree.
    pub fn run_op(&mut self, op: &Opcall) -> Result<(), Error> {
        let response = op.run(self)?;
        let result = match response.action {
            Action::Replace => self.replace_at(op.location(), response.value),
            Action::Inject => self.inject_at(op.location(), response.value),
        };
        result.map_err(|e| e.located(op.location()))
    }

    /// Set up, schedule and run every operator of one phase.
    pub fn run_phase(&mut self, phase: Phase) -> Result<(), MultiError> {
        debug!("running {} phase", phase);
        self.registry
            .setup(phase, &mut self.state)
            .map_err(MultiError::from)?;
        let ops = self.data_flow(phase)?;
        self.run_ops(&ops)
    }

    /// Merge, Eval, structural check, Param, then prune.
    ///
    /// Structural errors abort immediately. Otherwise unmet parameters are
    /// reported ahead of any other failures.
    pub fn run(&mut self) -> Result<(), MultiError> {
        self.state = RunState::default();
        let mut prune = self.options.prune.clone();

        if !self.options.skip_eval {
            let mut errors = MultiError::new();
            for phase in [Phase::Merge, Phase::Eval] {
                if let Err(e) = self.run_phase(phase) {
                    if let Some(fatal) = e.fatal() {
                        return Err(fatal.clone().into());
                    }
                    errors.append(e);
                }
            }

            self.check_for_cycles(self.options.max_depth)
                .map_err(MultiError::from)?;

            if let Err(params) = self.run_phase(Phase::Param) {
                if let Some(fatal) = params.fatal() {
                    return Err(fatal.clone().into());
                }
                return Err(params);
            }
            errors.into_result()?;
            prune.extend(self.state.pending_prune.iter().cloned());
        }

        self.prune(&prune);
        Ok(())
    }

    /// Fail if the tree nests deeper than `max_depth`.
    pub fn check_for_cycles(&self, max_depth: usize) -> Result<(), Error> {
        fn check(node: &Value, depth: usize, max_depth: usize) -> Result<(), Error> {
            if depth == 0 {
                return Err(Error::MaxDepth { max_depth });
            }
            match node {
                Value::Map(m) => m.values().try_for_each(|v| check(v, depth - 1, max_depth)),
                Value::Seq(items) => items.iter().try_for_each(|v| check(v, depth - 1, max_depth)),
                _ => Ok(()),
            }
        }
        check(&self.tree, max_depth, max_depth)
    }

    /// Remove map keys at each of `paths`.
    ///
    /// Paths that do not exist are ignored, and so are paths ending in a
    /// sequence element: only map keys can be pruned.
    pub fn prune(&mut self, paths: &[Path]) {
        debug!("pruning {} path(s)", paths.len());
        for pattern in paths {
            let Ok(targets) = pattern.glob(&self.tree) else {
                continue;
            };
            for path in targets {
                let Some(key) = path.last().map(str::to_string) else {
                    continue;
                };
                match path.parent().resolve_mut(&mut self.tree) {
                    Ok(Value::Map(m)) => {
                        m.shift_remove(&key);
                    }
                    Ok(_) => debug!("not pruning $.{}: parent is not a map", path),
                    Err(_) => {}
                }
            }
        }
    }

    // ── Responses ───────────────────────────────────────────────────

    fn replace_at(&mut self, location: &Path, value: Value) -> Result<(), Error> {
        if location.is_root() {
            self.tree = value;
            return Ok(());
        }
        let slot = location.resolve_mut(&mut self.tree)?;
        *slot = value;
        Ok(())
    }

    /// Merge the entries of `value` into the parent map of `location`,
    /// dropping the call-site key. Keys the parent already has keep their
    /// own scalars; maps and sequences under them are merged.
    fn inject_at(&mut self, location: &Path, value: Value) -> Result<(), Error> {
        let Value::Map(injected) = value else {
            return Err(Error::operator(format!(
                "inject: value to inject is {}, not a map",
                value.kind()
            )));
        };
        let Some(key) = location.last().map(str::to_string) else {
            return Err(Error::operator("inject: cannot inject at the document root"));
        };
        let parent_path = location.parent();
        let parent = match parent_path.resolve_mut(&mut self.tree)? {
            Value::Map(m) => m,
            other => {
                return Err(Error::TypeMismatch {
                    path: parent_path.to_string(),
                    wanted: "a map",
                    got: other.kind(),
                })
            }
        };

        let mut at = parent.get_index_of(&key).unwrap_or(parent.len());
        parent.shift_remove(&key);
        for (k, v) in injected {
            match parent.get_mut(&k) {
                Some(existing) => {
                    let here = parent_path.child(k.clone());
                    *existing = merge(v, existing.clone(), &here, true)?;
                }
                None => {
                    parent.shift_insert(at.min(parent.len()), k, v);
                    at += 1;
                }
            }
        }
        Ok(())
    }
}

// ── Scanning ────────────────────────────────────────────────────────

/// Visit the children of a map or sequence, pushing each child's segment.
///
/// Elements of a tagged sequence are addressed by their tag value so that
/// call locations survive reordering; everything else by position. A tag
/// value that would resolve to some other element (a numeric name, a
/// duplicate) falls back to the position as well.
fn scan_node(
    node: &Value,
    here: &mut Path,
    registry: &Registry,
    phase: Phase,
    found: &mut Vec<(Path, Opcall)>,
    errors: &mut MultiError,
) {
    match node {
        Value::Map(m) => {
            for (k, v) in m {
                here.push(k.clone());
                check_value(v, here, registry, phase, found, errors);
                here.pop();
            }
        }
        Value::Seq(items) => {
            let tag = node.tag_field();
            for (i, v) in items.iter().enumerate() {
                let index = i.to_string();
                let name = tag
                    .and_then(|field| v.get(field))
                    .and_then(Value::scalar_string)
                    .filter(|name| addresses(node, name, &index));
                here.push(name.unwrap_or(index));
                check_value(v, here, registry, phase, found, errors);
                here.pop();
            }
        }
        _ => {}
    }
}

/// True when `name` looks up the sequence element at `index`.
fn addresses(seq: &Value, name: &str, index: &str) -> bool {
    Path::from_segments([name])
        .canonical(seq)
        .is_ok_and(|canon| canon.last() == Some(index))
}

/// Record `value` as an operator call if it is one, else descend into it.
fn check_value(
    value: &Value,
    here: &mut Path,
    registry: &Registry,
    phase: Phase,
    found: &mut Vec<(Path, Opcall)>,
    errors: &mut MultiError,
) {
    let Value::String(s) = value else {
        scan_node(value, here, registry, phase, found, errors);
        return;
    };
    match Opcall::parse(registry, s) {
        Ok(Some(call)) => {
            trace!("dataflow: found `{}` at $.{}", s, here);
            found.push((here.clone(), call));
        }
        Ok(None) => {}
        Err(e) => {
            // Syntax errors are reported by the phase the operator belongs to.
            let own_phase = crate::parser::split_opcall(s)
                .map(|(name, _)| registry.lookup(&name).phase());
            if own_phase == Some(phase) {
                errors.push(e.located(&*here));
            }
        }
    }
}

/// Kahn's algorithm over `calls`, keyed by canonical path string.
///
/// Each pass takes every remaining node with no unsatisfied dependency, in
/// key order. A pass that frees nothing means a cycle.
fn topological_order(
    calls: &BTreeMap<String, Opcall>,
    mut edges: Vec<(String, String)>,
) -> Result<Vec<String>, Error> {
    let mut candidates: Vec<&String> = calls.keys().collect();
    let mut order = Vec::with_capacity(candidates.len());

    while !candidates.is_empty() {
        let free: Vec<&String> = candidates
            .iter()
            .copied()
            .filter(|key| !edges.iter().any(|(_, dependent)| dependent == *key))
            .collect();
        if free.is_empty() {
            debug!(
                "dataflow: cycle among {}",
                candidates
                    .iter()
                    .map(|k| format!("$.{}", k))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            return Err(Error::Cycle);
        }
        candidates.retain(|key| !free.contains(key));
        edges.retain(|(dependency, _)| !free.iter().any(|f| *f == dependency));
        order.extend(free.into_iter().cloned());
    }
    Ok(order)
}
