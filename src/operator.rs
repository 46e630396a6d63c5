use crate::ast::Expr;
use crate::error::{Error, Warning};
use crate::evaluator::{Evaluator, RunState};
use crate::parser::{parse_arguments, split_opcall};
use crate::path::Path;
use crate::tree::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Scheduling bucket for operators. Phases run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Merge,
    Eval,
    Param,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Merge => "merge",
            Phase::Eval => "eval",
            Phase::Param => "param",
        })
    }
}

/// What to do with an operator's result.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// The value becomes the new content of the call site.
    Replace,
    /// The value is a map whose entries are merged into the call site's parent.
    Inject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub action: Action,
    pub value: Value,
}

impl Response {
    pub fn replace(value: impl Into<Value>) -> Self {
        Response {
            action: Action::Replace,
            value: value.into(),
        }
    }

    pub fn inject(value: impl Into<Value>) -> Self {
        Response {
            action: Action::Inject,
            value: value.into(),
        }
    }
}

/// A named capability callable as `(( name args... ))`.
pub trait Operator {
    /// Reset per-run state before the operator's phase starts.
    fn setup(&self, _state: &mut RunState) -> Result<(), Error> {
        Ok(())
    }

    fn phase(&self) -> Phase;

    /// Locations that must be settled before this call may run.
    ///
    /// `auto` holds the dependencies already derived from the operands,
    /// including call sites nested under referenced subtrees; most
    /// operators return it unchanged. `known` lists every call site found
    /// in the tree.
    fn dependencies(
        &self,
        _ev: &Evaluator,
        _args: &[Expr],
        _known: &[Path],
        auto: Vec<Path>,
    ) -> Vec<Path> {
        auto
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error>;
}

/// Stand-in for names nobody registered; fails only when run.
pub struct NullOperator {
    pub name: String,
}

impl Operator for NullOperator {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, _ev: &mut Evaluator, _args: &[Expr]) -> Result<Response, Error> {
        Err(Error::Undefined {
            name: self.name.clone(),
        })
    }
}

/// Operators by name.
#[derive(Clone, Default)]
pub struct Registry {
    ops: BTreeMap<String, Rc<dyn Operator>>,
}

impl Registry {
    pub fn empty() -> Self {
        Registry::default()
    }

    /// Register `op` under `name`, replacing any previous holder.
    pub fn register(&mut self, name: impl Into<String>, op: impl Operator + 'static) {
        self.ops.insert(name.into(), Rc::new(op));
    }

    /// The operator for `name`, or a [`NullOperator`] if there is none.
    pub fn lookup(&self, name: &str) -> Rc<dyn Operator> {
        match self.ops.get(name) {
            Some(op) => Rc::clone(op),
            None => Rc::new(NullOperator {
                name: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Run `setup` on every registered operator bound to `phase`.
    pub fn setup(&self, phase: Phase, state: &mut RunState) -> Result<(), Error> {
        for op in self.ops.values() {
            if op.phase() == phase {
                op.setup(state)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ops.keys()).finish()
    }
}

/// One discovered operator invocation.
#[derive(Clone)]
pub struct Opcall {
    src: String,
    name: String,
    location: Path,
    canonical: Path,
    phase: Phase,
    op: Rc<dyn Operator>,
    args: Vec<Expr>,
    warnings: Vec<Warning>,
}

impl Opcall {
    /// Parse `src` as an operator call.
    ///
    /// `Ok(None)` means the string is plain data. Calls to operators of any
    /// phase are returned; callers filter on [`Opcall::phase`].
    pub fn parse(registry: &Registry, src: &str) -> Result<Option<Opcall>, Error> {
        let Some((name, arg_text)) = split_opcall(src) else {
            return Ok(None);
        };
        let op = registry.lookup(&name);
        let args = parse_arguments(&arg_text).map_err(|e| match e {
            Error::Syntax { message, .. } => Error::syntax(src, message),
            other => other,
        })?;
        Ok(Some(Opcall {
            src: src.to_string(),
            name,
            location: Path::root(),
            canonical: Path::root(),
            phase: op.phase(),
            op,
            args: args.exprs,
            warnings: args
                .warnings
                .into_iter()
                .map(|w| Warning {
                    src: src.to_string(),
                    ..w
                })
                .collect(),
        }))
    }

    /// Attach the call site; `canonical` falls back to `location` when the
    /// location cannot be canonicalized against `tree`.
    pub fn at(mut self, location: Path, tree: &Value) -> Self {
        self.canonical = location.canonical(tree).unwrap_or_else(|_| location.clone());
        self.location = location;
        self
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn canonical(&self) -> &Path {
        &self.canonical
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn args(&self) -> &[Expr] {
        &self.args
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Operand-derived dependencies followed by the operator's own.
    pub fn dependencies(&self, ev: &Evaluator, known: &[Path]) -> Vec<Path> {
        let auto: Vec<Path> = self
            .args
            .iter()
            .flat_map(|arg| arg.dependencies(&ev.tree, known))
            .collect();
        self.op.dependencies(ev, &self.args, known, auto)
    }

    /// Run the operator with `ev.here` pointing at the call site.
    pub fn run(&self, ev: &mut Evaluator) -> Result<Response, Error> {
        let was = ev.here.replace(self.location.clone());
        let result = self.op.run(ev, &self.args);
        ev.here = was;
        result.map_err(|e| e.located(&self.location))
    }
}

impl fmt::Debug for Opcall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opcall")
            .field("src", &self.src)
            .field("location", &self.location.to_string())
            .field("canonical", &self.canonical.to_string())
            .field("phase", &self.phase)
            .field("args", &self.args)
            .finish()
    }
}
