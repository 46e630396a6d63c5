use crate::error::{Error, Warning};
use crate::path::Path;
use crate::tree::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One operand of an operator call.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Reference(Path),
    /// `$NAME`; looked up at resolution time.
    EnvVar(String),
    /// `left || right`: the first resolvable side wins.
    Or(Box<Expr>, Box<Expr>),
}

/// Where environment variables come from during a run.
#[derive(Debug, Clone, Default)]
pub enum Env {
    #[default]
    Process,
    Fixed(BTreeMap<String, String>),
}

impl Env {
    /// The variable's value; unset and empty are treated alike.
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match self {
            Env::Process => std::env::var(name).ok(),
            Env::Fixed(vars) => vars.get(name).cloned(),
        };
        value.filter(|v| !v.is_empty())
    }
}

impl Expr {
    /// Drop alternates that can never be reached.
    ///
    /// A literal always resolves, so in `a || "x" || b` the `b` is dead.
    /// The expression is truncated after the first literal and a warning
    /// names the discarded tail.
    pub fn reduce(self) -> (Expr, Option<Warning>) {
        let original = self.to_string();
        let (reduced, short, more) = reduce_inner(self);
        match short {
            Some(lit) if more => {
                let warning = Warning {
                    message: format!(
                        "literal {} short-circuits expression; everything after it is ignored",
                        lit
                    ),
                    src: original,
                };
                (reduced, Some(warning))
            }
            _ => (reduced, None),
        }
    }

    /// Check whether the operand can be satisfied against `tree` right now.
    ///
    /// Literals resolve to themselves, environment variables to a string
    /// literal of their value, and references to themselves once the path
    /// exists. `Or` returns the first side that resolves, even when its
    /// value is falsy.
    pub fn resolve(&self, tree: &Value, env: &Env) -> Result<Expr, Error> {
        match self {
            Expr::Literal(_) => Ok(self.clone()),
            Expr::EnvVar(name) => match env.get(name) {
                Some(v) => Ok(Expr::Literal(Value::String(v))),
                None => Err(Error::EnvVar { name: name.clone() }),
            },
            Expr::Reference(path) => {
                path.resolve(tree)?;
                Ok(self.clone())
            }
            Expr::Or(left, right) => match left.resolve(tree, env) {
                Ok(found) => Ok(found),
                Err(_) => right.resolve(tree, env),
            },
        }
    }

    /// Resolve and dereference down to a concrete value.
    pub fn evaluate(&self, tree: &Value, env: &Env) -> Result<Value, Error> {
        match self.resolve(tree, env)? {
            Expr::Literal(v) => Ok(v),
            Expr::EnvVar(name) => env
                .get(&name)
                .map(Value::String)
                .ok_or(Error::EnvVar { name }),
            Expr::Reference(path) => path.resolve(tree).cloned(),
            Expr::Or(..) => Err(Error::operator(
                "expression resolved to a logical OR operation (which shouldn't happen)",
            )),
        }
    }

    /// Tree locations this operand reads from.
    ///
    /// Each path is climbed to its nearest existing ancestor and
    /// canonicalized, so a reference to a key that an earlier operator will
    /// create still orders after that operator. A reference to an existing
    /// subtree also depends on every `known` call site inside it.
    pub fn dependencies(&self, tree: &Value, known: &[Path]) -> Vec<Path> {
        match self {
            Expr::Reference(path) => match path.canonical(tree) {
                Ok(target) => {
                    let mut deps: Vec<Path> = known
                        .iter()
                        .filter(|site| site.under(&target))
                        .cloned()
                        .collect();
                    deps.insert(0, target);
                    deps
                }
                Err(_) => path.resolvable_ancestor(tree).into_iter().collect(),
            },
            Expr::Or(left, right) => {
                let mut deps = left.dependencies(tree, known);
                deps.extend(right.dependencies(tree, known));
                deps
            }
            Expr::Literal(_) | Expr::EnvVar(_) => Vec::new(),
        }
    }
}

/// Returns (reduced, first literal seen, whether anything followed it).
fn reduce_inner(expr: Expr) -> (Expr, Option<Expr>, bool) {
    match expr {
        Expr::Literal(_) => (expr.clone(), Some(expr), false),
        Expr::EnvVar(_) | Expr::Reference(_) => (expr, None, false),
        Expr::Or(left, right) => {
            let (l, short, _) = reduce_inner(*left);
            if short.is_some() {
                return (l, short, true);
            }
            let (r, short, more) = reduce_inner(*right);
            (Expr::Or(Box::new(l), Box::new(r)), short, more)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::Null) => f.write_str("nil"),
            Expr::Literal(Value::String(s)) => {
                f.write_str("\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                f.write_str("\"")
            }
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Reference(path) => write!(f, "{}", path),
            Expr::EnvVar(name) => write!(f, "${}", name),
            Expr::Or(left, right) => write!(f, "{} || {}", left, right),
        }
    }
}
