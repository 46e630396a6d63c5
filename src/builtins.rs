use crate::ast::Expr;
use crate::error::Error;
use crate::evaluator::{Evaluator, RunState};
use crate::merge::merge;
use crate::operator::{Operator, Phase, Registry, Response};
use crate::path::Path;
use crate::static_ips::StaticIps;
use crate::tree::{Map, Value};
use std::net::Ipv4Addr;
use tracing::debug;

/// A registry holding every built-in operator.
pub fn registry() -> Registry {
    let mut r = Registry::empty();
    r.register("grab", Grab);
    r.register("concat", Concat);
    r.register("join", Join);
    r.register("keys", Keys);
    r.register("empty", Empty);
    r.register("ips", Ips);
    r.register("cartesian-product", CartesianProduct);
    r.register("defer", Defer);
    r.register("param", Param);
    r.register("prune", Prune);
    r.register("inject", Inject);
    r.register("static_ips", StaticIps);
    r
}

/// Fully evaluate one operand against the current tree.
pub(crate) fn evaluate(ev: &Evaluator, arg: &Expr) -> Result<Value, Error> {
    arg.evaluate(&ev.tree, ev.env())
}

/// Evaluate an operand that must come out as a scalar, rendered to text.
fn scalar_arg(ev: &Evaluator, arg: &Expr, wanted: &'static str) -> Result<String, Error> {
    let value = evaluate(ev, arg)?;
    value.scalar_string().ok_or_else(|| Error::TypeMismatch {
        path: arg.to_string(),
        wanted,
        got: value.kind(),
    })
}

// ── grab ────────────────────────────────────────────────────────────

/// `(( grab a.b ))` copies a value; several arguments make a flat list.
pub struct Grab;

impl Operator for Grab {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        let mut vals = args
            .iter()
            .map(|arg| evaluate(ev, arg))
            .collect::<Result<Vec<_>, _>>()?;
        match vals.len() {
            0 => Err(Error::operator("no arguments specified to (( grab ... ))")),
            1 => Ok(Response::replace(vals.remove(0))),
            _ => {
                let mut flat = Vec::new();
                for v in vals {
                    match v {
                        Value::Seq(items) => flat.extend(items),
                        other => flat.push(other),
                    }
                }
                Ok(Response::replace(flat))
            }
        }
    }
}

// ── concat ──────────────────────────────────────────────────────────

pub struct Concat;

impl Operator for Concat {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        if args.len() < 2 {
            return Err(Error::operator(
                "concat operator requires at least two arguments",
            ));
        }
        let mut out = String::new();
        for arg in args {
            out.push_str(&scalar_arg(ev, arg, "a string scalar")?);
        }
        Ok(Response::replace(out))
    }
}

// ── join ────────────────────────────────────────────────────────────

/// `(( join SEP list-or-scalar... ))`
pub struct Join;

impl Operator for Join {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        let Some((sep, rest)) = args.split_first() else {
            return Err(Error::operator("join operator requires at least two arguments"));
        };
        if rest.is_empty() {
            return Err(Error::operator("join operator requires at least two arguments"));
        }
        let sep = scalar_arg(ev, sep, "a string separator")?;

        let mut parts = Vec::new();
        for arg in rest {
            match evaluate(ev, arg)? {
                Value::Seq(items) => {
                    for (i, item) in items.iter().enumerate() {
                        let s = item.scalar_string().ok_or_else(|| Error::TypeMismatch {
                            path: format!("{}.{}", arg, i),
                            wanted: "a scalar",
                            got: item.kind(),
                        })?;
                        parts.push(s);
                    }
                }
                Value::Map(_) => {
                    return Err(Error::TypeMismatch {
                        path: arg.to_string(),
                        wanted: "a list or a scalar",
                        got: "a map",
                    })
                }
                scalar => parts.extend(scalar.scalar_string()),
            }
        }
        Ok(Response::replace(parts.join(&sep)))
    }
}

// ── keys ────────────────────────────────────────────────────────────

/// `(( keys a.map ... ))` lists each map's keys, sorted per map.
pub struct Keys;

impl Operator for Keys {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        if args.is_empty() {
            return Err(Error::operator("keys operator requires at least one argument"));
        }
        let mut out = Vec::new();
        for arg in args {
            let Value::Map(m) = evaluate(ev, arg)? else {
                return Err(Error::operator(format!("`{}` is not a map", arg)));
            };
            let mut keys: Vec<String> = m.keys().cloned().collect();
            keys.sort();
            out.extend(keys.into_iter().map(Value::String));
        }
        Ok(Response::replace(out))
    }
}

// ── empty ───────────────────────────────────────────────────────────

/// `(( empty hash ))`, `(( empty array ))`, `(( empty string ))`
pub struct Empty;

impl Operator for Empty {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn dependencies(&self, _: &Evaluator, _: &[Expr], _: &[Path], _: Vec<Path>) -> Vec<Path> {
        Vec::new()
    }

    fn run(&self, _ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        let [arg] = args else {
            return Err(Error::operator("empty operator expects exactly one argument"));
        };
        let kind = match arg {
            Expr::Reference(p) if p.depth() == 1 => p.to_string(),
            Expr::Literal(Value::String(s)) => s.clone(),
            other => {
                return Err(Error::operator(format!(
                    "empty operator expects a type name, got `{}`",
                    other
                )))
            }
        };
        match kind.as_str() {
            "hash" | "map" => Ok(Response::replace(Value::new_map())),
            "array" | "list" => Ok(Response::replace(Vec::<Value>::new())),
            "string" => Ok(Response::replace("")),
            other => Err(Error::operator(format!("unknown type `{}` for (( empty ))", other))),
        }
    }
}

// ── ips ─────────────────────────────────────────────────────────────

/// `(( ips "10.0.0.0/24" OFFSET [COUNT] ))`
///
/// For a CIDR the base is the network address and a negative offset
/// counts back from the end of the network (`-1` is the broadcast
/// address). A plain address is simply shifted.
pub struct Ips;

impl Operator for Ips {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        if args.len() < 2 || args.len() > 3 {
            return Err(Error::operator("ips operator requires two or three arguments"));
        }
        let base = scalar_arg(ev, &args[0], "an IP address or CIDR")?;
        let offset = integer_arg(ev, &args[1])?;
        let count = match args.get(2) {
            Some(arg) => {
                let n = integer_arg(ev, arg)?;
                if n < 0 {
                    return Err(Error::operator(format!("ips: count {} is negative", n)));
                }
                Some(n)
            }
            None => None,
        };

        let (start, size) = match base.split_once('/') {
            Some((ip, prefix)) => {
                let ip = parse_ipv4(ip)?;
                let prefix: u32 = prefix
                    .trim()
                    .parse()
                    .ok()
                    .filter(|p| *p <= 32)
                    .ok_or_else(|| Error::operator(format!("ips: invalid CIDR `{}`", base)))?;
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                (i64::from(u32::from(ip) & mask), Some(1i64 << (32 - prefix)))
            }
            None => (i64::from(u32::from(parse_ipv4(&base)?)), None),
        };

        let offset = match size {
            Some(size) if offset < 0 => size + offset,
            _ => offset,
        };
        let address = |n: i64| -> Result<Value, Error> {
            if n < 0 || size.is_some_and(|size| n >= size) {
                return Err(Error::operator(format!(
                    "ips: offset {} is outside of `{}`",
                    n, base
                )));
            }
            u32::try_from(start + n)
                .map(|ip| Value::String(Ipv4Addr::from(ip).to_string()))
                .map_err(|_| Error::operator(format!("ips: offset {} overflows `{}`", n, base)))
        };

        match count {
            None => Ok(Response::replace(address(offset)?)),
            Some(count) => {
                let list = (0..count)
                    .map(|i| address(offset + i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Response::replace(list))
            }
        }
    }
}

fn integer_arg(ev: &Evaluator, arg: &Expr) -> Result<i64, Error> {
    let value = evaluate(ev, arg)?;
    value
        .as_i64()
        .ok_or_else(|| Error::operator(format!("`{}` is not an integer", arg)))
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr, Error> {
    s.trim()
        .parse()
        .map_err(|_| Error::operator(format!("`{}` is not a valid IPv4 address", s.trim())))
}

// ── cartesian-product ───────────────────────────────────────────────

/// Every combination of the arguments, concatenated into strings.
pub struct CartesianProduct;

impl Operator for CartesianProduct {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        if args.is_empty() {
            return Err(Error::operator(
                "cartesian-product operator requires at least one argument",
            ));
        }
        let mut product = vec![String::new()];
        for arg in args {
            let choices: Vec<String> = match evaluate(ev, arg)? {
                Value::Seq(items) => items
                    .iter()
                    .map(|item| {
                        item.scalar_string().ok_or_else(|| Error::TypeMismatch {
                            path: arg.to_string(),
                            wanted: "a list of scalars",
                            got: item.kind(),
                        })
                    })
                    .collect::<Result<_, _>>()?,
                Value::Map(_) => {
                    return Err(Error::TypeMismatch {
                        path: arg.to_string(),
                        wanted: "a list or a scalar",
                        got: "a map",
                    })
                }
                scalar => scalar.scalar_string().into_iter().collect(),
            };
            product = product
                .iter()
                .flat_map(|prefix| choices.iter().map(move |c| format!("{}{}", prefix, c)))
                .collect();
        }
        Ok(Response::replace(
            product.into_iter().map(Value::String).collect::<Vec<_>>(),
        ))
    }
}

// ── defer ───────────────────────────────────────────────────────────

/// `(( defer grab x ))` leaves `(( grab x ))` in the output.
pub struct Defer;

impl Operator for Defer {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn dependencies(&self, _: &Evaluator, _: &[Expr], _: &[Path], _: Vec<Path>) -> Vec<Path> {
        Vec::new()
    }

    fn run(&self, _ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        if args.is_empty() {
            return Err(Error::operator("defer has nothing to defer"));
        }
        let text: Vec<String> = args.iter().map(Expr::to_string).collect();
        Ok(Response::replace(format!("(( {} ))", text.join(" "))))
    }
}

// ── param ───────────────────────────────────────────────────────────

/// `(( param "message" ))` marks a value the caller must supply.
pub struct Param;

impl Operator for Param {
    fn phase(&self) -> Phase {
        Phase::Param
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        let message = match args.first() {
            Some(arg) => evaluate(ev, arg)?
                .scalar_string()
                .unwrap_or_else(|| "missing required parameter".to_string()),
            None => "missing required parameter".to_string(),
        };
        Err(Error::Param(message))
    }
}

// ── prune ───────────────────────────────────────────────────────────

/// `(( prune ))` removes its own key once evaluation is done.
pub struct Prune;

impl Operator for Prune {
    fn setup(&self, state: &mut RunState) -> Result<(), Error> {
        state.pending_prune.clear();
        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, _args: &[Expr]) -> Result<Response, Error> {
        if let Some(here) = ev.here.clone() {
            debug!("prune: marking $.{}", here);
            ev.state.pending_prune.push(here);
        }
        Ok(Response::replace("(( prune ))"))
    }
}

// ── inject ──────────────────────────────────────────────────────────

/// `(( inject a.map ... ))` merges copies of the maps into the parent.
///
/// Calls still pending inside an injected map are ordered first through
/// the operand dependencies.
pub struct Inject;

impl Operator for Inject {
    fn phase(&self) -> Phase {
        Phase::Merge
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        if args.is_empty() {
            return Err(Error::operator("no arguments specified to (( inject ... ))"));
        }
        let mut injected = Value::Map(Map::new());
        for arg in args {
            let resolved = arg.resolve(&ev.tree, ev.env())?;
            let Expr::Reference(path) = &resolved else {
                return Err(Error::operator(
                    "inject operator only accepts key reference arguments",
                ));
            };
            let value = path.resolve(&ev.tree)?;
            if !matches!(value, Value::Map(_)) {
                return Err(Error::operator(format!(
                    "tried to inject {}, which is not a map",
                    path
                )));
            }
            injected = merge(injected, value.clone(), path, true)?;
        }
        Ok(Response::inject(injected))
    }
}
