use crate::ast::Expr;
use crate::error::{Error, Warning};
use crate::path::Path;
use crate::tree::Value;
use regex::Regex;
use std::sync::LazyLock;
use tracing::trace;

/// `(( name(args) ))` and `(( name args ))`, tried in that order.
static OPCALL_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?s)^\(\(\s*([a-zA-Z][a-zA-Z0-9_-]*)(?:\s*\((.*)\))?\s*\)\)$")
            .expect("valid opcall regex"),
        Regex::new(r"(?s)^\(\(\s*([a-zA-Z][a-zA-Z0-9_-]*)(?:\s+(.*))?\s*\)\)$")
            .expect("valid opcall regex"),
    ]
});

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^"(.*)"$"#).expect("valid regex"));
static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+(\.\d+)?$").expect("valid regex"));
static FLOAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d*\.\d+$").expect("valid regex"));
static ENVVAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$[a-zA-Z_][a-zA-Z0-9_.]*$").expect("valid regex"));

/// Split `(( name ... ))` text into the operator name and its raw argument text.
///
/// Returns `None` when the string is not an operator call at all.
pub fn split_opcall(src: &str) -> Option<(String, String)> {
    for re in OPCALL_PATTERNS.iter() {
        if let Some(caps) = re.captures(src) {
            let name = caps.get(1)?.as_str().to_string();
            let args = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
            return Some((name, args));
        }
    }
    None
}

/// A parsed argument list plus any warnings raised while reducing it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    pub exprs: Vec<Expr>,
    pub warnings: Vec<Warning>,
}

/// Token scanner state: tracks position in the argument text.
struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self, ch: char) {
        self.pos += ch.len_utf8();
    }

    /// Split on whitespace and commas outside double quotes.
    ///
    /// Quotes stay in the token so the classifier can tell `"x"` from `x`.
    /// Backslash escapes `\n`, `\r` and `\t`; any other escaped character
    /// is taken literally. Each comma becomes its own `,` token.
    fn tokens(mut self) -> Vec<String> {
        let mut list = Vec::new();
        let mut buf = String::new();
        let mut quoted = false;

        while let Some(ch) = self.peek_char() {
            self.advance(ch);
            match ch {
                '\\' => {
                    if let Some(next) = self.peek_char() {
                        self.advance(next);
                        buf.push(match next {
                            'n' => '\n',
                            'r' => '\r',
                            't' => '\t',
                            other => other,
                        });
                    }
                }
                ' ' | '\t' | '\n' | '\r' | ',' if !quoted => {
                    if !buf.is_empty() {
                        list.push(std::mem::take(&mut buf));
                    }
                    if ch == ',' {
                        list.push(",".to_string());
                    }
                }
                '"' => {
                    buf.push(ch);
                    quoted = !quoted;
                }
                _ => buf.push(ch),
            }
        }
        if !buf.is_empty() {
            list.push(buf);
        }
        list
    }
}

/// Shift/combine builder for operand lists. `left` holds the alternates of
/// the operand being built.
#[derive(Default)]
struct Builder {
    done: Vec<Expr>,
    left: Vec<Expr>,
    or_pending: bool,
}

impl Builder {
    /// Finalize the pending operand, if any. Alternates chain to the right,
    /// so `a || b || c` becomes `Or(a, Or(b, c))`.
    fn pop(&mut self) {
        let mut alternates = std::mem::take(&mut self.left).into_iter().rev();
        let Some(last) = alternates.next() else {
            return;
        };
        let expr = alternates.fold(last, |right, left| {
            Expr::Or(Box::new(left), Box::new(right))
        });
        self.done.push(expr);
    }

    fn push(&mut self, expr: Expr) {
        if !self.or_pending {
            self.pop();
        }
        self.or_pending = false;
        self.left.push(expr);
    }
}

/// Parse the argument text of an operator call into operands.
pub fn parse_arguments(src: &str) -> Result<Arguments, Error> {
    trace!("expr: parsing `{}`", src);
    let mut builder = Builder::default();

    for token in (Tokenizer { input: src, pos: 0 }).tokens() {
        if token == "," {
            if builder.or_pending {
                return Err(Error::syntax(src, "`||` must be followed by an operand"));
            }
            builder.pop();
            continue;
        }
        if token == "||" {
            if builder.left.is_empty() || builder.or_pending {
                return Err(Error::syntax(src, "`||` needs an operand on its left"));
            }
            builder.or_pending = true;
            continue;
        }
        let expr = classify(&token).map_err(|e| match e {
            Error::Syntax { message, .. } => Error::syntax(src, message),
            other => other,
        })?;
        trace!("expr: pushing `{}`", expr);
        builder.push(expr);
    }

    if builder.or_pending {
        return Err(Error::syntax(src, "`||` must be followed by an operand"));
    }
    builder.pop();

    let mut args = Arguments::default();
    for expr in builder.done {
        let (reduced, warning) = expr.reduce();
        if let Some(w) = warning {
            args.warnings.push(w);
        }
        args.exprs.push(reduced);
    }
    Ok(args)
}

/// Turn one token into an operand.
fn classify(token: &str) -> Result<Expr, Error> {
    if ENVVAR.is_match(token) {
        return Ok(Expr::EnvVar(token[1..].to_string()));
    }
    if let Some(caps) = QUOTED.captures(token) {
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        return Ok(Expr::Literal(Value::String(inner.to_string())));
    }
    if FLOAT.is_match(token) || INTEGER.is_match(token) {
        return Ok(Expr::Literal(parse_number(token)));
    }
    match token {
        "nil" | "Nil" | "NIL" | "null" | "Null" | "NULL" | "~" => {
            return Ok(Expr::Literal(Value::Null));
        }
        "true" | "True" | "TRUE" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" | "False" | "FALSE" => return Ok(Expr::Literal(Value::Bool(false))),
        _ => {}
    }
    let path = Path::parse(token)
        .map_err(|_| Error::syntax(token, format!("`{}` is not a valid reference", token)))?;
    if path.is_root() {
        return Err(Error::syntax(token, format!("`{}` is not a valid reference", token)));
    }
    Ok(Expr::Reference(path))
}

/// Numeric tokens always parse, as an integer when possible.
fn parse_number(token: &str) -> Value {
    if let Ok(n) = token.parse::<i64>() {
        return Value::Int(n);
    }
    match token.parse::<f64>() {
        Ok(f) => Value::Float(f),
        Err(_) => Value::String(token.to_string()),
    }
}
