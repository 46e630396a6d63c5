pub mod ast;
pub mod builtins;
pub mod error;
pub mod evaluator;
pub mod json;
pub mod merge;
pub mod operator;
pub mod parser;
pub mod path;
pub mod static_ips;
pub mod tree;
pub mod yaml;

pub use ast::{Env, Expr};
pub use error::{Error, MultiError, Warning};
pub use evaluator::{EvalOptions, Evaluator, RunState};
pub use operator::{Action, Opcall, Operator, Phase, Registry, Response};
pub use path::Path;
pub use tree::{Map, Value};

// ── Core API ───────────────────────────────────────────────────────

/// The outcome of merging and evaluating a set of documents.
pub struct MergeResult {
    pub value: Value,
    pub errors: MultiError,
    pub warnings: Vec<Warning>,
}

/// Merge `documents` left to right, then resolve every operator call in the
/// result. The tree is returned even when errors were collected, in
/// whatever state evaluation left it.
pub fn merge_documents<I>(documents: I, options: EvalOptions) -> MergeResult
where
    I: IntoIterator<Item = Value>,
{
    let merged = match merge::merge_all(documents) {
        Ok(v) => v,
        Err(e) => {
            return MergeResult {
                value: Value::Null,
                errors: e.into(),
                warnings: Vec::new(),
            }
        }
    };
    let mut ev = Evaluator::new(merged).with_options(options);
    let errors = ev.run().err().unwrap_or_default();
    MergeResult {
        warnings: std::mem::take(&mut ev.warnings),
        value: ev.into_tree(),
        errors,
    }
}

/// Parse YAML sources and hand them to [`merge_documents`].
pub fn merge_yaml(sources: &[&str], options: EvalOptions) -> MergeResult {
    let mut docs = Vec::with_capacity(sources.len());
    for src in sources {
        match yaml::from_yaml_str(src) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                return MergeResult {
                    value: Value::Null,
                    errors: e.into(),
                    warnings: Vec::new(),
                }
            }
        }
    }
    merge_documents(docs, options)
}

#[cfg(test)]
mod tests;
