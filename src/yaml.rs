use crate::error::Error;
use crate::tree::{Map, Value};
use serde_yaml::Value as Yaml;

/// Parse a YAML document into a tree.
pub fn from_yaml_str(input: &str) -> Result<Value, Error> {
    let doc: Yaml = serde_yaml::from_str(input)
        .map_err(|e| Error::syntax(first_line(input), format!("invalid YAML: {}", e)))?;
    Ok(from_yaml(doc))
}

/// Render a tree as a YAML document.
pub fn to_yaml_string(value: &Value) -> Result<String, Error> {
    serde_yaml::to_string(&to_yaml(value))
        .map_err(|e| Error::operator(format!("unable to render YAML: {}", e)))
}

/// Convert a parsed YAML value. Non-string map keys are stringified; tags
/// are dropped in favour of the tagged value.
pub fn from_yaml(doc: Yaml) -> Value {
    match doc {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(items) => Value::Seq(items.into_iter().map(from_yaml).collect()),
        Yaml::Mapping(m) => {
            let mut out = Map::with_capacity(m.len());
            for (k, v) in m {
                out.insert(key_string(k), from_yaml(v));
            }
            Value::Map(out)
        }
        Yaml::Tagged(tagged) => from_yaml(tagged.value),
    }
}

pub fn to_yaml(value: &Value) -> Yaml {
    match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Bool(*b),
        Value::Int(n) => Yaml::Number((*n).into()),
        Value::Float(f) => Yaml::Number((*f).into()),
        Value::String(s) => Yaml::String(s.clone()),
        Value::Seq(items) => Yaml::Sequence(items.iter().map(to_yaml).collect()),
        Value::Map(m) => Yaml::Mapping(
            m.iter()
                .map(|(k, v)| (Yaml::String(k.clone()), to_yaml(v)))
                .collect(),
        ),
    }
}

fn key_string(key: Yaml) -> String {
    match key {
        Yaml::String(s) => s,
        Yaml::Null => "~".to_string(),
        other => from_yaml(other).scalar_string().unwrap_or_default(),
    }
}

fn first_line(input: &str) -> String {
    input.lines().next().unwrap_or("").to_string()
}
