use crate::error::Error;
use crate::path::Path;
use crate::tree::{Map, Value};
use tracing::trace;

/// Deep-merge `incoming` on top of `existing`.
///
/// Maps merge key by key. Scalars, nulls and mismatched shapes from
/// `incoming` replace what was there. Two sequences are concatenated when
/// `append_by_default` is set; otherwise sequences tagged by `name` merge
/// element-wise by name and any other sequence is replaced.
pub fn merge(
    existing: Value,
    incoming: Value,
    path: &Path,
    append_by_default: bool,
) -> Result<Value, Error> {
    match (existing, incoming) {
        (Value::Map(base), Value::Map(over)) => {
            merge_maps(base, over, path, append_by_default).map(Value::Map)
        }
        (Value::Seq(mut base), Value::Seq(over)) => {
            if append_by_default {
                trace!("merge: appending {} item(s) at $.{}", over.len(), path);
                base.extend(over);
                return Ok(Value::Seq(base));
            }
            let base = Value::Seq(base);
            let over = Value::Seq(over);
            if base.tag_field() == Some("name") && over.tag_field() == Some("name") {
                merge_by_name(base, over, path)
            } else {
                Ok(over)
            }
        }
        (_, incoming) => Ok(incoming),
    }
}

fn merge_maps(
    mut base: Map,
    over: Map,
    path: &Path,
    append_by_default: bool,
) -> Result<Map, Error> {
    for (k, v) in over {
        let here = path.child(k.clone());
        match base.get_mut(&k) {
            Some(slot) => {
                let current = std::mem::take(slot);
                *slot = merge(current, v, &here, append_by_default)?;
            }
            None => {
                base.insert(k, v);
            }
        }
    }
    Ok(base)
}

/// Merge two `name`-tagged sequences; unmatched incoming elements are appended.
fn merge_by_name(base: Value, over: Value, path: &Path) -> Result<Value, Error> {
    let (Value::Seq(mut base), Value::Seq(over)) = (base, over) else {
        return Err(Error::TypeMismatch {
            path: path.to_string(),
            wanted: "a list",
            got: "a scalar",
        });
    };
    for item in over {
        let name = item.get("name").and_then(Value::scalar_string).unwrap_or_default();
        match Value::position_named(&base, "name", &name) {
            Some(i) => {
                let here = path.child(name);
                let current = std::mem::take(&mut base[i]);
                base[i] = merge(current, item, &here, false)?;
            }
            None => base.push(item),
        }
    }
    Ok(Value::Seq(base))
}

/// Merge documents left to right into one tree.
pub fn merge_all<I>(documents: I) -> Result<Value, Error>
where
    I: IntoIterator<Item = Value>,
{
    let mut result = Value::new_map();
    for doc in documents {
        result = merge(result, doc, &Path::root(), false)?;
    }
    Ok(result)
}
