use indexmap::IndexMap;
use std::fmt;

/// Mapping node: string keys, insertion order preserved for output.
pub type Map = IndexMap<String, Value>;

/// Fields that can identify an element of a tagged sequence, in lookup order.
pub const TAG_FIELDS: [&str; 3] = ["name", "id", "key"];

/// A node in a document tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Map(Map),
    Seq(Vec<Value>),
}

impl Value {
    pub fn new_map() -> Self {
        Value::Map(Map::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Map(_) | Value::Seq(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of the value. Strings holding an integer count too,
    /// since documents often quote numbers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Short noun for error messages: "a map", "a list", "a scalar".
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Map(_) => "a map",
            Value::Seq(_) => "a list",
            _ => "a scalar",
        }
    }

    /// Look up a child of a map by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// The scalar rendered for use in a path segment or a joined string.
    /// Returns `None` for maps and lists.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(n) => Some(n.to_string()),
            Value::Float(f) => Some(format_float(*f)),
            Value::String(s) => Some(s.clone()),
            Value::Map(_) | Value::Seq(_) => None,
        }
    }

    /// The distinguishing field shared by every element of a tagged sequence.
    ///
    /// A sequence is tagged when it is non-empty, every element is a map,
    /// and every map carries one of the [`TAG_FIELDS`] as a scalar.
    pub fn tag_field(&self) -> Option<&'static str> {
        let items = self.as_seq()?;
        if items.is_empty() {
            return None;
        }
        TAG_FIELDS.into_iter().find(|field| {
            items.iter().all(|item| {
                item.get(field)
                    .map(|v| v.is_scalar() && !v.is_null())
                    .unwrap_or(false)
            })
        })
    }

    /// Index of the first element of a sequence whose `field` renders as `name`.
    pub fn position_named(items: &[Value], field: &str, name: &str) -> Option<usize> {
        items.iter().position(|item| {
            item.get(field)
                .and_then(Value::scalar_string)
                .map(|s| s == name)
                .unwrap_or(false)
        })
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scalar_string() {
            Some(s) => f.write_str(&s),
            None => f.write_str(self.kind()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::Map(m)
    }
}

impl From<Vec<Value>> for Value {
    fn from(s: Vec<Value>) -> Self {
        Value::Seq(s)
    }
}
