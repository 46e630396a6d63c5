use crate::error::Error;
use crate::tree::{Value, TAG_FIELDS};
use std::fmt;

/// A location inside a document tree: map keys and sequence positions,
/// root first. Sequence elements may also be named by the value of their
/// `name`, `id` or `key` field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Path::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse dotted path text: `a.b.c`, `a.list[0].b`, `$.a.b`, `a[x.y]`.
    pub fn parse(src: &str) -> Result<Path, Error> {
        let mut segments: Vec<String> = Vec::new();
        let mut node = String::new();
        let mut bracketed = false;

        fn push(segments: &mut Vec<String>, node: &mut String) {
            if node.is_empty() {
                return;
            }
            if segments.is_empty() && node == "$" {
                node.clear();
                return;
            }
            segments.push(std::mem::take(node));
        }

        for ch in src.chars() {
            match ch {
                '.' if !bracketed => push(&mut segments, &mut node),
                '[' => {
                    if bracketed {
                        return Err(Error::syntax(src, "unexpected '['"));
                    }
                    push(&mut segments, &mut node);
                    bracketed = true;
                }
                ']' => {
                    if !bracketed {
                        return Err(Error::syntax(src, "unexpected ']'"));
                    }
                    push(&mut segments, &mut node);
                    bracketed = false;
                }
                _ => node.push(ch),
            }
        }
        if bracketed {
            return Err(Error::syntax(src, "unterminated '['"));
        }
        push(&mut segments, &mut node);
        Ok(Path { segments })
    }

    pub fn push(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    pub fn pop(&mut self) -> Option<String> {
        self.segments.pop()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The path one level up; the root is its own parent.
    pub fn parent(&self) -> Path {
        let mut p = self.clone();
        p.pop();
        p
    }

    /// A copy of this path extended by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut p = self.clone();
        p.push(segment);
        p
    }

    /// True when `self` lies strictly below `other`.
    pub fn under(&self, other: &Path) -> bool {
        self.segments.len() > other.segments.len()
            && !other.segments.is_empty()
            && self.segments.starts_with(&other.segments)
    }

    /// Walk the path through `root` and return the value found there.
    pub fn resolve<'a>(&self, root: &'a Value) -> Result<&'a Value, Error> {
        let mut current = root;
        for (i, key) in self.segments.iter().enumerate() {
            current = match step(current, key) {
                Step::Found(_, v) => v,
                Step::Missing => return Err(self.not_found(i)),
                Step::Scalar(v) => return Err(self.type_mismatch(i, v)),
            };
        }
        Ok(current)
    }

    /// Mutable counterpart of [`Path::resolve`].
    pub fn resolve_mut<'a>(&self, root: &'a mut Value) -> Result<&'a mut Value, Error> {
        let mut current = root;
        for (i, key) in self.segments.iter().enumerate() {
            let index = match step(current, key) {
                Step::Found(index, _) => index,
                Step::Missing => return Err(self.not_found(i)),
                Step::Scalar(v) => return Err(self.type_mismatch(i, v)),
            };
            current = match current {
                Value::Map(m) => match m.get_mut(key) {
                    Some(v) => v,
                    None => return Err(self.not_found(i)),
                },
                Value::Seq(items) => &mut items[index],
                _ => return Err(self.not_found(i)),
            };
        }
        Ok(current)
    }

    /// Rewrite every by-name sequence segment to its numeric index.
    ///
    /// Fails when any prefix of the path does not exist in `root` yet.
    pub fn canonical(&self, root: &Value) -> Result<Path, Error> {
        let mut canon = Path::root();
        let mut current = root;
        for (i, key) in self.segments.iter().enumerate() {
            match step(current, key) {
                Step::Found(index, v) => {
                    match current {
                        Value::Seq(_) => canon.push(index.to_string()),
                        _ => canon.push(key.clone()),
                    }
                    current = v;
                }
                Step::Missing => return Err(self.not_found(i)),
                Step::Scalar(v) => return Err(self.type_mismatch(i, v)),
            }
        }
        Ok(canon)
    }

    /// Canonicalize the nearest ancestor (or self) that resolves in `root`.
    ///
    /// Returns `None` when not even the first segment exists.
    pub fn resolvable_ancestor(&self, root: &Value) -> Option<Path> {
        let mut candidate = self.clone();
        while !candidate.is_root() {
            if let Ok(canon) = candidate.canonical(root) {
                return Some(canon);
            }
            candidate.pop();
        }
        None
    }

    /// Expand `*` segments into every concrete path present in `root`.
    ///
    /// Map children are visited in document order and sequence children by
    /// position, so the expansion is stable for a given tree.
    pub fn glob(&self, root: &Value) -> Result<Vec<Path>, Error> {
        let mut found = Vec::new();
        let mut here = Path::root();
        self.glob_from(root, &mut here, 0, &mut found)?;
        Ok(found)
    }

    fn glob_from(
        &self,
        node: &Value,
        here: &mut Path,
        pos: usize,
        found: &mut Vec<Path>,
    ) -> Result<(), Error> {
        if pos == self.segments.len() {
            found.push(here.clone());
            return Ok(());
        }
        let key = &self.segments[pos];
        if key == "*" {
            let children: Vec<(String, &Value)> = match node {
                Value::Map(m) => m.iter().map(|(k, v)| (k.clone(), v)).collect(),
                Value::Seq(items) => items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v))
                    .collect(),
                other => return Err(self.type_mismatch(pos, other)),
            };
            // Children that lack the rest of the pattern are skipped.
            for (segment, child) in children {
                here.push(segment);
                let _ = self.glob_from(child, here, pos + 1, found);
                here.pop();
            }
            return Ok(());
        }
        match step(node, key) {
            Step::Found(index, child) => {
                match node {
                    Value::Seq(_) => here.push(index.to_string()),
                    _ => here.push(key.clone()),
                }
                let result = self.glob_from(child, here, pos + 1, found);
                here.pop();
                result
            }
            Step::Missing => Err(self.not_found(pos)),
            Step::Scalar(v) => Err(self.type_mismatch(pos, v)),
        }
    }

    fn prefix_string(&self, upto: usize) -> String {
        self.segments[..=upto].join(".")
    }

    fn not_found(&self, upto: usize) -> Error {
        Error::NotFound {
            path: self.prefix_string(upto),
        }
    }

    fn type_mismatch(&self, upto: usize, got: &Value) -> Error {
        Error::TypeMismatch {
            path: self.prefix_string(upto),
            wanted: "a map or a list",
            got: got.kind(),
        }
    }
}

enum Step<'a> {
    /// Child found; the index is meaningful for sequences only.
    Found(usize, &'a Value),
    Missing,
    Scalar(&'a Value),
}

/// Descend one level from `node` along `key`.
fn step<'a>(node: &'a Value, key: &str) -> Step<'a> {
    match node {
        Value::Map(m) => match m.get_index_of(key) {
            Some(i) => Step::Found(i, &m[i]),
            None => Step::Missing,
        },
        Value::Seq(items) => {
            if let Ok(i) = key.parse::<usize>() {
                return match items.get(i) {
                    Some(v) => Step::Found(i, v),
                    None => Step::Missing,
                };
            }
            for field in TAG_FIELDS {
                if let Some(i) = Value::position_named(items, field, key) {
                    return Step::Found(i, &items[i]);
                }
            }
            Step::Missing
        }
        other => Step::Scalar(other),
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
