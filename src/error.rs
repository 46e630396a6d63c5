use std::fmt;
use thiserror::Error;

/// Everything that can go wrong while resolving or running operator calls.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Malformed operator call or path text.
    #[error("syntax error near `{src}`: {message}")]
    Syntax { src: String, message: String },

    #[error("`{path}` could not be found in the datastructure")]
    NotFound { path: String },

    #[error("`{path}` is {got}, but {wanted} was wanted")]
    TypeMismatch {
        path: String,
        wanted: &'static str,
        got: &'static str,
    },

    #[error("environment variable ${name} is not set")]
    EnvVar { name: String },

    #[error("unknown operator `{name}`: operator not defined")]
    Undefined { name: String },

    #[error("cycle detected in operator data-flow graph")]
    Cycle,

    #[error("hit max recursion depth ({max_depth}); the document appears to reference itself")]
    MaxDepth { max_depth: usize },

    #[error("static IP {address} is already used by {claimant} (wanted by {wanted_by})")]
    Conflict {
        address: String,
        claimant: String,
        wanted_by: String,
    },

    /// A required parameter that was never supplied.
    #[error("{0}")]
    Param(String),

    #[error("{0}")]
    Operator(String),

    /// An error attributed to the call site it came from.
    #[error("$.{path}: {source}")]
    Located {
        path: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn syntax(src: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Syntax {
            src: src.into(),
            message: message.into(),
        }
    }

    pub fn operator(message: impl Into<String>) -> Self {
        Error::Operator(message.into())
    }

    pub fn located(self, path: impl fmt::Display) -> Self {
        Error::Located {
            path: path.to_string(),
            source: Box::new(self),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Syntax { .. } => "opcall-syntax-error",
            Error::NotFound { .. } => "unresolved-reference",
            Error::TypeMismatch { .. } => "type-mismatch",
            Error::EnvVar { .. } => "unset-environment-variable",
            Error::Undefined { .. } => "undefined-operator",
            Error::Cycle => "dataflow-cycle",
            Error::MaxDepth { .. } => "max-recursion-depth",
            Error::Conflict { .. } => "allocation-conflict",
            Error::Param(_) => "required-parameter",
            Error::Operator(_) => "operator-failure",
            Error::Located { source, .. } => source.code(),
        }
    }

    /// Structural failures abort a run outright instead of being batched.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Cycle | Error::MaxDepth { .. } => true,
            Error::Located { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// A batch of independent failures collected over one phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiError {
    pub errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        MultiError { errors: Vec::new() }
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Append every error from another batch.
    pub fn append(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// The first structural error in the batch, if any.
    pub fn fatal(&self) -> Option<&Error> {
        self.errors.iter().find(|e| e.is_fatal())
    }
}

impl From<Error> for MultiError {
    fn from(err: Error) -> Self {
        MultiError { errors: vec![err] }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<String> = self.errors.iter().map(|e| format!(" - {}", e)).collect();
        lines.sort();
        write!(f, "{} error(s) detected:", self.errors.len())?;
        for line in lines {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// A non-fatal problem found while parsing an operator call.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub message: String,
    /// Full text of the operator call the warning was raised for.
    pub src: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.src)
    }
}
