//! Error and warning types of the policy engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracewarden_trace::Range;

/// A single compile-time failure with its source position.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("type error at line {line}, column {column}: {message}")]
    Type {
        line: usize,
        column: usize,
        message: String,
    },
}

impl CompileError {
    pub fn line(&self) -> usize {
        match self {
            CompileError::Parse { line, .. } | CompileError::Type { line, .. } => *line,
        }
    }
}

/// All failures found while compiling a policy source.
///
/// Parsing and type checking keep going after the first problem so that a
/// policy author sees every defect at once.
#[derive(Debug, Clone)]
pub struct PolicyErrorBag {
    pub errors: Vec<CompileError>,
}

impl std::error::Error for PolicyErrorBag {}

impl fmt::Display for PolicyErrorBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "policy failed to compile with {} error(s):", self.errors.len())?;
        for err in &self.errors {
            writeln!(f, " - {err}")?;
        }
        Ok(())
    }
}

/// Non-fatal finding produced during an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    /// Malformed trace input, tolerated outside strict mode.
    TraceInput,
    /// A detector required by a rule is not registered; atoms using it were
    /// treated as unknown.
    DetectorUnavailable,
    /// A detector ran but failed or timed out; atoms treated as unknown.
    DetectorFailed,
    /// A rule body expression could not be evaluated for some binding.
    Evaluation,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Warning {
            kind,
            message: message.into(),
        }
    }
}

/// A rule violation found in a trace: the base domain error.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyViolation {
    /// Error kind: `"PolicyViolation"` unless the rule names a constructor
    /// (e.g. `AccessControlViolation`).
    pub kind: String,
    pub message: String,
    /// Keyword fields of the error constructor, evaluated under the binding.
    pub fields: BTreeMap<String, Value>,
    /// Localization pointers into the trace.
    pub ranges: Vec<Range>,
    /// Index of the originating rule within its policy.
    pub origin_rule: usize,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.kind, self.message)?;
        for (k, v) in &self.fields {
            write!(f, ", {k}={v}")?;
        }
        write!(f, ")")
    }
}
