//! Typed query results as produced by the query executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::duration_ms;

/// A single scalar cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    /// Exact decimal rendered as text (e.g. PostgreSQL `NUMERIC`).
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric view of the value, if it has one.
    ///
    /// Text is only considered numeric when `coerce_text` is set.
    pub fn as_f64(&self, coerce_text: bool) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(f) => Some(*f),
            Self::Decimal(d) => d.trim().parse().ok(),
            Self::Text(s) if coerce_text => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Name and engine-reported type of a result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(default)]
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine rejected the statement while parsing or planning it.
    SyntaxError,
    /// The engine failed while producing rows.
    RuntimeError,
    /// The time budget elapsed and the statement was cancelled.
    Timeout,
    /// The read-only allow-list rejected the statement before execution.
    Unsafe,
    /// The connection broke during the call.
    ConnectionLost,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyntaxError => write!(f, "syntax_error"),
            Self::RuntimeError => write!(f, "runtime_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unsafe => write!(f, "unsafe"),
            Self::ConnectionLost => write!(f, "connection_lost"),
        }
    }
}

/// Successful result of a read statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Rows streamed from the engine, including the one that tripped the cap.
    pub rows_examined: u64,
    /// Streaming stopped at the row limit.
    pub truncated: bool,
    /// The executed statement carries a top-level `ORDER BY`.
    pub ordered: bool,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Value>>) -> Self {
        let rows_examined = rows.len() as u64;
        Self {
            columns,
            rows,
            elapsed: Duration::ZERO,
            rows_examined,
            truncated: false,
            ordered: false,
        }
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Output of the query executor. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(ResultSet),
    Failure {
        kind: FailureKind,
        message: String,
        #[serde(with = "duration_ms")]
        elapsed: Duration,
    },
}

impl ExecutionResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Success(rs) => rs.elapsed,
            Self::Failure { elapsed, .. } => *elapsed,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn as_result_set(&self) -> Option<&ResultSet> {
        match self {
            Self::Success(rs) => Some(rs),
            Self::Failure { .. } => None,
        }
    }
}
