//! Scoring core for text-to-SQL evaluation.
//!
//! This crate is deterministic and does no I/O beyond reading dataset files:
//!
//! - [`types`], [`result_set`], [`verdict`]: the data model shared with the
//!   evaluation agent
//! - [`sql_safety`]: read-only allow-list and ordering detection
//! - [`sql_text`]: candidate sanitization, placeholder filling, complexity
//!   inference, table-name repair
//! - [`comparator`]: result-set equivalence under an [`EquivalencePolicy`]
//! - [`schema`]: schema descriptions and question-driven table selection
//! - [`benchmark`]: dataset loading, metrics and cross-database agreement
//!   aggregation, Markdown reports
//!
//! # Usage
//!
//! ```rust,ignore
//! use scoring::{compare, EquivalencePolicy};
//!
//! let outcome = compare(&gold, &candidate, &EquivalencePolicy::default());
//! assert!(outcome.is_match());
//! ```

pub mod benchmark;
pub mod comparator;
pub mod result_set;
pub mod schema;
pub mod sql_safety;
pub mod sql_text;
pub mod types;
pub mod verdict;

pub use comparator::{compare, Comparison, EquivalencePolicy, RowOrder};
pub use result_set::{ColumnMeta, ExecutionResult, FailureKind, ResultSet, Value};
pub use schema::{ColumnSchema, ForeignKey, SchemaDescription, TableSchema};
pub use sql_safety::{check_read_only, has_top_level_order_by, SqlSafetyError};
pub use sql_text::{extract_sql, fill_placeholders, infer_complexity, repair_table_names};
pub use types::{BenchmarkItem, ComplexityTier, ModelCandidate, TokenUsage, Variables};
pub use verdict::{Correctness, EngineOutcome, MirrorCheck, Verdict};
