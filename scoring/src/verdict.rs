//! Terminal outcome of evaluating one (item, model) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::result_set::FailureKind;
use crate::types::{ComplexityTier, TokenUsage};

/// Correctness classification of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Correctness {
    /// Candidate and gold result sets are equivalent.
    Match,
    /// Both executed, results differ.
    Mismatch,
    /// The model adapter produced no usable SQL.
    CandidateGenerationError,
    /// The candidate statement failed to execute.
    CandidateExecutionError { failure: FailureKind },
    /// The gold statement failed; the item is flagged, the model is not blamed.
    GoldExecutionError { failure: FailureKind },
    /// Per-pair timeout or run deadline elapsed before the pair finished.
    Timeout,
    /// The run was cancelled before the pair finished.
    Cancelled,
    /// A bug in the harness (panic, illegal state transition).
    InternalError,
}

impl Correctness {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    /// Both gold and candidate produced a result set.
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Match | Self::Mismatch)
    }

    /// Histogram label, e.g. `candidate_execution_error.timeout`.
    pub fn label(&self) -> String {
        match self {
            Self::Match => "match".into(),
            Self::Mismatch => "mismatch".into(),
            Self::CandidateGenerationError => "candidate_generation_error".into(),
            Self::CandidateExecutionError { failure } => {
                format!("candidate_execution_error.{failure}")
            }
            Self::GoldExecutionError { failure } => format!("gold_execution_error.{failure}"),
            Self::Timeout => "timeout".into(),
            Self::Cancelled => "cancelled".into(),
            Self::InternalError => "internal_error".into(),
        }
    }
}

impl fmt::Display for Correctness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// How the same statement fared on a database and on its mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOutcome {
    /// Both executed and the result sets are equivalent.
    Agree,
    /// Both executed and the result sets differ.
    Disagree,
    /// Only the primary database executed the statement.
    PrimaryOnly,
    /// Only the mirror executed the statement.
    MirrorOnly,
    /// Neither database executed the statement.
    NeitherExecuted,
    /// The mirror could not be reached.
    Unavailable,
}

impl EngineOutcome {
    /// Both sides produced a result set, so agreement is defined.
    pub fn is_compared(&self) -> bool {
        matches!(self, Self::Agree | Self::Disagree)
    }
}

/// Gold and candidate of one pair re-run on a mirror database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorCheck {
    /// Id of the mirror database.
    pub database: String,
    pub gold: EngineOutcome,
    pub candidate: EngineOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_execution_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diagnostic: String,
}

/// One verdict per (item, model) pair. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub item_id: String,
    pub model: String,
    pub database: String,
    pub tier: ComplexityTier,
    pub correctness: Correctness,
    #[serde(default)]
    pub generation_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gold_execution_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_execution_ms: Option<u64>,
    #[serde(default)]
    pub total_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default)]
    pub candidate_sql: String,
    /// Human-readable detail: error text, first differing row, etc.
    #[serde(default)]
    pub diagnostic: String,
    /// Re-runs on mirror databases; correctness is judged on `database` only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<MirrorCheck>,
    pub completed_at: DateTime<Utc>,
}

impl Verdict {
    /// A verdict with no timings, for pairs that never ran or were cut short.
    pub fn bare(
        item_id: &str,
        model: &str,
        database: &str,
        tier: ComplexityTier,
        correctness: Correctness,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            model: model.to_string(),
            database: database.to_string(),
            tier,
            correctness,
            generation_ms: 0,
            gold_execution_ms: None,
            candidate_execution_ms: None,
            total_ms: 0,
            attempts: 0,
            tokens: None,
            candidate_sql: String::new(),
            diagnostic: diagnostic.into(),
            mirrors: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn pair_key(&self) -> (&str, &str) {
        (self.item_id.as_str(), self.model.as_str())
    }
}
