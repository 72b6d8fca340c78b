//! Benchmark data model.
//!
//! Items are created once at dataset load and never mutated. Candidates are
//! produced once per (item, model) pair by a model adapter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Ordinal difficulty of a benchmark item's gold query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    /// No joins and no subqueries.
    Simple,
    /// A couple of joins or a single subquery.
    #[serde(alias = "medium")]
    Moderate,
    /// Everything else.
    Complex,
}

impl ComplexityTier {
    pub fn all() -> &'static [ComplexityTier] {
        &[Self::Simple, Self::Moderate, Self::Complex]
    }

    /// Parse a tier label, accepting `medium` as an alias of `moderate`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "simple" | "easy" => Some(Self::Simple),
            "moderate" | "medium" => Some(Self::Moderate),
            "complex" | "hard" => Some(Self::Complex),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// A single question with its gold query, bound to one target database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkItem {
    /// Unique identifier within the dataset.
    pub id: String,
    /// Natural-language question as shown to the model.
    pub question: String,
    /// Identifier of the database the gold query runs against.
    pub database: String,
    /// Reference query, already materialized with concrete values.
    pub gold_sql: String,
    /// Difficulty tier used for stratified aggregation.
    pub tier: ComplexityTier,
    /// Dataset split of the query template, if the dataset defines one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_split: Option<String>,
    /// Dataset split of the question paraphrase, if the dataset defines one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_split: Option<String>,
    /// Placeholder bindings applied to the question and gold SQL at load.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: Variables,
}

impl BenchmarkItem {
    pub fn new(
        id: impl Into<String>,
        question: impl Into<String>,
        database: impl Into<String>,
        gold_sql: impl Into<String>,
        tier: ComplexityTier,
    ) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            database: database.into(),
            gold_sql: gold_sql.into(),
            tier,
            query_split: None,
            question_split: None,
            variables: Variables::new(),
        }
    }

    pub fn with_splits(mut self, query_split: Option<String>, question_split: Option<String>) -> Self {
        self.query_split = query_split;
        self.question_split = question_split;
        self
    }

    /// Whether this item belongs to the given split label.
    pub fn in_split(&self, split: &str) -> bool {
        self.query_split.as_deref() == Some(split) || self.question_split.as_deref() == Some(split)
    }
}

/// Token accounting reported by a model backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

/// Output of one model adapter call for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub item_id: String,
    pub model: String,
    /// Text exactly as returned by the backend.
    pub raw_output: String,
    /// Sanitized SQL; empty when generation failed.
    pub sql: String,
    /// Wall-clock time spent in the adapter, retries and backoff included.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// Number of backend calls made.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
}

impl ModelCandidate {
    pub fn succeeded(
        item_id: &str,
        model: &str,
        raw_output: String,
        sql: String,
        latency: Duration,
        attempts: u32,
        tokens: Option<TokenUsage>,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            model: model.to_string(),
            raw_output,
            sql,
            latency,
            attempts,
            tokens,
            generation_error: None,
        }
    }

    pub fn failed(
        item_id: &str,
        model: &str,
        error: impl Into<String>,
        latency: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            model: model.to_string(),
            raw_output: String::new(),
            sql: String::new(),
            latency,
            attempts,
            tokens: None,
            generation_error: Some(error.into()),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.generation_error.is_none() && !self.sql.trim().is_empty()
    }
}

/// Free-form variable bindings attached to dataset questions.
pub type Variables = BTreeMap<String, String>;

/// Serde helper storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_is_ordinal() {
        assert!(ComplexityTier::Simple < ComplexityTier::Moderate);
        assert!(ComplexityTier::Moderate < ComplexityTier::Complex);
    }

    #[test]
    fn tier_accepts_medium_alias() {
        let tier: ComplexityTier = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(tier, ComplexityTier::Moderate);
        assert_eq!(ComplexityTier::parse("Medium"), Some(ComplexityTier::Moderate));
        assert_eq!(ComplexityTier::parse("unknown"), None);
        assert_eq!(serde_json::to_string(&tier).unwrap(), "\"moderate\"");
    }

    #[test]
    fn candidate_usability() {
        let ok = ModelCandidate::succeeded(
            "q1",
            "m",
            "SELECT 1".into(),
            "SELECT 1".into(),
            Duration::from_millis(5),
            1,
            None,
        );
        assert!(ok.is_usable());

        let failed = ModelCandidate::failed("q1", "m", "rate limited", Duration::ZERO, 3);
        assert!(!failed.is_usable());
        assert_eq!(failed.attempts, 3);
    }

    #[test]
    fn item_split_membership() {
        let item = BenchmarkItem::new("a-0-0", "q", "advising", "SELECT 1", ComplexityTier::Simple)
            .with_splits(Some("train".into()), Some("test".into()));
        assert!(item.in_split("test"));
        assert!(item.in_split("train"));
        assert!(!item.in_split("dev"));
    }
}
