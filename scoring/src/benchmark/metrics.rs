//! Metrics Aggregator
//!
//! Folds verdicts into per-(model, tier) statistics. The batch entry point
//! [`aggregate`] and the incremental [`MetricsAccumulator`] share one code
//! path, so both produce identical results regardless of verdict order:
//! sums are integer milliseconds and percentile samples are sorted at
//! `finish` time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::benchmark::agreement::{AgreementAccumulator, AgreementRow};
use crate::types::ComplexityTier;
use crate::verdict::Verdict;

/// z-score of a two-sided 95% interval.
const Z_95: f64 = 1.96;

/// Grouping key of an [`AggregateStat`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatKey {
    pub model: String,
    pub tier: ComplexityTier,
}

impl StatKey {
    pub fn new(model: impl Into<String>, tier: ComplexityTier) -> Self {
        Self {
            model: model.into(),
            tier,
        }
    }
}

/// Latency distribution in milliseconds (nearest-rank percentiles).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub median_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        Self {
            count: sorted.len() as u64,
            mean_ms: sum as f64 / sorted.len() as f64,
            median_ms: nearest_rank(&sorted, 0.50),
            p90_ms: nearest_rank(&sorted, 0.90),
            p95_ms: nearest_rank(&sorted, 0.95),
            max_ms: sorted.last().copied().unwrap_or(0),
        }
    }
}

/// Statistics for one (model, tier) group, or one model across tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStat {
    /// Every verdict in the group, failures included.
    pub total: u64,
    pub matches: u64,
    /// `matches / total`; 0 for an empty group.
    pub accuracy: f64,
    /// 95% Wilson score interval around `accuracy`.
    pub accuracy_ci_low: f64,
    pub accuracy_ci_high: f64,
    /// Pairs where both gold and candidate produced a result set.
    pub executed: u64,
    pub execution_success_rate: f64,
    /// `matches / executed`.
    pub conditional_accuracy: f64,
    /// Over executed pairs only.
    pub generation_latency: LatencySummary,
    /// Over executed pairs only.
    pub execution_latency: LatencySummary,
    /// Count per non-completed verdict kind, e.g. `candidate_execution_error.timeout`.
    pub errors: BTreeMap<String, u64>,
    pub tokens_total: u64,
}

/// Raw per-group samples; everything in an [`AggregateStat`] derives from it.
#[derive(Debug, Clone, Default)]
struct Bucket {
    total: u64,
    matches: u64,
    executed: u64,
    generation_ms: Vec<u64>,
    execution_ms: Vec<u64>,
    errors: BTreeMap<String, u64>,
    tokens: u64,
}

impl Bucket {
    fn fold(&mut self, v: &Verdict) {
        self.total += 1;
        if v.correctness.is_match() {
            self.matches += 1;
        }
        if v.correctness.is_executed() {
            self.executed += 1;
            self.generation_ms.push(v.generation_ms);
            if let Some(ms) = v.candidate_execution_ms {
                self.execution_ms.push(ms);
            }
        } else {
            *self.errors.entry(v.correctness.label()).or_insert(0) += 1;
        }
        self.tokens += v.tokens.map(|t| t.total()).unwrap_or(0);
    }

    fn merge(&mut self, other: &Bucket) {
        self.total += other.total;
        self.matches += other.matches;
        self.executed += other.executed;
        self.generation_ms.extend_from_slice(&other.generation_ms);
        self.execution_ms.extend_from_slice(&other.execution_ms);
        for (k, n) in &other.errors {
            *self.errors.entry(k.clone()).or_insert(0) += n;
        }
        self.tokens += other.tokens;
    }

    fn finish(&self) -> AggregateStat {
        let (ci_low, ci_high) = wilson_interval(self.matches, self.total);
        AggregateStat {
            total: self.total,
            matches: self.matches,
            accuracy: ratio(self.matches, self.total),
            accuracy_ci_low: ci_low,
            accuracy_ci_high: ci_high,
            executed: self.executed,
            execution_success_rate: ratio(self.executed, self.total),
            conditional_accuracy: ratio(self.matches, self.executed),
            generation_latency: LatencySummary::from_samples(&self.generation_ms),
            execution_latency: LatencySummary::from_samples(&self.execution_ms),
            errors: self.errors.clone(),
            tokens_total: self.tokens,
        }
    }
}

/// Incremental aggregator. Folding verdicts one at a time and calling
/// [`finish`](Self::finish) equals [`aggregate`] over the same verdicts.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    buckets: BTreeMap<StatKey, Bucket>,
    agreement: AgreementAccumulator,
    folded: u64,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, verdict: &Verdict) {
        self.buckets
            .entry(StatKey::new(verdict.model.clone(), verdict.tier))
            .or_default()
            .fold(verdict);
        self.agreement.fold(verdict);
        self.folded += 1;
    }

    /// Number of verdicts folded so far.
    pub fn verdict_count(&self) -> u64 {
        self.folded
    }

    pub fn finish(&self) -> BTreeMap<StatKey, AggregateStat> {
        self.buckets
            .iter()
            .map(|(k, b)| (k.clone(), b.finish()))
            .collect()
    }

    /// Per-(database, mirror) agreement; empty when no mirror was checked.
    pub fn agreement(&self) -> Vec<AgreementRow> {
        self.agreement.rows()
    }

    /// Per-model statistics across all tiers.
    pub fn model_rollups(&self) -> BTreeMap<String, AggregateStat> {
        let mut merged: BTreeMap<String, Bucket> = BTreeMap::new();
        for (key, bucket) in &self.buckets {
            merged.entry(key.model.clone()).or_default().merge(bucket);
        }
        merged.into_iter().map(|(m, b)| (m, b.finish())).collect()
    }
}

/// Batch aggregation over a full verdict collection.
pub fn aggregate(verdicts: &[Verdict]) -> BTreeMap<StatKey, AggregateStat> {
    let mut acc = MetricsAccumulator::new();
    for v in verdicts {
        acc.fold(v);
    }
    acc.finish()
}

/// A flattened (model, tier, stat) row, the shape written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    pub model: String,
    pub tier: ComplexityTier,
    #[serde(flatten)]
    pub stat: AggregateStat,
}

pub fn to_rows(stats: &BTreeMap<StatKey, AggregateStat>) -> Vec<StatRow> {
    stats
        .iter()
        .map(|(k, s)| StatRow {
            model: k.model.clone(),
            tier: k.tier,
            stat: s.clone(),
        })
        .collect()
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Nearest-rank percentile of an ascending slice: element `ceil(q*n) - 1`.
pub fn nearest_rank(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let rank = (q * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// 95% Wilson score interval for `successes` out of `n`.
pub fn wilson_interval(successes: u64, n: u64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let n_f = n as f64;
    let p = successes as f64 / n_f;
    let z2 = Z_95 * Z_95;
    let denom = 1.0 + z2 / n_f;
    let center = (p + z2 / (2.0 * n_f)) / denom;
    let half = Z_95 * (p * (1.0 - p) / n_f + z2 / (4.0 * n_f * n_f)).sqrt() / denom;
    ((center - half).max(0.0), (center + half).min(1.0))
}
