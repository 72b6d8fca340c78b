//! Cross-database agreement.
//!
//! A mirror is a second database holding the same data, usually on another
//! engine. Pairs whose database has mirrors re-run gold and candidate there;
//! this module classifies each re-run and folds the classifications into
//! per-(database, mirror) agreement rates. Agreement is only defined where
//! both sides executed, so rates use that count as the denominator and the
//! one-sided successes are reported next to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::comparator::{compare, Comparison, EquivalencePolicy};
use crate::result_set::ExecutionResult;
use crate::verdict::{EngineOutcome, MirrorCheck, Verdict};

/// Classify one statement run on `primary` and again on `mirror`.
pub fn engine_outcome(
    primary: &ExecutionResult,
    mirror: &ExecutionResult,
    policy: &EquivalencePolicy,
) -> (EngineOutcome, String) {
    match (primary.is_success(), mirror.is_success()) {
        (true, true) => match compare(primary, mirror, policy) {
            Comparison::Match { note } => (EngineOutcome::Agree, note.unwrap_or_default()),
            Comparison::Mismatch { diagnostic } => (EngineOutcome::Disagree, diagnostic),
            // Unreachable with two successes; kept total.
            other => (EngineOutcome::Disagree, format!("{other:?}")),
        },
        (true, false) => (EngineOutcome::PrimaryOnly, failure_text(mirror)),
        (false, true) => (EngineOutcome::MirrorOnly, failure_text(primary)),
        (false, false) => (EngineOutcome::NeitherExecuted, String::new()),
    }
}

fn failure_text(result: &ExecutionResult) -> String {
    match result {
        ExecutionResult::Failure { kind, message, .. } => format!("{kind}: {message}"),
        ExecutionResult::Success(_) => String::new(),
    }
}

/// Grouping key of an [`AgreementStat`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgreementKey {
    pub database: String,
    pub mirror: String,
}

/// Counts for one statement role (gold or candidate) on one database pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineTally {
    /// Both sides executed.
    pub compared: u64,
    pub agree: u64,
    /// `agree / compared`; `None` when nothing was compared.
    pub agreement_rate: Option<f64>,
    pub primary_only: u64,
    pub mirror_only: u64,
    pub neither: u64,
}

impl EngineTally {
    fn fold(&mut self, outcome: EngineOutcome) {
        match outcome {
            EngineOutcome::Agree => {
                self.compared += 1;
                self.agree += 1;
            }
            EngineOutcome::Disagree => self.compared += 1,
            EngineOutcome::PrimaryOnly => self.primary_only += 1,
            EngineOutcome::MirrorOnly => self.mirror_only += 1,
            EngineOutcome::NeitherExecuted => self.neither += 1,
            EngineOutcome::Unavailable => {}
        }
        self.agreement_rate = (self.compared > 0).then(|| self.agree as f64 / self.compared as f64);
    }
}

/// Agreement between a database and one of its mirrors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgreementStat {
    /// Mirror re-runs attempted, unavailable ones included.
    pub checks: u64,
    pub unavailable: u64,
    pub gold: EngineTally,
    pub candidate: EngineTally,
    /// Candidate execution time on the mirror, over re-runs that reported one.
    pub mirror_execution_ms_mean: Option<f64>,
    #[serde(skip)]
    mirror_execution_ms: Vec<u64>,
}

impl AgreementStat {
    fn fold(&mut self, check: &MirrorCheck) {
        self.checks += 1;
        if check.gold == EngineOutcome::Unavailable {
            self.unavailable += 1;
            return;
        }
        self.gold.fold(check.gold);
        self.candidate.fold(check.candidate);
        if let Some(ms) = check.candidate_execution_ms {
            self.mirror_execution_ms.push(ms);
            let sum: u64 = self.mirror_execution_ms.iter().sum();
            self.mirror_execution_ms_mean =
                Some(sum as f64 / self.mirror_execution_ms.len() as f64);
        }
    }
}

/// Incremental agreement aggregator, folded alongside the metrics.
#[derive(Debug, Clone, Default)]
pub struct AgreementAccumulator {
    stats: BTreeMap<AgreementKey, AgreementStat>,
}

impl AgreementAccumulator {
    pub fn fold(&mut self, verdict: &Verdict) {
        for check in &verdict.mirrors {
            self.stats
                .entry(AgreementKey {
                    database: verdict.database.clone(),
                    mirror: check.database.clone(),
                })
                .or_default()
                .fold(check);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn rows(&self) -> Vec<AgreementRow> {
        self.stats
            .iter()
            .map(|(k, s)| AgreementRow {
                database: k.database.clone(),
                mirror: k.mirror.clone(),
                stat: s.clone(),
            })
            .collect()
    }
}

/// A flattened (database, mirror, stat) row, as written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementRow {
    pub database: String,
    pub mirror: String,
    #[serde(flatten)]
    pub stat: AgreementStat,
}

/// Batch agreement over a full verdict collection.
pub fn aggregate_agreement(verdicts: &[Verdict]) -> Vec<AgreementRow> {
    let mut acc = AgreementAccumulator::default();
    for v in verdicts {
        acc.fold(v);
    }
    acc.rows()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::{ColumnMeta, FailureKind, ResultSet, Value};
    use crate::types::ComplexityTier;
    use crate::verdict::Correctness;
    use std::time::Duration;

    fn rows(values: &[i64]) -> ExecutionResult {
        ExecutionResult::Success(
            ResultSet::new(
                vec![ColumnMeta::new("n", "INTEGER")],
                values.iter().map(|v| vec![Value::Integer(*v)]).collect(),
            )
            .with_elapsed(Duration::from_millis(3)),
        )
    }

    fn failed() -> ExecutionResult {
        ExecutionResult::failure(FailureKind::SyntaxError, "no such function: ILIKE", Duration::ZERO)
    }

    fn check(mirror: &str, gold: EngineOutcome, candidate: EngineOutcome) -> MirrorCheck {
        MirrorCheck {
            database: mirror.to_string(),
            gold,
            candidate,
            candidate_execution_ms: None,
            diagnostic: String::new(),
        }
    }

    fn verdict(item: &str, checks: Vec<MirrorCheck>) -> Verdict {
        let mut v = Verdict::bare(item, "m", "uni", ComplexityTier::Simple, Correctness::Match, "");
        v.mirrors = checks;
        v
    }

    #[test]
    fn test_engine_outcome_classifies_each_side() {
        let policy = EquivalencePolicy::default();
        assert_eq!(engine_outcome(&rows(&[2, 1]), &rows(&[1, 2]), &policy).0, EngineOutcome::Agree);

        let (outcome, diagnostic) = engine_outcome(&rows(&[1, 2]), &rows(&[1, 3]), &policy);
        assert_eq!(outcome, EngineOutcome::Disagree);
        assert!(!diagnostic.is_empty());

        let (outcome, diagnostic) = engine_outcome(&rows(&[1]), &failed(), &policy);
        assert_eq!(outcome, EngineOutcome::PrimaryOnly);
        assert!(diagnostic.contains("ILIKE"));

        assert_eq!(engine_outcome(&failed(), &rows(&[1]), &policy).0, EngineOutcome::MirrorOnly);
        assert_eq!(engine_outcome(&failed(), &failed(), &policy).0, EngineOutcome::NeitherExecuted);
    }

    #[test]
    fn test_agreement_rate_counts_only_compared_runs() {
        use EngineOutcome::*;
        let verdicts = vec![
            verdict("q1", vec![check("uni_pg", Agree, Agree)]),
            verdict("q2", vec![check("uni_pg", Agree, Disagree)]),
            verdict("q3", vec![check("uni_pg", Disagree, PrimaryOnly)]),
            verdict("q4", vec![check("uni_pg", Agree, MirrorOnly)]),
            verdict("q5", vec![check("uni_pg", Unavailable, Unavailable)]),
            verdict("q6", vec![]),
        ];
        let rows = aggregate_agreement(&verdicts);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!((row.database.as_str(), row.mirror.as_str()), ("uni", "uni_pg"));
        assert_eq!(row.stat.checks, 5);
        assert_eq!(row.stat.unavailable, 1);

        assert_eq!(row.stat.gold.compared, 4);
        assert_eq!(row.stat.gold.agree, 3);
        assert_eq!(row.stat.gold.agreement_rate, Some(0.75));

        assert_eq!(row.stat.candidate.compared, 2);
        assert_eq!(row.stat.candidate.agreement_rate, Some(0.5));
        assert_eq!(row.stat.candidate.primary_only, 1);
        assert_eq!(row.stat.candidate.mirror_only, 1);
    }

    #[test]
    fn test_agreement_is_keyed_per_mirror() {
        use EngineOutcome::*;
        let mut timed = check("uni_b", Agree, Agree);
        timed.candidate_execution_ms = Some(4);
        let mut slower = check("uni_b", Agree, Agree);
        slower.candidate_execution_ms = Some(8);
        let verdicts = vec![
            verdict("q1", vec![check("uni_a", NeitherExecuted, NeitherExecuted), timed]),
            verdict("q2", vec![slower]),
        ];
        let rows = aggregate_agreement(&verdicts);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mirror, "uni_a");
        assert_eq!(rows[0].stat.gold.agreement_rate, None);
        assert_eq!(rows[0].stat.gold.neither, 1);
        assert_eq!(rows[1].mirror, "uni_b");
        assert_eq!(rows[1].stat.checks, 2);
        assert_eq!(rows[1].stat.mirror_execution_ms_mean, Some(6.0));

        let json = serde_json::to_value(&rows[1]).unwrap();
        assert_eq!(json["database"], "uni");
        assert_eq!(json["gold"]["agreement_rate"], 1.0);
        assert!(json.get("mirror_execution_ms").is_none());
    }
}
