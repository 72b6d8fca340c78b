//! Markdown rendering of aggregated statistics.

use std::collections::{BTreeMap, BTreeSet};

use super::agreement::{AgreementRow, EngineTally};
use super::metrics::{AggregateStat, StatKey};

/// Run-level facts printed above the tables.
#[derive(Debug, Clone, Default)]
pub struct ReportHeader {
    pub run_id: String,
    /// `completed`, or `partial: <reason>`.
    pub status: String,
    pub pairs_attempted: u64,
    pub verdicts_recorded: u64,
}

fn pct(x: f64) -> String {
    format!("{:.1}%", x * 100.0)
}

/// Format aggregated statistics as a Markdown report.
pub fn format_report(
    header: &ReportHeader,
    stats: &BTreeMap<StatKey, AggregateStat>,
    rollups: &BTreeMap<String, AggregateStat>,
) -> String {
    let mut report = String::new();

    report.push_str("# Text-to-SQL Evaluation Report\n\n");
    if !header.run_id.is_empty() {
        report.push_str(&format!(
            "| Run | Status | Pairs attempted | Verdicts recorded |\n\
             |-----|--------|-----------------|-------------------|\n\
             | {} | {} | {} | {} |\n\n",
            header.run_id, header.status, header.pairs_attempted, header.verdicts_recorded
        ));
    }

    report.push_str("## Models\n\n");
    report.push_str(
        "| Model | Total | Matches | Accuracy | 95% CI | Executed | Cond. accuracy | Tokens |\n",
    );
    report.push_str(
        "|-------|-------|---------|----------|--------|----------|----------------|--------|\n",
    );
    for (model, s) in rollups {
        report.push_str(&format!(
            "| {} | {} | {} | {} | [{}, {}] | {} | {} | {} |\n",
            model,
            s.total,
            s.matches,
            pct(s.accuracy),
            pct(s.accuracy_ci_low),
            pct(s.accuracy_ci_high),
            s.executed,
            pct(s.conditional_accuracy),
            s.tokens_total,
        ));
    }
    report.push('\n');

    report.push_str("## By Complexity Tier\n\n");
    report.push_str(
        "| Model | Tier | Total | Accuracy | Exec. success | Gen p50 | Gen p95 | Exec p50 | Exec p95 |\n",
    );
    report.push_str(
        "|-------|------|-------|----------|---------------|---------|---------|----------|----------|\n",
    );
    for (key, s) in stats {
        report.push_str(&format!(
            "| {} | {} | {} | {} | {} | {}ms | {}ms | {}ms | {}ms |\n",
            key.model,
            key.tier,
            s.total,
            pct(s.accuracy),
            pct(s.execution_success_rate),
            s.generation_latency.median_ms,
            s.generation_latency.p95_ms,
            s.execution_latency.median_ms,
            s.execution_latency.p95_ms,
        ));
    }
    report.push('\n');

    let kinds: BTreeSet<&String> = rollups.values().flat_map(|s| s.errors.keys()).collect();
    if kinds.is_empty() {
        report.push_str("## Errors\n\nNo failed pairs.\n");
        return report;
    }

    report.push_str("## Errors\n\n");
    report.push_str("| Kind |");
    for model in rollups.keys() {
        report.push_str(&format!(" {} |", model));
    }
    report.push('\n');
    report.push_str("|------|");
    for _ in rollups.keys() {
        report.push_str("---|");
    }
    report.push('\n');
    for kind in kinds {
        report.push_str(&format!("| {} |", kind));
        for s in rollups.values() {
            report.push_str(&format!(" {} |", s.errors.get(kind).copied().unwrap_or(0)));
        }
        report.push('\n');
    }

    report
}

fn rate(tally: &EngineTally) -> String {
    tally.agreement_rate.map(pct).unwrap_or_else(|| "n/a".into())
}

/// The cross-database section appended after [`format_report`]; empty when
/// no mirror was checked.
pub fn format_agreement(rows: &[AgreementRow]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Cross-Database Agreement\n\n");
    section.push_str(
        "| Database | Mirror | Checks | Gold agree | Candidate agree | Primary only | Mirror only | Unavailable |\n",
    );
    section.push_str(
        "|----------|--------|--------|------------|-----------------|--------------|-------------|-------------|\n",
    );
    for row in rows {
        let s = &row.stat;
        section.push_str(&format!(
            "| {} | {} | {} | {} ({}/{}) | {} ({}/{}) | {} | {} | {} |\n",
            row.database,
            row.mirror,
            s.checks,
            rate(&s.gold),
            s.gold.agree,
            s.gold.compared,
            rate(&s.candidate),
            s.candidate.agree,
            s.candidate.compared,
            s.candidate.primary_only,
            s.candidate.mirror_only,
            s.unavailable,
        ));
    }
    section
}
