//! Result Comparator
//!
//! Decides whether a candidate result set answers the same question as the
//! gold result set. Pure and deterministic: the same two inputs and policy
//! always produce the same [`Comparison`].
//!
//! Rules, applied in order:
//! 1. A failed side short-circuits (gold failure first).
//! 2. Column sets must be equal, names compared case-insensitively. Column
//!    order never matters; columns are aligned by name when both sides
//!    expose names, else by position.
//! 3. Truncation must agree: exactly one side capped is a mismatch. When
//!    both are capped, the captured rows are compared under rule 4.
//! 4. Rows compare positionally when the gold statement has a top-level
//!    `ORDER BY` (or the policy enforces order), otherwise as multisets.
//! 5. Cells compare with a relative numeric tolerance, trailing whitespace
//!    trimmed, `NULL = NULL`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::result_set::{ColumnMeta, ExecutionResult, FailureKind, ResultSet, Value};

/// How row order participates in equivalence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOrder {
    /// Positional when the gold statement orders its output, multiset otherwise.
    #[default]
    FollowGold,
    AlwaysIgnore,
    AlwaysEnforce,
}

/// Configurable rules governing when two result sets are the same answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquivalencePolicy {
    /// Relative tolerance for numeric cells.
    pub float_tolerance: f64,
    /// Compare text case-insensitively.
    pub case_insensitive: bool,
    pub row_order: RowOrder,
    /// Let a numeric-looking text cell equal a numeric cell.
    pub coerce_numeric_text: bool,
    /// Align columns by name when both sides expose names.
    pub match_columns_by_name: bool,
    /// Largest row count for which the pairwise fallback matcher runs.
    pub exhaustive_match_limit: usize,
}

impl Default for EquivalencePolicy {
    fn default() -> Self {
        Self {
            float_tolerance: 1e-6,
            case_insensitive: false,
            row_order: RowOrder::FollowGold,
            coerce_numeric_text: true,
            match_columns_by_name: true,
            exhaustive_match_limit: 2_000,
        }
    }
}

/// Outcome of comparing gold and candidate executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Comparison {
    Match {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Mismatch {
        diagnostic: String,
    },
    GoldFailed {
        kind: FailureKind,
        message: String,
    },
    CandidateFailed {
        kind: FailureKind,
        message: String,
    },
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }

    fn mismatch(diagnostic: impl Into<String>) -> Self {
        Self::Mismatch {
            diagnostic: diagnostic.into(),
        }
    }
}

/// Compare a candidate execution against the gold execution.
pub fn compare(
    gold: &ExecutionResult,
    candidate: &ExecutionResult,
    policy: &EquivalencePolicy,
) -> Comparison {
    match (gold, candidate) {
        (ExecutionResult::Failure { kind, message, .. }, _) => Comparison::GoldFailed {
            kind: *kind,
            message: message.clone(),
        },
        (_, ExecutionResult::Failure { kind, message, .. }) => Comparison::CandidateFailed {
            kind: *kind,
            message: message.clone(),
        },
        (ExecutionResult::Success(g), ExecutionResult::Success(c)) => {
            compare_result_sets(g, c, policy)
        }
    }
}

/// Compare two successful result sets.
pub fn compare_result_sets(
    gold: &ResultSet,
    candidate: &ResultSet,
    policy: &EquivalencePolicy,
) -> Comparison {
    let mapping = match align_columns(&gold.columns, &candidate.columns, policy) {
        Ok(m) => m,
        Err(diagnostic) => return Comparison::mismatch(diagnostic),
    };

    let ordered = match policy.row_order {
        RowOrder::FollowGold => gold.ordered,
        RowOrder::AlwaysIgnore => false,
        RowOrder::AlwaysEnforce => true,
    };

    match (gold.truncated, candidate.truncated) {
        (true, false) => {
            return Comparison::mismatch(format!(
                "gold result truncated at {} rows, candidate returned {}",
                gold.rows.len(),
                candidate.rows.len()
            ))
        }
        (false, true) => {
            return Comparison::mismatch(format!(
                "candidate result truncated at {} rows, gold returned {}",
                candidate.rows.len(),
                gold.rows.len()
            ))
        }
        _ => {}
    }
    let both_truncated = gold.truncated && candidate.truncated;
    let truncation_note = || format!("both results truncated at {} rows", gold.rows.len());

    if gold.rows.len() != candidate.rows.len() {
        return Comparison::mismatch(format!(
            "row count differs: gold {}, candidate {}",
            gold.rows.len(),
            candidate.rows.len()
        ));
    }

    let projected: Vec<Vec<Value>> = candidate
        .rows
        .iter()
        .map(|row| project(row, &mapping))
        .collect();

    let outcome = if ordered {
        compare_ordered(&gold.rows, &projected, policy)
    } else {
        compare_unordered(&gold.rows, &projected, policy)
    };
    // Truncated sides are compared on their captured prefixes only.
    match outcome {
        Ok(()) => Comparison::Match {
            note: both_truncated.then(truncation_note),
        },
        Err(diagnostic) if both_truncated => {
            Comparison::mismatch(format!("{}; {diagnostic}", truncation_note()))
        }
        Err(diagnostic) => Comparison::mismatch(diagnostic),
    }
}

/// Map each gold column index to a candidate column index.
fn align_columns(
    gold: &[ColumnMeta],
    candidate: &[ColumnMeta],
    policy: &EquivalencePolicy,
) -> Result<Vec<usize>, String> {
    let named = |cols: &[ColumnMeta]| cols.iter().all(|c| !c.name.trim().is_empty());
    if policy.match_columns_by_name && named(gold) && named(candidate) {
        let mut used = vec![false; candidate.len()];
        let mut mapping = Vec::with_capacity(gold.len());
        let mut missing = Vec::new();
        for g in gold {
            let wanted = g.name.trim().to_lowercase();
            let found = candidate
                .iter()
                .enumerate()
                .position(|(i, c)| !used[i] && c.name.trim().to_lowercase() == wanted);
            match found {
                Some(i) => {
                    used[i] = true;
                    mapping.push(i);
                }
                None => missing.push(g.name.clone()),
            }
        }
        let extra: Vec<String> = candidate
            .iter()
            .zip(&used)
            .filter(|(_, u)| !**u)
            .map(|(c, _)| c.name.clone())
            .collect();
        if !missing.is_empty() || !extra.is_empty() {
            return Err(format!(
                "column sets differ: missing [{}], unexpected [{}]",
                missing.join(", "),
                extra.join(", ")
            ));
        }
        Ok(mapping)
    } else if gold.len() == candidate.len() {
        Ok((0..gold.len()).collect())
    } else {
        Err(format!(
            "column count differs: gold {}, candidate {}",
            gold.len(),
            candidate.len()
        ))
    }
}

fn project(row: &[Value], mapping: &[usize]) -> Vec<Value> {
    mapping
        .iter()
        .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
        .collect()
}

fn compare_ordered(
    gold: &[Vec<Value>],
    candidate: &[Vec<Value>],
    policy: &EquivalencePolicy,
) -> Result<(), String> {
    for (i, (g, c)) in gold.iter().zip(candidate).enumerate() {
        if !row_values_match(g, c, policy) {
            return Err(format!(
                "row {} differs: gold {}, candidate {}",
                i,
                render_row(g),
                render_row(c)
            ));
        }
    }
    Ok(())
}

fn compare_unordered(
    gold: &[Vec<Value>],
    candidate: &[Vec<Value>],
    policy: &EquivalencePolicy,
) -> Result<(), String> {
    let mut g_sorted: Vec<&Vec<Value>> = gold.iter().collect();
    let mut c_sorted: Vec<&Vec<Value>> = candidate.iter().collect();
    g_sorted.sort_by(|a, b| cmp_rows(a, b, policy));
    c_sorted.sort_by(|a, b| cmp_rows(a, b, policy));

    if g_sorted
        .iter()
        .zip(&c_sorted)
        .all(|(g, c)| row_values_match(g, c, policy))
    {
        return Ok(());
    }

    // Values equal within tolerance can straddle a sort boundary.
    if gold.len() <= policy.exhaustive_match_limit {
        let mut used = vec![false; c_sorted.len()];
        for g in &g_sorted {
            let hit = c_sorted
                .iter()
                .enumerate()
                .position(|(i, c)| !used[i] && row_values_match(g, c, policy));
            match hit {
                Some(i) => used[i] = true,
                None => {
                    return Err(format!(
                        "gold row {} has no counterpart in candidate",
                        render_row(g)
                    ))
                }
            }
        }
        return Ok(());
    }

    let first = g_sorted
        .iter()
        .zip(&c_sorted)
        .find(|(g, c)| !row_values_match(g, c, policy));
    match first {
        Some((g, c)) => Err(format!(
            "sorted rows differ: gold {}, candidate {}",
            render_row(g),
            render_row(c)
        )),
        None => Ok(()),
    }
}

fn row_values_match(a: &[Value], b: &[Value], policy: &EquivalencePolicy) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| value_match(x, y, policy))
}

/// Cell equivalence under the policy.
pub fn value_match(a: &Value, b: &Value, policy: &EquivalencePolicy) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Bool(x), Value::Integer(i)) | (Value::Integer(i), Value::Bool(x)) => {
            *i == i64::from(*x)
        }
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => text_match(x, y, policy),
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Bytes(_), _) | (_, Value::Bytes(_)) => false,
        _ => match (
            a.as_f64(policy.coerce_numeric_text),
            b.as_f64(policy.coerce_numeric_text),
        ) {
            (Some(x), Some(y)) => floats_match(x, y, policy.float_tolerance),
            _ => false,
        },
    }
}

fn text_match(a: &str, b: &str, policy: &EquivalencePolicy) -> bool {
    let (a, b) = (a.trim_end(), b.trim_end());
    if policy.case_insensitive {
        a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

/// Relative-tolerance float equality; NaN equals NaN.
#[allow(clippy::float_cmp)]
pub fn floats_match(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b || (a.is_nan() && b.is_nan()) {
        return true;
    }
    let denom = a.abs().max(b.abs());
    if denom == 0.0 {
        return (a - b).abs() < tolerance;
    }
    ((a - b).abs() / denom) <= tolerance
}

/// Sort rank of a cell: nulls, then numbers, then text, then bytes.
fn cell_rank(v: &Value, policy: &EquivalencePolicy) -> (u8, Option<f64>) {
    match v {
        Value::Null => (0, None),
        Value::Bool(b) => (1, Some(f64::from(u8::from(*b)))),
        Value::Text(s) => match s.trim().parse::<f64>() {
            Ok(f) if policy.coerce_numeric_text => (1, Some(f)),
            _ => (2, None),
        },
        Value::Bytes(_) => (3, None),
        other => (1, other.as_f64(false)),
    }
}

fn cmp_cells(a: &Value, b: &Value, policy: &EquivalencePolicy) -> Ordering {
    let (ra, fa) = cell_rank(a, policy);
    let (rb, fb) = cell_rank(b, policy);
    ra.cmp(&rb).then_with(|| match (a, b) {
        _ if ra == 1 => fa.unwrap_or(f64::NAN).total_cmp(&fb.unwrap_or(f64::NAN)),
        (Value::Text(x), Value::Text(y)) => {
            let (x, y) = (x.trim_end(), y.trim_end());
            if policy.case_insensitive {
                x.to_lowercase().cmp(&y.to_lowercase())
            } else {
                x.cmp(y)
            }
        }
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        _ => Ordering::Equal,
    })
}

fn cmp_rows(a: &[Value], b: &[Value], policy: &EquivalencePolicy) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = cmp_cells(x, y, policy);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn render_row(row: &[Value]) -> String {
    let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
    format!("({})", cells.join(", "))
}
