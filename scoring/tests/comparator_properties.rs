//! Comparator property tests: deterministic pseudo-random result sets
//! checked against the equivalence invariants.
//!
//! Tests verify:
//! - Reflexivity: any result set matches itself
//! - Row permutations do not matter without a top-level ORDER BY
//! - Row permutations do matter with one
//! - Numeric drift inside the tolerance matches, outside it does not
//! - Column permutations never matter
//! - Comparison is deterministic

use scoring::{
    check_read_only, compare, has_top_level_order_by, ColumnMeta, Comparison, EquivalencePolicy,
    ExecutionResult, ResultSet, Value,
};

/// Small deterministic generator (64-bit LCG).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn random_value(rng: &mut Lcg, column: usize) -> Value {
    match column % 4 {
        0 => Value::Integer(rng.below(50) as i64),
        1 => Value::Real(rng.below(10_000) as f64 / 7.0),
        2 => Value::Text(format!("name-{}", rng.below(20))),
        _ => {
            if rng.below(5) == 0 {
                Value::Null
            } else {
                Value::Decimal(format!("{}.25", rng.below(100)))
            }
        }
    }
}

fn random_result_set(seed: u64, rows: usize, cols: usize) -> ResultSet {
    let mut rng = Lcg(seed);
    let columns = (0..cols)
        .map(|c| ColumnMeta::new(format!("c{c}"), ""))
        .collect();
    let data = (0..rows)
        .map(|_| (0..cols).map(|c| random_value(&mut rng, c)).collect())
        .collect();
    ResultSet::new(columns, data)
}

/// Fisher-Yates shuffle driven by the LCG.
fn shuffled<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
    let mut rng = Lcg(seed);
    let mut out = items.to_vec();
    for i in (1..out.len()).rev() {
        let j = rng.below(i as u64 + 1) as usize;
        out.swap(i, j);
    }
    out
}

fn ok(rs: ResultSet) -> ExecutionResult {
    ExecutionResult::Success(rs)
}

// ── Property: reflexivity ──────────────────────────────────────────

#[test]
fn prop_every_result_set_matches_itself() {
    let policy = EquivalencePolicy::default();
    for seed in 0..50 {
        let rs = random_result_set(seed, (seed % 12) as usize, 1 + (seed % 4) as usize);
        for ordered in [false, true] {
            let r = ok(rs.clone().ordered(ordered));
            assert!(
                compare(&r, &r, &policy).is_match(),
                "seed {seed} ordered {ordered} not reflexive"
            );
        }
    }
}

// ── Property: row order without ORDER BY ───────────────────────────

#[test]
fn prop_row_permutation_is_ignored_when_unordered() {
    let policy = EquivalencePolicy::default();
    for seed in 0..50 {
        let gold = random_result_set(seed, 10, 4);
        let mut cand = gold.clone();
        cand.rows = shuffled(&gold.rows, seed + 1000);
        assert!(
            compare(&ok(gold), &ok(cand), &policy).is_match(),
            "seed {seed}: permuted rows should match"
        );
    }
}

// ── Property: row order with ORDER BY ──────────────────────────────

#[test]
fn prop_row_permutation_is_significant_when_ordered() {
    let policy = EquivalencePolicy::default();
    let sql = "SELECT c0, c1 FROM t ORDER BY c0";
    assert!(has_top_level_order_by(sql));

    let gold = ResultSet::new(
        vec![ColumnMeta::new("c0", ""), ColumnMeta::new("c1", "")],
        (0..8)
            .map(|i| vec![Value::Integer(i), Value::Text(format!("row{i}"))])
            .collect(),
    )
    .ordered(true);
    let mut reversed = gold.clone();
    reversed.rows.reverse();

    match compare(&ok(gold.clone()), &ok(reversed), &policy) {
        Comparison::Mismatch { diagnostic } => assert!(diagnostic.contains("row 0")),
        other => panic!("expected mismatch, got {other:?}"),
    }
    assert!(compare(&ok(gold.clone()), &ok(gold), &policy).is_match());
}

// ── Property: numeric tolerance ────────────────────────────────────

#[test]
fn prop_float_drift_within_tolerance_matches() {
    let policy = EquivalencePolicy::default();
    for seed in 0..30 {
        let gold = random_result_set(seed, 6, 2);
        let mut inside = gold.clone();
        let mut outside = gold.clone();
        for row in inside.rows.iter_mut() {
            if let Value::Real(f) = row[1] {
                row[1] = Value::Real(f * (1.0 + 5e-7));
            }
        }
        let mut drifted = false;
        for row in outside.rows.iter_mut() {
            if let Value::Real(f) = row[1] {
                if f != 0.0 {
                    row[1] = Value::Real(f * (1.0 + 1e-4));
                    drifted = true;
                }
            }
        }
        assert!(
            compare(&ok(gold.clone()), &ok(inside), &policy).is_match(),
            "seed {seed}: drift within 1e-6 should match"
        );
        if drifted {
            assert!(
                !compare(&ok(gold), &ok(outside), &policy).is_match(),
                "seed {seed}: drift beyond tolerance should mismatch"
            );
        }
    }
}

// ── Property: column order never matters ───────────────────────────

#[test]
fn prop_column_permutation_is_ignored() {
    let policy = EquivalencePolicy::default();
    for seed in 0..30 {
        let gold = random_result_set(seed, 5, 4);
        let perm = shuffled(&[0usize, 1, 2, 3], seed + 7);
        let cand = ResultSet::new(
            perm.iter().map(|&i| gold.columns[i].clone()).collect(),
            gold.rows
                .iter()
                .map(|row| perm.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        );
        for ordered in [false, true] {
            let g = gold.clone().ordered(ordered);
            assert!(
                compare(&ok(g), &ok(cand.clone()), &policy).is_match(),
                "seed {seed}: column permutation {perm:?} should match"
            );
        }
    }
}

// ── Property: determinism ──────────────────────────────────────────

#[test]
fn prop_comparison_is_deterministic() {
    let policy = EquivalencePolicy::default();
    for seed in 0..20 {
        let gold = ok(random_result_set(seed, 7, 3));
        let cand = ok(random_result_set(seed + 1, 7, 3));
        let first = compare(&gold, &cand, &policy);
        for _ in 0..3 {
            assert_eq!(compare(&gold, &cand, &policy), first);
        }
    }
}

// ── Worked example: equivalent COUNT with different spacing ────────

#[test]
fn count_query_with_different_formatting_matches() {
    let gold_sql = "SELECT COUNT(*) FROM STUDENT WHERE program_id=5";
    let cand_sql = "SELECT COUNT(*) FROM STUDENT WHERE program_id = 5;";
    assert!(check_read_only(gold_sql).is_ok());
    assert!(check_read_only(cand_sql).is_ok());

    let row = |sql: &str| {
        ok(ResultSet::new(vec![ColumnMeta::new("COUNT(*)", "")], vec![vec![Value::Integer(42)]])
            .ordered(has_top_level_order_by(sql)))
    };
    assert!(compare(&row(gold_sql), &row(cand_sql), &EquivalencePolicy::default()).is_match());
}
