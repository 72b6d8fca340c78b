//! Statement execution against a real SQLite file.
//!
//! Tests verify:
//! - equivalent gold and candidate statements compare as a match
//! - write statements are rejected before they reach the engine
//! - a runaway recursive CTE is cut off close to the time limit
//! - the row cap truncates instead of failing

use std::path::PathBuf;
use std::time::{Duration, Instant};

use eval_agent::db::sqlite::SqliteConnector;
use eval_agent::db::{Connector, QueryLimits, SqlConnection};
use eval_agent::executor::execute;
use scoring::{compare, EquivalencePolicy, FailureKind};
use tempfile::TempDir;

fn fixture() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("uni.sqlite");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE program (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE TABLE student (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             program_id INTEGER REFERENCES program(id)
         );
         INSERT INTO program VALUES (1, 'CS'), (2, 'EE');
         INSERT INTO student VALUES
             (1, 'ada', 1), (2, 'grace', 1), (3, 'alan', 2), (4, 'edsger', 2), (5, 'barbara', 1);",
    )
    .unwrap();
    (dir, path)
}

async fn connect(path: &PathBuf) -> Box<dyn SqlConnection> {
    SqliteConnector::new(path.clone()).connect().await.unwrap()
}

fn limits(row_limit: usize, time_limit_ms: u64) -> QueryLimits {
    QueryLimits {
        row_limit,
        time_limit: Duration::from_millis(time_limit_ms),
    }
}

// ── Property: equivalent statements match ──────────────────────────────

#[tokio::test]
async fn equivalent_count_queries_match() {
    let (_dir, path) = fixture();
    let gold_conn = connect(&path).await;
    let cand_conn = connect(&path).await;

    let gold = execute(gold_conn.as_ref(), "SELECT COUNT(*) FROM student", limits(100, 5_000)).await;
    let cand = execute(
        cand_conn.as_ref(),
        "SELECT COUNT(*) FROM student AS s JOIN program AS p ON s.program_id = p.id",
        limits(100, 5_000),
    )
    .await;

    assert!(gold.is_success());
    assert!(compare(&gold, &cand, &EquivalencePolicy::default()).is_match());
}

#[tokio::test]
async fn unordered_gold_ignores_row_order() {
    let (_dir, path) = fixture();
    let conn = connect(&path).await;

    let gold = execute(conn.as_ref(), "SELECT name FROM student", limits(100, 5_000)).await;
    let cand = execute(
        conn.as_ref(),
        "SELECT name FROM student ORDER BY name DESC",
        limits(100, 5_000),
    )
    .await;

    assert!(compare(&gold, &cand, &EquivalencePolicy::default()).is_match());
}

// ── Property: writes never reach the engine ────────────────────────────

#[tokio::test]
async fn delete_is_rejected_and_rows_survive() {
    let (_dir, path) = fixture();
    let conn = connect(&path).await;

    let result = execute(conn.as_ref(), "DELETE FROM student", limits(100, 5_000)).await;
    assert_eq!(result.failure_kind(), Some(FailureKind::Unsafe));

    let check = rusqlite::Connection::open(&path).unwrap();
    let remaining: i64 = check
        .query_row("SELECT COUNT(*) FROM student", [], |row| row.get(0))
        .unwrap();
    assert_eq!(remaining, 5);
}

#[tokio::test]
async fn syntax_errors_are_classified() {
    let (_dir, path) = fixture();
    let conn = connect(&path).await;

    let result = execute(conn.as_ref(), "SELECT nope FROM missing_table", limits(100, 5_000)).await;
    assert_eq!(result.failure_kind(), Some(FailureKind::SyntaxError));
}

// ── Property: time limit is honoured ───────────────────────────────────

#[tokio::test]
async fn runaway_cte_times_out_near_the_limit() {
    let (_dir, path) = fixture();
    let conn = connect(&path).await;
    let runaway = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                   SELECT COUNT(*) FROM c";

    let started = Instant::now();
    let result = execute(conn.as_ref(), runaway, limits(100, 200)).await;
    let elapsed = started.elapsed();

    assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");

    // The interrupted connection is usable again once the engine unwinds.
    let after = execute(conn.as_ref(), "SELECT COUNT(*) FROM student", limits(100, 5_000)).await;
    assert!(after.is_success());
}

// ── Property: row cap truncates ────────────────────────────────────────

#[tokio::test]
async fn row_cap_truncates_result() {
    let (_dir, path) = fixture();
    let conn = connect(&path).await;

    let result = execute(conn.as_ref(), "SELECT * FROM student", limits(2, 5_000)).await;
    let rs = result.as_result_set().unwrap();
    assert!(rs.truncated);
    assert_eq!(rs.rows.len(), 2);
    assert_eq!(rs.columns.len(), 3);
}

#[tokio::test]
async fn introspection_lists_tables_and_keys() {
    let (_dir, path) = fixture();
    let conn = connect(&path).await;

    let schema = conn.introspect("uni").await.unwrap();
    assert_eq!(schema.table_names(), vec!["program".to_string(), "student".to_string()]);
    let student = schema.tables.iter().find(|t| t.name == "student").unwrap();
    assert_eq!(student.foreign_keys.len(), 1);
    assert_eq!(student.foreign_keys[0].ref_table, "program");
}
