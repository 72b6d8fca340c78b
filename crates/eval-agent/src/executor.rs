//! Query Executor.
//!
//! Runs one statement on a caller-owned connection under a row and time
//! budget. Never opens or closes connections and never returns `Err`: every
//! outcome is an [`ExecutionResult`].

use std::time::Duration;

use scoring::{check_read_only, has_top_level_order_by, ExecutionResult, FailureKind, ResultSet};
use tokio::time::Instant;

use crate::db::{QueryLimits, SqlConnection};

/// Cap on how long a cancel request may delay the timeout result.
const CANCEL_GRACE: Duration = Duration::from_millis(200);

pub async fn execute(conn: &dyn SqlConnection, sql: &str, limits: QueryLimits) -> ExecutionResult {
    let started = Instant::now();

    if let Err(e) = check_read_only(sql) {
        tracing::debug!(error = %e, "Rejected statement");
        return ExecutionResult::failure(FailureKind::Unsafe, e.to_string(), started.elapsed());
    }

    match tokio::time::timeout(limits.time_limit, conn.query(sql, limits)).await {
        Ok(Ok(output)) => {
            let rs = ResultSet {
                columns: output.columns,
                rows: output.rows,
                elapsed: started.elapsed(),
                rows_examined: output.rows_examined,
                truncated: output.truncated,
                ordered: has_top_level_order_by(sql),
            };
            ExecutionResult::Success(rs)
        }
        Ok(Err(e)) => ExecutionResult::failure(e.failure_kind(), e.to_string(), started.elapsed()),
        Err(_) => {
            if tokio::time::timeout(CANCEL_GRACE, conn.cancel_in_flight())
                .await
                .is_err()
            {
                tracing::warn!(dialect = %conn.dialect(), "Cancel request did not complete in time");
            }
            ExecutionResult::failure(
                FailureKind::Timeout,
                format!("statement exceeded {}ms", limits.time_limit.as_millis()),
                started.elapsed(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbError, Dialect, MockSqlConnection, QueryOutput};
    use scoring::{ColumnMeta, SchemaDescription, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn limits() -> QueryLimits {
        QueryLimits {
            row_limit: 100,
            time_limit: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_unsafe_statement_never_reaches_connection() {
        let mut conn = MockSqlConnection::new();
        conn.expect_query().never();
        let result = execute(&conn, "DELETE FROM student", limits()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Unsafe));
    }

    #[tokio::test]
    async fn test_success_records_ordering_and_truncation() {
        let mut conn = MockSqlConnection::new();
        conn.expect_query().times(1).returning(|_, _| {
            Ok(QueryOutput {
                columns: vec![ColumnMeta::new("n", "int8")],
                rows: vec![vec![Value::Integer(1)]],
                rows_examined: 2,
                truncated: true,
            })
        });
        let result = execute(&conn, "SELECT n FROM t ORDER BY n", limits()).await;
        let rs = result.as_result_set().unwrap();
        assert!(rs.ordered);
        assert!(rs.truncated);
        assert_eq!(rs.rows_examined, 2);
    }

    #[tokio::test]
    async fn test_connection_loss_is_classified() {
        let mut conn = MockSqlConnection::new();
        conn.expect_query()
            .returning(|_, _| Err(DbError::ConnectionLost("server closed the connection".into())));
        let result = execute(&conn, "SELECT 1", limits()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ConnectionLost));
        match result {
            ExecutionResult::Failure { message, .. } => assert!(message.contains("server closed")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_syntax_error_is_classified() {
        let mut conn = MockSqlConnection::new();
        conn.expect_query()
            .returning(|_, _| Err(DbError::Syntax("no such column: nope".into())));
        let result = execute(&conn, "SELECT nope FROM t", limits()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::SyntaxError));
    }

    /// Connection whose statements never finish until cancelled.
    struct Hanging {
        cancelled: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SqlConnection for Hanging {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        async fn query(&self, _sql: &str, _limits: QueryLimits) -> Result<QueryOutput, DbError> {
            std::future::pending().await
        }
        async fn cancel_in_flight(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        async fn introspect(&self, database: &str) -> Result<SchemaDescription, DbError> {
            Ok(SchemaDescription::new(database, vec![]))
        }
        fn is_broken(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_in_flight_statement() {
        let conn = Hanging {
            cancelled: AtomicBool::new(false),
        };
        let result = execute(&conn, "SELECT * FROM a, b, c", limits()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert!(conn.cancelled.load(Ordering::SeqCst));
        assert!(result.elapsed() >= Duration::from_millis(500));
        assert!(result.elapsed() <= Duration::from_millis(500) + CANCEL_GRACE);
    }
}
