//! SQLite backend.
//!
//! Files are opened read-only with `query_only` set. Statements run on the
//! blocking pool; cancellation goes through the connection's interrupt
//! handle, and a progress handler interrupts anything that outlives its time
//! limit in case the cancel never arrives.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use scoring::{ColumnMeta, ColumnSchema, ForeignKey, SchemaDescription, TableSchema, Value};

use super::{Connector, DbError, Dialect, QueryLimits, QueryOutput, SqlConnection};

/// SQLite VM instructions between progress-handler checks.
const PROGRESS_OPS: i32 = 1_000;
/// Slack past the time limit before the progress handler interrupts on its own.
const BACKSTOP_GRACE: Duration = Duration::from_millis(250);

pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>, DbError> {
        let path = self.path.clone();
        let target = self.describe();
        let conn = tokio::task::spawn_blocking(move || SqliteConnection::open(&path))
            .await
            .map_err(|e| DbError::Open {
                target: target.clone(),
                message: e.to_string(),
            })?
            .map_err(|e| DbError::Open {
                target,
                message: e.to_string(),
            })?;
        Ok(Box::new(conn))
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    broken: AtomicBool,
}

impl SqliteConnection {
    /// Open an existing database file read-only.
    pub fn open(path: &std::path::Path) -> rusqlite::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.execute_batch("PRAGMA query_only = ON")?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            broken: AtomicBool::new(false),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| DbError::ConnectionLost("sqlite connection poisoned".into()))?;
            f(&guard)
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(DbError::ConnectionLost(format!("sqlite worker failed: {e}"))),
        };
        if matches!(result, Err(DbError::ConnectionLost(_))) {
            self.broken.store(true, Ordering::Relaxed);
        }
        result
    }
}

fn classify_step(e: rusqlite::Error) -> DbError {
    match e.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => DbError::Interrupted(e.to_string()),
        _ => DbError::Runtime(e.to_string()),
    }
}

fn classify_prepare(e: rusqlite::Error) -> DbError {
    match e.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => DbError::Interrupted(e.to_string()),
        _ => DbError::Syntax(e.to_string()),
    }
}

fn to_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn run_query(conn: &Connection, sql: &str, limits: QueryLimits) -> Result<QueryOutput, DbError> {
    let deadline = Instant::now() + limits.time_limit + BACKSTOP_GRACE;
    conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
    let result = stream_rows(conn, sql, limits.row_limit);
    conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
    result
}

fn stream_rows(conn: &Connection, sql: &str, row_limit: usize) -> Result<QueryOutput, DbError> {
    let mut stmt = conn.prepare(sql).map_err(classify_prepare)?;
    let columns: Vec<ColumnMeta> = stmt
        .column_names()
        .into_iter()
        .map(|name| ColumnMeta::new(name, ""))
        .collect();
    let width = columns.len();

    let mut output = QueryOutput {
        columns,
        ..QueryOutput::default()
    };
    let mut rows = stmt.query([]).map_err(classify_step)?;
    while let Some(row) = rows.next().map_err(classify_step)? {
        output.rows_examined += 1;
        if output.rows.len() >= row_limit {
            output.truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_value(row.get_ref(i).map_err(classify_step)?));
        }
        output.rows.push(values);
    }
    Ok(output)
}

fn read_schema(conn: &Connection, database: &str) -> rusqlite::Result<SchemaDescription> {
    let mut names = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let table_names = names
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut columns = conn.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
    let mut fks = conn.prepare(r#"SELECT "from", "table", "to" FROM pragma_foreign_key_list(?1)"#)?;

    let mut tables = Vec::with_capacity(table_names.len());
    for name in table_names {
        let cols = columns
            .query_map([&name], |row| {
                Ok(ColumnSchema {
                    name: row.get(0)?,
                    data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let foreign_keys = fks
            .query_map([&name], |row| {
                Ok(ForeignKey {
                    column: row.get(0)?,
                    ref_table: row.get(1)?,
                    ref_column: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tables.push(TableSchema {
            name,
            columns: cols,
            foreign_keys,
        });
    }
    Ok(SchemaDescription::new(database, tables))
}

#[async_trait]
impl SqlConnection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&self, sql: &str, limits: QueryLimits) -> Result<QueryOutput, DbError> {
        let sql = sql.to_string();
        self.blocking(move |conn| run_query(conn, &sql, limits)).await
    }

    async fn cancel_in_flight(&self) {
        tracing::debug!("Interrupting sqlite statement");
        self.interrupt.interrupt();
    }

    async fn introspect(&self, database: &str) -> Result<SchemaDescription, DbError> {
        let database = database.to_string();
        self.blocking(move |conn| read_schema(conn, &database).map_err(|e| DbError::Runtime(e.to_string())))
            .await
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}
