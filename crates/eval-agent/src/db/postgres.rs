//! PostgreSQL backend.
//!
//! Each connection is a session with `default_transaction_read_only = on`.
//! A statement runs inside its own transaction through an unnamed portal so
//! the server produces at most `row_limit + 1` rows. The transaction sets
//! `statement_timeout` slightly past the time limit so the server stops a
//! statement even if the client never sends a cancel. Cancellation sends a
//! server-side cancel request and retires the session.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use scoring::{ColumnMeta, ForeignKey, SchemaDescription, TableSchema, Value};
use tokio::sync::Mutex;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls};

use super::{redact_url, Connector, DbError, Dialect, QueryLimits, QueryOutput, SqlConnection};

type BoxError = Box<dyn StdError + Sync + Send>;

/// Slack past the time limit before the server cancels on its own.
const BACKSTOP_GRACE: Duration = Duration::from_millis(250);

fn statement_timeout_sql(limits: QueryLimits) -> String {
    let ms = limits.time_limit.saturating_add(BACKSTOP_GRACE).as_millis();
    format!("SET LOCAL statement_timeout = {ms}")
}

pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>, DbError> {
        let open_err = |e: tokio_postgres::Error| DbError::Open {
            target: self.describe(),
            message: e.to_string(),
        };
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(open_err)?;

        let broken = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&broken);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "Postgres connection closed");
            }
            flag.store(true, Ordering::Relaxed);
        });

        client
            .batch_execute("SET default_transaction_read_only = on")
            .await
            .map_err(open_err)?;

        Ok(Box::new(PostgresConnection {
            cancel: client.cancel_token(),
            client: Mutex::new(client),
            broken,
        }))
    }

    fn describe(&self) -> String {
        redact_url(&self.url)
    }
}

pub struct PostgresConnection {
    client: Mutex<Client>,
    cancel: CancelToken,
    broken: Arc<AtomicBool>,
}

#[derive(Clone, Copy)]
enum Phase {
    Prepare,
    Step,
}

fn classify(e: tokio_postgres::Error, phase: Phase) -> DbError {
    if e.is_closed() {
        return DbError::ConnectionLost(e.to_string());
    }
    let message = match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    };
    match e.code().map(|c| c.code()) {
        // query_canceled
        Some("57014") => DbError::Interrupted(message),
        Some(code) if code.starts_with("08") => DbError::ConnectionLost(message),
        Some(code) if code.starts_with("42") => DbError::Syntax(message),
        Some(_) => match phase {
            Phase::Prepare => DbError::Syntax(message),
            Phase::Step => DbError::Runtime(message),
        },
        None => DbError::ConnectionLost(message),
    }
}

impl PostgresConnection {
    async fn run(&self, sql: &str, limits: QueryLimits) -> Result<QueryOutput, DbError> {
        let mut client = self.client.lock().await;
        let txn = client
            .transaction()
            .await
            .map_err(|e| classify(e, Phase::Step))?;
        txn.batch_execute(&statement_timeout_sql(limits))
            .await
            .map_err(|e| classify(e, Phase::Step))?;
        let stmt = txn.prepare(sql).await.map_err(|e| classify(e, Phase::Prepare))?;
        let columns: Vec<ColumnMeta> = stmt
            .columns()
            .iter()
            .map(|c| ColumnMeta::new(c.name(), c.type_().name()))
            .collect();

        let portal = txn
            .bind(&stmt, &[])
            .await
            .map_err(|e| classify(e, Phase::Step))?;
        let fetch = i32::try_from(limits.row_limit.saturating_add(1)).unwrap_or(i32::MAX);
        let rows = txn
            .query_portal(&portal, fetch)
            .await
            .map_err(|e| classify(e, Phase::Step))?;

        let mut output = QueryOutput {
            columns,
            ..QueryOutput::default()
        };
        for row in &rows {
            output.rows_examined += 1;
            if output.rows.len() >= limits.row_limit {
                output.truncated = true;
                break;
            }
            let mut values = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                let scalar: PgScalar = row
                    .try_get(i)
                    .map_err(|e| DbError::Runtime(format!("column {i}: {e}")))?;
                values.push(scalar.0);
            }
            output.rows.push(values);
        }
        txn.rollback().await.map_err(|e| classify(e, Phase::Step))?;
        Ok(output)
    }

    async fn read_schema(&self, database: &str) -> Result<SchemaDescription, tokio_postgres::Error> {
        let client = self.client.lock().await;
        let column_rows = client
            .query(
                "SELECT table_name::text, column_name::text, data_type::text \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() \
                 ORDER BY table_name, ordinal_position",
                &[],
            )
            .await?;
        let fk_rows = client
            .query(
                "SELECT kcu.table_name::text, kcu.column_name::text, \
                        ccu.table_name::text, ccu.column_name::text \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON tc.constraint_name = ccu.constraint_name \
                  AND tc.table_schema = ccu.table_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema = current_schema()",
                &[],
            )
            .await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in &column_rows {
            let table: String = row.try_get(0)?;
            let column: String = row.try_get(1)?;
            let data_type: String = row.try_get(2)?;
            if tables.last().map(|t| t.name != table).unwrap_or(true) {
                tables.push(TableSchema::new(table.clone(), &[]));
            }
            if let Some(t) = tables.last_mut() {
                t.columns.push(scoring::ColumnSchema {
                    name: column,
                    data_type,
                });
            }
        }
        for row in &fk_rows {
            let table: String = row.try_get(0)?;
            if let Some(t) = tables.iter_mut().find(|t| t.name == table) {
                t.foreign_keys.push(ForeignKey {
                    column: row.try_get(1)?,
                    ref_table: row.try_get(2)?,
                    ref_column: row.try_get(3)?,
                });
            }
        }
        Ok(SchemaDescription::new(database, tables))
    }
}

#[async_trait]
impl SqlConnection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&self, sql: &str, limits: QueryLimits) -> Result<QueryOutput, DbError> {
        let result = self.run(sql, limits).await;
        if matches!(result, Err(DbError::ConnectionLost(_))) {
            self.broken.store(true, Ordering::Relaxed);
        }
        result
    }

    async fn cancel_in_flight(&self) {
        if let Err(e) = self.cancel.cancel_query(NoTls).await {
            tracing::warn!(error = %e, "Postgres cancel request failed");
        }
        // A late cancel could hit the next statement; retire the session.
        self.broken.store(true, Ordering::Relaxed);
    }

    async fn introspect(&self, database: &str) -> Result<SchemaDescription, DbError> {
        self.read_schema(database)
            .await
            .map_err(|e| classify(e, Phase::Step))
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}

/// Any column value, decoded by its wire type.
struct PgScalar(Value);

impl<'a> FromSql<'a> for PgScalar {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let value = match *ty {
            Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => Value::Integer(i16::from_sql(ty, raw)? as i64),
            Type::INT4 => Value::Integer(i32::from_sql(ty, raw)? as i64),
            Type::INT8 => Value::Integer(i64::from_sql(ty, raw)?),
            Type::OID => Value::Integer(u32::from_sql(ty, raw)? as i64),
            Type::FLOAT4 => Value::Real(f32::from_sql(ty, raw)? as f64),
            Type::FLOAT8 => Value::Real(f64::from_sql(ty, raw)?),
            Type::NUMERIC => Value::Decimal(decode_numeric(raw)?),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                Value::Text(String::from_sql(ty, raw)?)
            }
            Type::BYTEA => Value::Bytes(Vec::<u8>::from_sql(ty, raw)?),
            Type::DATE => Value::Text(NaiveDate::from_sql(ty, raw)?.to_string()),
            Type::TIME => Value::Text(NaiveTime::from_sql(ty, raw)?.to_string()),
            Type::TIMESTAMP => Value::Text(NaiveDateTime::from_sql(ty, raw)?.to_string()),
            Type::TIMESTAMPTZ => Value::Text(DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339()),
            Type::UUID => Value::Text(uuid::Uuid::from_sql(ty, raw)?.to_string()),
            Type::JSON | Type::JSONB => {
                Value::Text(serde_json::Value::from_sql(ty, raw)?.to_string())
            }
            _ => Value::Bytes(raw.to_vec()),
        };
        Ok(Self(value))
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Self(Value::Null))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the binary NUMERIC format (base-10000 digit groups) to text.
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    let dscale = word(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }
    if raw.len() < 8 + 2 * ndigits {
        return Err("numeric digit groups truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + 2 * i)).collect();
    let group = |idx: i32| -> u16 {
        if idx < 0 {
            0
        } else {
            digits.get(idx as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                out.push_str(&group(idx).to_string());
            } else {
                out.push_str(&format!("{:04}", group(idx)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}
