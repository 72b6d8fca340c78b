//! Evaluation Orchestrator.
//!
//! Drives every (item, model) pair through `Pending → Generating →
//! Executing → Comparing → Done` on a bounded worker pool and streams one
//! verdict per pair to the caller's sink. Pair-level failures, panics
//! included, become verdicts. The run stops early on an explicit
//! cancellation, on the run deadline, or when a database can no longer hand
//! out a single connection; pairs cut short that way are recorded as
//! `cancelled` or `timeout` and the run is reported partial. Statements still
//! running when a pair is cut short are cancelled on the server. Pairs whose
//! database has mirrors re-run both statements on each mirror; the verdict
//! carries the agreement, correctness is judged on the primary alone.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use scoring::benchmark::{engine_outcome, MetricsAccumulator};
use scoring::{
    compare, repair_table_names, BenchmarkItem, Comparison, Correctness, EngineOutcome,
    EquivalencePolicy, ExecutionResult, MirrorCheck, SchemaDescription, Verdict,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::ModelAdapter;
use crate::config::HarnessConfig;
use crate::db::{
    connector_for_url, Connector, ConnectionPool, DbError, Dialect, Lease, QueryLimits,
};
use crate::errors::HarnessError;
use crate::executor::execute;
use crate::prompts::truncate_schema_lines;
use crate::state_machine::{IllegalTransition, PairState, PairStateMachine};
use crate::telemetry::VerdictSink;

/// Progress is logged every this many verdicts.
const PROGRESS_EVERY: u64 = 50;

/// Knobs the orchestrator needs, resolved from [`HarnessConfig`].
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_concurrency: usize,
    pub pair_timeout: Duration,
    pub run_deadline: Option<Duration>,
    pub limits: QueryLimits,
    pub policy: EquivalencePolicy,
    pub max_tables: usize,
    pub include_types: bool,
    pub max_schema_chars: usize,
    pub repair_table_names: bool,
    /// Mirror database ids per primary database id.
    pub mirrors: HashMap<String, Vec<String>>,
}

impl RunSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            max_concurrency: config.run.max_concurrency.max(1),
            pair_timeout: config.pair_timeout(),
            run_deadline: config.run_deadline(),
            limits: QueryLimits {
                row_limit: config.execution.row_limit,
                time_limit: config.time_limit(),
            },
            policy: config.comparison.clone(),
            max_tables: config.schema.max_tables,
            include_types: config.schema.include_types,
            max_schema_chars: config.schema.max_chars,
            repair_table_names: config.execution.repair_table_names,
            mirrors: config.mirrors(),
        }
    }
}

/// A reachable database: its pool plus the schema read at startup.
pub struct DatabaseHandle {
    pub id: String,
    pub pool: ConnectionPool,
    pub schema: SchemaDescription,
    pub dialect: Dialect,
}

impl DatabaseHandle {
    /// Open one connection and introspect. Failing here is fatal to the run.
    pub async fn connect(
        id: &str,
        connector: Arc<dyn Connector>,
        pool_size: usize,
    ) -> Result<Self, HarnessError> {
        let pool = ConnectionPool::new(id, connector, pool_size);
        let unavailable = |source: DbError| HarnessError::DatabaseUnavailable {
            database: id.to_string(),
            source,
        };
        let (schema, dialect) = {
            let lease = pool.checkout(1).await.map_err(unavailable)?;
            let conn = lease.get(0).ok_or_else(|| {
                unavailable(DbError::ConnectionLost("empty lease".into()))
            })?;
            (conn.introspect(id).await.map_err(unavailable)?, conn.dialect())
        };
        if schema.is_empty() {
            return Err(HarnessError::EmptySchema {
                database: id.to_string(),
            });
        }
        info!(
            database = %id,
            dialect = %dialect,
            tables = schema.tables.len(),
            pool_size = pool.size(),
            "Database ready"
        );
        Ok(Self {
            id: id.to_string(),
            pool,
            schema,
            dialect,
        })
    }

    /// The schema text shown to a model for `question`.
    pub fn schema_for(&self, question: &str, settings: &RunSettings) -> String {
        let relevant = self.schema.select_relevant(question, settings.max_tables);
        let rendered = relevant.render_compact(settings.include_types);
        truncate_schema_lines(&rendered, settings.max_schema_chars)
    }
}

/// Connect every configured database; any failure aborts the run.
pub async fn connect_databases(
    config: &HarnessConfig,
) -> Result<HashMap<String, Arc<DatabaseHandle>>, HarnessError> {
    let mut handles = HashMap::new();
    for db in &config.databases {
        let connector = connector_for_url(&db.url).map_err(|source| {
            HarnessError::DatabaseUnavailable {
                database: db.id.clone(),
                source,
            }
        })?;
        let handle = DatabaseHandle::connect(&db.id, connector, config.pool_size_for(db)).await?;
        handles.insert(db.id.clone(), Arc::new(handle));
    }
    Ok(handles)
}

/// Every item must target a configured database.
pub fn check_items(
    items: &[BenchmarkItem],
    databases: &HashMap<String, Arc<DatabaseHandle>>,
) -> Result<(), HarnessError> {
    if items.is_empty() {
        return Err(HarnessError::EmptyDataset);
    }
    for item in items {
        if !databases.contains_key(&item.database) {
            return Err(HarnessError::UnknownDatabase {
                item: item.id.clone(),
                database: item.database.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Partial { reason: String },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial { reason } => write!(f, "partial: {reason}"),
        }
    }
}

/// (item id, model id)
pub type PairKey = (String, String);

pub struct RunOutcome {
    pub status: RunStatus,
    pub pairs_attempted: u64,
    pub verdicts_recorded: u64,
    /// Pairs that did not run to a natural verdict.
    pub incomplete_pairs: Vec<PairKey>,
    pub metrics: MetricsAccumulator,
}

#[derive(Debug, Clone)]
enum StopReason {
    Deadline(Duration),
    Infrastructure(String),
    Cancelled,
}

impl StopReason {
    fn correctness(&self) -> Correctness {
        match self {
            Self::Deadline(_) => Correctness::Timeout,
            Self::Infrastructure(_) | Self::Cancelled => Correctness::Cancelled,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deadline(d) => write!(f, "run deadline of {}s reached", d.as_secs()),
            Self::Infrastructure(msg) => write!(f, "infrastructure failure: {msg}"),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

/// Shared by every pair task.
struct PairContext {
    settings: RunSettings,
    databases: HashMap<String, Arc<DatabaseHandle>>,
    workers: Semaphore,
    stop: CancellationToken,
    stop_reason: Mutex<Option<StopReason>>,
}

impl PairContext {
    fn signal_stop(&self, reason: StopReason) {
        {
            let mut slot = self.stop_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                warn!(reason = %reason, "Stopping run");
                *slot = Some(reason);
            }
        }
        self.stop.cancel();
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reason to record for a pair cut short by the stop token.
    fn effective_stop_reason(&self) -> StopReason {
        self.stop_reason().unwrap_or(StopReason::Cancelled)
    }
}

struct PairReport {
    verdict: Verdict,
    completed: bool,
}

/// Feeds pair reports to the sink and the metrics accumulator.
struct Recorder<'a> {
    sink: &'a mut dyn VerdictSink,
    metrics: MetricsAccumulator,
    seen: HashSet<PairKey>,
    incomplete_pairs: Vec<PairKey>,
    sink_error: Option<String>,
    total: u64,
}

impl<'a> Recorder<'a> {
    fn new(sink: &'a mut dyn VerdictSink, total: u64) -> Self {
        Self {
            sink,
            metrics: MetricsAccumulator::new(),
            seen: HashSet::with_capacity(total as usize),
            incomplete_pairs: Vec::new(),
            sink_error: None,
            total,
        }
    }

    fn has(&self, item_id: &str, model: &str) -> bool {
        self.seen.contains(&(item_id.to_string(), model.to_string()))
    }

    fn record(&mut self, report: PairReport) {
        let v = report.verdict;
        if !self.seen.insert((v.item_id.clone(), v.model.clone())) {
            error!(item = %v.item_id, model = %v.model, "Duplicate verdict dropped");
            return;
        }
        debug!(item = %v.item_id, model = %v.model, correctness = %v.correctness, "Verdict");
        if !report.completed {
            self.incomplete_pairs.push((v.item_id.clone(), v.model.clone()));
        }
        if let Err(e) = self.sink.record(&v) {
            if self.sink_error.is_none() {
                error!(error = %e, "Failed to record verdict");
                self.sink_error = Some(e.to_string());
            }
        }
        self.metrics.fold(&v);
        let n = self.metrics.verdict_count();
        if n % PROGRESS_EVERY == 0 || n == self.total {
            info!(recorded = n, total = self.total, "Progress");
        }
    }
}

pub struct Orchestrator {
    settings: RunSettings,
    databases: HashMap<String, Arc<DatabaseHandle>>,
    models: Vec<Arc<ModelAdapter>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        databases: HashMap<String, Arc<DatabaseHandle>>,
        models: Vec<ModelAdapter>,
    ) -> Self {
        Self {
            settings,
            databases,
            models: models.into_iter().map(Arc::new).collect(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the run; pending pairs become `cancelled`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|m| m.id().to_string()).collect()
    }

    /// Evaluate every item against every model.
    pub async fn run(&self, items: Vec<BenchmarkItem>, sink: &mut dyn VerdictSink) -> RunOutcome {
        let ctx = Arc::new(PairContext {
            settings: self.settings.clone(),
            databases: self.databases.clone(),
            workers: Semaphore::new(self.settings.max_concurrency),
            stop: self.cancel.child_token(),
            stop_reason: Mutex::new(None),
        });

        let deadline_task = self.settings.run_deadline.map(|deadline| {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => ctx.signal_stop(StopReason::Deadline(deadline)),
                    _ = ctx.stop.cancelled() => {}
                }
            })
        });

        let items: Vec<Arc<BenchmarkItem>> = items.into_iter().map(Arc::new).collect();
        let pairs_attempted = (items.len() * self.models.len()) as u64;
        info!(
            items = items.len(),
            models = self.models.len(),
            pairs = pairs_attempted,
            concurrency = self.settings.max_concurrency,
            "Starting evaluation run"
        );

        let (tx, mut rx) = mpsc::channel::<PairReport>(256);
        let mut tasks = JoinSet::new();
        for item in &items {
            for model in &self.models {
                tasks.spawn(pair_task(
                    Arc::clone(&ctx),
                    Arc::clone(item),
                    Arc::clone(model),
                    tx.clone(),
                ));
            }
        }
        drop(tx);

        let mut recorder = Recorder::new(sink, pairs_attempted);
        while let Some(report) = rx.recv().await {
            recorder.record(report);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pair task ended abnormally");
            }
        }
        if let Some(handle) = deadline_task {
            handle.abort();
        }

        // Any pair whose task died without reporting still gets a verdict.
        for item in &items {
            for model in &self.models {
                if recorder.has(&item.id, model.id()) {
                    continue;
                }
                recorder.record(PairReport {
                    verdict: Verdict::bare(
                        &item.id,
                        model.id(),
                        &item.database,
                        item.tier,
                        Correctness::InternalError,
                        "pair task ended without a verdict",
                    ),
                    completed: false,
                });
            }
        }

        let Recorder {
            metrics,
            incomplete_pairs,
            sink_error,
            ..
        } = recorder;
        let status = match (ctx.stop_reason(), self.cancel.is_cancelled(), sink_error) {
            (Some(reason), _, _) => RunStatus::Partial {
                reason: reason.to_string(),
            },
            (None, true, _) => RunStatus::Partial {
                reason: StopReason::Cancelled.to_string(),
            },
            (None, false, Some(e)) => RunStatus::Partial {
                reason: format!("verdict output failed: {e}"),
            },
            (None, false, None) => RunStatus::Completed,
        };
        let verdicts_recorded = metrics.verdict_count();
        info!(
            status = %status,
            attempted = pairs_attempted,
            recorded = verdicts_recorded,
            incomplete = incomplete_pairs.len(),
            "Evaluation run finished"
        );

        RunOutcome {
            status,
            pairs_attempted,
            verdicts_recorded,
            incomplete_pairs,
            metrics,
        }
    }
}

async fn pair_task(
    ctx: Arc<PairContext>,
    item: Arc<BenchmarkItem>,
    model: Arc<ModelAdapter>,
    tx: mpsc::Sender<PairReport>,
) {
    let report = tokio::select! {
        biased;
        _ = ctx.stop.cancelled() => PairReport {
            verdict: stopped_verdict(&ctx, &item, &model),
            completed: false,
        },
        report = guarded_pair(&ctx, &item, &model) => report,
    };
    if tx.send(report).await.is_err() {
        error!(item = %item.id, model = %model.id(), "Verdict channel closed");
    }
}

fn stopped_verdict(ctx: &PairContext, item: &BenchmarkItem, model: &ModelAdapter) -> Verdict {
    let reason = ctx.effective_stop_reason();
    Verdict::bare(
        &item.id,
        model.id(),
        &item.database,
        item.tier,
        reason.correctness(),
        reason.to_string(),
    )
}

/// Wait for a worker slot, then evaluate under the pair timeout with panics
/// turned into `internal_error`.
async fn guarded_pair(ctx: &PairContext, item: &BenchmarkItem, model: &ModelAdapter) -> PairReport {
    let Ok(_slot) = ctx.workers.acquire().await else {
        return PairReport {
            verdict: stopped_verdict(ctx, item, model),
            completed: false,
        };
    };

    let started = Instant::now();
    let work = AssertUnwindSafe(evaluate_pair(ctx, item, model)).catch_unwind();
    let verdict = match tokio::time::timeout(ctx.settings.pair_timeout, work).await {
        Ok(Ok(Ok(verdict))) => verdict,
        Ok(Ok(Err(illegal))) => {
            error!(item = %item.id, model = %model.id(), error = %illegal, "State machine violation");
            Verdict::bare(
                &item.id,
                model.id(),
                &item.database,
                item.tier,
                Correctness::InternalError,
                illegal.to_string(),
            )
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(item = %item.id, model = %model.id(), panic = %message, "Pair evaluation panicked");
            Verdict::bare(
                &item.id,
                model.id(),
                &item.database,
                item.tier,
                Correctness::InternalError,
                format!("panic: {message}"),
            )
        }
        Err(_) => {
            warn!(item = %item.id, model = %model.id(), "Pair timed out");
            let mut v = Verdict::bare(
                &item.id,
                model.id(),
                &item.database,
                item.tier,
                Correctness::Timeout,
                format!("pair exceeded {}s", ctx.settings.pair_timeout.as_secs()),
            );
            v.total_ms = started.elapsed().as_millis() as u64;
            v
        }
    };
    PairReport {
        verdict,
        completed: true,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// The per-pair pipeline. Only a state-machine violation returns `Err`.
async fn evaluate_pair(
    ctx: &PairContext,
    item: &BenchmarkItem,
    model: &ModelAdapter,
) -> Result<Verdict, IllegalTransition> {
    let started = Instant::now();
    let mut sm = PairStateMachine::new(&item.id, model.id());
    let mut verdict = Verdict::bare(
        &item.id,
        model.id(),
        &item.database,
        item.tier,
        Correctness::InternalError,
        "",
    );

    let Some(db) = ctx.databases.get(&item.database) else {
        sm.finish("unknown database")?;
        verdict.diagnostic = format!("database '{}' is not configured", item.database);
        return Ok(verdict);
    };

    // ── Generating ────────────────────────────────────────────────────────
    sm.advance(PairState::Generating, None)?;
    let schema = db.schema_for(&item.question, &ctx.settings);
    let candidate = model
        .generate(&item.id, &item.question, &schema, db.dialect)
        .await;
    verdict.generation_ms = millis(candidate.latency);
    verdict.attempts = candidate.attempts;
    verdict.tokens = candidate.tokens;
    verdict.candidate_sql = candidate.sql.clone();

    if !candidate.is_usable() {
        sm.finish("generation failed")?;
        verdict.correctness = Correctness::CandidateGenerationError;
        verdict.diagnostic = candidate
            .generation_error
            .unwrap_or_else(|| "empty SQL".to_string());
        verdict.total_ms = millis(started.elapsed());
        return Ok(verdict);
    }

    // ── Executing ─────────────────────────────────────────────────────────
    sm.advance(PairState::Executing, None)?;
    let mut sql = candidate.sql;
    let mut notes: Vec<String> = Vec::new();
    if ctx.settings.repair_table_names {
        let (repaired, repairs) = repair_table_names(&sql, &db.schema.table_names());
        if !repairs.is_empty() {
            for r in &repairs {
                notes.push(format!("repaired table {} -> {}", r.from, r.to));
            }
            debug!(item = %item.id, model = %model.id(), repairs = repairs.len(), "Repaired table names");
            sql = repaired;
            verdict.candidate_sql = sql.clone();
        }
    }

    // One connection is enough; gold and candidate then run back to back.
    let lease = match db.pool.checkout_available(2).await {
        Ok(lease) => lease,
        Err(e) => {
            if matches!(e, DbError::Open { .. }) {
                ctx.signal_stop(StopReason::Infrastructure(format!(
                    "database '{}': {e}",
                    db.id
                )));
            }
            sm.finish("no connection")?;
            verdict.correctness = Correctness::Cancelled;
            verdict.diagnostic = format!("could not obtain a connection: {e}");
            verdict.total_ms = millis(started.elapsed());
            return Ok(verdict);
        }
    };
    let runs = run_statements(&lease, &item.gold_sql, &sql, ctx.settings.limits).await;
    drop(lease);
    let Some((gold, cand)) = runs else {
        sm.finish("empty lease")?;
        verdict.diagnostic = "connection lease was empty".into();
        return Ok(verdict);
    };
    verdict.gold_execution_ms = Some(millis(gold.elapsed()));
    verdict.candidate_execution_ms = Some(millis(cand.elapsed()));
    verdict.mirrors = check_mirrors(ctx, db, &item.gold_sql, &sql, &gold, &cand).await;

    // ── Comparing ─────────────────────────────────────────────────────────
    if gold.is_success() && cand.is_success() {
        sm.advance(PairState::Comparing, None)?;
    }
    let comparison = compare(&gold, &cand, &ctx.settings.policy);
    let (correctness, diagnostic) = match comparison {
        Comparison::Match { note } => (Correctness::Match, note.unwrap_or_default()),
        Comparison::Mismatch { diagnostic } => (Correctness::Mismatch, diagnostic),
        Comparison::GoldFailed { kind, message } => (
            Correctness::GoldExecutionError { failure: kind },
            format!("gold {kind}: {message}"),
        ),
        Comparison::CandidateFailed { kind, message } => (
            Correctness::CandidateExecutionError { failure: kind },
            format!("candidate {kind}: {message}"),
        ),
    };
    sm.finish(&correctness.label())?;

    notes.push(diagnostic);
    verdict.correctness = correctness;
    verdict.diagnostic = notes
        .into_iter()
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    verdict.total_ms = millis(started.elapsed());
    debug!(item = %item.id, model = %model.id(), history = %sm.summary(), "Pair done");
    Ok(verdict)
}

/// Gold and candidate on one lease: concurrently on two connections, back
/// to back on one. The lease is marked in flight while they run.
async fn run_statements(
    lease: &Lease,
    gold_sql: &str,
    sql: &str,
    limits: QueryLimits,
) -> Option<(ExecutionResult, ExecutionResult)> {
    let (first, second) = lease.pair()?;
    lease.set_in_flight(true);
    let runs = match second {
        Some(second) => tokio::join!(execute(first, gold_sql, limits), execute(second, sql, limits)),
        None => {
            let gold = execute(first, gold_sql, limits).await;
            (gold, execute(first, sql, limits).await)
        }
    };
    lease.set_in_flight(false);
    Some(runs)
}

/// Re-run the pair's statements on every mirror of `db`. A mirror that
/// cannot serve the pair is recorded as unavailable and never stops the run.
async fn check_mirrors(
    ctx: &PairContext,
    db: &DatabaseHandle,
    gold_sql: &str,
    sql: &str,
    gold: &ExecutionResult,
    cand: &ExecutionResult,
) -> Vec<MirrorCheck> {
    let Some(ids) = ctx.settings.mirrors.get(&db.id) else {
        return Vec::new();
    };
    let mut checks = Vec::with_capacity(ids.len());
    for id in ids {
        let unavailable = |diagnostic: String| MirrorCheck {
            database: id.clone(),
            gold: EngineOutcome::Unavailable,
            candidate: EngineOutcome::Unavailable,
            candidate_execution_ms: None,
            diagnostic,
        };
        let Some(mirror) = ctx.databases.get(id) else {
            checks.push(unavailable("mirror is not connected".into()));
            continue;
        };
        let lease = match mirror.pool.checkout_available(2).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(database = %db.id, mirror = %id, error = %e, "Mirror unavailable");
                checks.push(unavailable(format!("could not obtain a connection: {e}")));
                continue;
            }
        };
        let runs = run_statements(&lease, gold_sql, sql, ctx.settings.limits).await;
        drop(lease);
        let Some((mirror_gold, mirror_cand)) = runs else {
            checks.push(unavailable("connection lease was empty".into()));
            continue;
        };

        let (gold_outcome, gold_note) = engine_outcome(gold, &mirror_gold, &ctx.settings.policy);
        let (cand_outcome, cand_note) = engine_outcome(cand, &mirror_cand, &ctx.settings.policy);
        let diagnostic = [("gold", gold_note), ("candidate", cand_note)]
            .into_iter()
            .filter(|(_, note)| !note.is_empty())
            .map(|(role, note)| format!("{role}: {note}"))
            .collect::<Vec<_>>()
            .join("; ");
        debug!(database = %db.id, mirror = %id, gold = ?gold_outcome, candidate = ?cand_outcome, "Mirror checked");
        checks.push(MirrorCheck {
            database: id.clone(),
            gold: gold_outcome,
            candidate: cand_outcome,
            candidate_execution_ms: Some(millis(mirror_cand.elapsed())),
            diagnostic,
        });
    }
    checks
}
