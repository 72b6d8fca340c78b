//! Run telemetry: tracing setup and the on-disk record of a run.
//!
//! Each run writes into `<output_dir>/<run_id>/`:
//! - `verdicts.jsonl`: one verdict per line, appended as pairs finish
//! - `summary.json`: run status plus aggregated statistics
//! - `report.md`: the same statistics as Markdown tables

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use scoring::benchmark::{
    format_agreement, format_report, to_rows, AggregateStat, AgreementRow, MetricsAccumulator,
    ReportHeader, StatKey, StatRow,
};
use scoring::Verdict;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::HarnessError;
use crate::orchestrator::{PairKey, RunOutcome, RunStatus};
use crate::prompts::PROMPT_VERSION;

pub const VERDICTS_FILE: &str = "verdicts.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";
pub const REPORT_FILE: &str = "report.md";

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        warn!("Tracing subscriber already installed");
    }
}

/// `20261019T142233Z-1a2b3c4d`
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Where verdicts go as pairs finish.
pub trait VerdictSink: Send {
    fn record(&mut self, verdict: &Verdict) -> io::Result<()>;
}

impl VerdictSink for Vec<Verdict> {
    fn record(&mut self, verdict: &Verdict) -> io::Result<()> {
        self.push(verdict.clone());
        Ok(())
    }
}

/// JSONL writer for a fresh verdict stream. Each line is flushed so an
/// interrupted run leaves only whole records behind.
pub struct JsonlVerdictWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlVerdictWriter {
    /// Fails with `AlreadyExists` rather than mixing two runs in one file.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VerdictSink for JsonlVerdictWriter {
    fn record(&mut self, verdict: &Verdict) -> io::Result<()> {
        let line = serde_json::to_string(verdict).map_err(io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}

/// Read a verdict stream back. Blank lines are skipped.
pub fn read_verdicts(path: &Path) -> io::Result<Vec<Verdict>> {
    let reader = BufReader::new(File::open(path)?);
    let mut verdicts = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let verdict = serde_json::from_str(&line).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}:{}: {e}", path.display(), idx + 1),
            )
        })?;
        verdicts.push(verdict);
    }
    Ok(verdicts)
}

/// Output locations for one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
}

impl RunPaths {
    pub fn new(output_dir: &Path, run_id: &str) -> Self {
        Self {
            dir: output_dir.join(run_id),
        }
    }

    pub fn verdicts(&self) -> PathBuf {
        self.dir.join(VERDICTS_FILE)
    }

    pub fn summary(&self) -> PathBuf {
        self.dir.join(SUMMARY_FILE)
    }

    pub fn report(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    /// The run directory holding `verdicts`.
    pub fn of_stream(verdicts: &Path) -> Self {
        Self {
            dir: verdicts.parent().map(Path::to_path_buf).unwrap_or_default(),
        }
    }

    pub fn run_id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Contents of `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Prompt layout the candidates were generated with; absent when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(flatten)]
    pub status: RunStatus,
    pub pairs_attempted: u64,
    pub verdicts_recorded: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete_pairs: Vec<PairKey>,
    pub stats: Vec<StatRow>,
    pub model_rollups: BTreeMap<String, AggregateStat>,
    /// Gold and candidate agreement per (database, mirror).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agreement: Vec<AgreementRow>,
}

impl RunSummary {
    pub fn from_outcome(run_id: &str, started_at: DateTime<Utc>, outcome: &RunOutcome) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            prompt_version: Some(PROMPT_VERSION.to_string()),
            status: outcome.status.clone(),
            pairs_attempted: outcome.pairs_attempted,
            verdicts_recorded: outcome.verdicts_recorded,
            incomplete_pairs: outcome.incomplete_pairs.clone(),
            stats: to_rows(&outcome.metrics.finish()),
            model_rollups: outcome.metrics.model_rollups(),
            agreement: outcome.metrics.agreement(),
        }
    }

    /// A summary rebuilt from a verdict stream.
    ///
    /// `recorded` is the summary the run wrote itself. Status and attempted
    /// count come from it; a stream shorter than it claims is partial. With
    /// no recorded summary, completeness cannot be known and the result is
    /// reported partial.
    pub fn from_verdicts(run_id: &str, verdicts: &[Verdict], recorded: Option<&RunSummary>) -> Self {
        let mut metrics = MetricsAccumulator::new();
        for v in verdicts {
            metrics.fold(v);
        }
        let count = metrics.verdict_count();
        let started_at = verdicts
            .iter()
            .map(|v| v.completed_at)
            .min()
            .unwrap_or_else(Utc::now);
        let finished_at = verdicts
            .iter()
            .map(|v| v.completed_at)
            .max()
            .unwrap_or(started_at);

        let mut summary = Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at,
            prompt_version: None,
            status: RunStatus::Partial {
                reason: format!("no {SUMMARY_FILE} for this run; completeness unknown"),
            },
            pairs_attempted: count,
            verdicts_recorded: count,
            incomplete_pairs: Vec::new(),
            stats: to_rows(&metrics.finish()),
            model_rollups: metrics.model_rollups(),
            agreement: metrics.agreement(),
        };
        if let Some(recorded) = recorded {
            summary.run_id = recorded.run_id.clone();
            summary.started_at = recorded.started_at;
            summary.finished_at = recorded.finished_at;
            summary.prompt_version = recorded.prompt_version.clone();
            summary.pairs_attempted = recorded.pairs_attempted;
            summary.incomplete_pairs = recorded.incomplete_pairs.clone();
            summary.status = if count < recorded.pairs_attempted {
                RunStatus::Partial {
                    reason: format!(
                        "verdict stream holds {count} of {} attempted pairs",
                        recorded.pairs_attempted
                    ),
                }
            } else {
                recorded.status.clone()
            };
        }
        summary
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display()))
        })
    }

    /// Re-aggregate a verdict stream, consulting the run's own summary when
    /// it sits next to the stream.
    pub fn for_stream(verdicts_path: &Path) -> io::Result<Self> {
        let verdicts = read_verdicts(verdicts_path)?;
        let paths = RunPaths::of_stream(verdicts_path);
        let recorded = match Self::read(&paths.summary()) {
            Ok(summary) => Some(summary),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable run summary");
                None
            }
        };
        Ok(Self::from_verdicts(&paths.run_id(), &verdicts, recorded.as_ref()))
    }

    pub fn header(&self) -> ReportHeader {
        ReportHeader {
            run_id: self.run_id.clone(),
            status: self.status.to_string(),
            pairs_attempted: self.pairs_attempted,
            verdicts_recorded: self.verdicts_recorded,
        }
    }

    pub fn render_markdown(&self) -> String {
        let stats = self
            .stats
            .iter()
            .map(|row| (StatKey::new(row.model.clone(), row.tier), row.stat.clone()))
            .collect();
        let mut report = format_report(&self.header(), &stats, &self.model_rollups);
        report.push_str(&format_agreement(&self.agreement));
        report
    }
}

/// Write `summary.json` and `report.md` next to the verdict stream.
pub fn write_run_outputs(paths: &RunPaths, summary: &RunSummary) -> Result<(), HarnessError> {
    fs::create_dir_all(&paths.dir).map_err(|e| HarnessError::output(&paths.dir, e))?;

    let summary_path = paths.summary();
    let json = serde_json::to_string_pretty(summary).map_err(io::Error::other);
    json.and_then(|json| fs::write(&summary_path, json))
        .map_err(|e| HarnessError::output(&summary_path, e))?;

    let report_path = paths.report();
    fs::write(&report_path, summary.render_markdown())
        .map_err(|e| HarnessError::output(&report_path, e))?;

    info!(dir = %paths.dir.display(), status = %summary.status, "Run outputs written");
    Ok(())
}
