//! Command-line entry point for the text-to-SQL evaluation harness.
//!
//! # Usage
//!
//! ```bash
//! # Evaluate every configured model on every dataset item
//! eval-agent run --config harness.toml
//!
//! # Smoke-test one model on the first 20 items
//! eval-agent run --config harness.toml --model qwen-local --limit 20
//!
//! # Re-aggregate a finished (or interrupted) run
//! eval-agent aggregate --verdicts results/<run_id>/verdicts.jsonl --markdown
//!
//! # Show the schema text a model would see for a question
//! eval-agent schema --config harness.toml --database advising --question "Which courses..."
//! ```
//!
//! Exit status: 0 when the run completed, 2 when it ended partial, 1 on a
//! fatal error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use eval_agent::adapters::ModelAdapter;
use eval_agent::orchestrator::{check_items, connect_databases, DatabaseHandle};
use eval_agent::telemetry::{
    init_tracing, new_run_id, write_run_outputs, JsonlVerdictWriter, RunPaths, RunSummary,
};
use eval_agent::{HarnessConfig, HarnessError, Orchestrator, RunSettings};
use scoring::benchmark::load_dataset;
use scoring::check_read_only;
use tracing::{info, warn};

const EXIT_PARTIAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate every dataset item against every configured model
    Run {
        /// Path to the harness TOML file
        #[arg(long)]
        config: PathBuf,

        /// Cap the number of dataset items (overrides dataset.limit)
        #[arg(long)]
        limit: Option<usize>,

        /// Only evaluate these model ids (repeatable)
        #[arg(long = "model")]
        models: Vec<String>,

        /// Output directory (overrides run.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Fixed run id (defaults to a timestamped one); must not name an existing run
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Aggregate a verdicts.jsonl file into statistics. Run status comes
    /// from the summary.json beside it when present.
    Aggregate {
        #[arg(long)]
        verdicts: PathBuf,

        /// Print Markdown tables instead of JSON
        #[arg(long, default_value_t = false)]
        markdown: bool,
    },
    /// Print the schema text a model would receive
    Schema {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        database: String,

        /// Rank tables against this question
        #[arg(long)]
        question: Option<String>,

        /// Overrides schema.max_tables
        #[arg(long)]
        max_tables: Option<usize>,
    },
    /// Check whether a statement passes the read-only gate
    CheckSql { sql: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            limit,
            models,
            output,
            run_id,
        } => run(config, limit, models, output, run_id).await,
        Command::Aggregate { verdicts, markdown } => aggregate(verdicts, markdown),
        Command::Schema {
            config,
            database,
            question,
            max_tables,
        } => schema(config, database, question, max_tables).await,
        Command::CheckSql { sql } => Ok(check_sql(&sql)),
    }
}

async fn run(
    config_path: PathBuf,
    limit: Option<usize>,
    models: Vec<String>,
    output: Option<PathBuf>,
    run_id: Option<String>,
) -> Result<ExitCode> {
    let mut config = HarnessConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if limit.is_some() {
        config.dataset.limit = limit;
    }
    if let Some(dir) = output {
        config.run.output_dir = dir;
    }
    config.retain_models(&models)?;
    config.validate()?;

    let items = load_dataset(&config.dataset).map_err(HarnessError::from)?;
    let databases = connect_databases(&config).await?;
    check_items(&items, &databases)?;

    let adapters = config
        .models
        .iter()
        .map(|m| {
            ModelAdapter::from_config(m).map_err(|e| HarnessError::Adapter {
                model: m.id.clone(),
                message: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let started_at = Utc::now();
    let run_id = run_id
        .or_else(|| config.run.run_id.clone())
        .unwrap_or_else(|| new_run_id(started_at));
    let paths = RunPaths::new(&config.run.output_dir, &run_id);
    let mut sink = JsonlVerdictWriter::create(&paths.verdicts())
        .map_err(|e| HarnessError::output(paths.verdicts(), e))?;
    info!(run_id = %run_id, verdicts = %sink.path().display(), "Run initialised");

    let orchestrator = Orchestrator::new(RunSettings::from_config(&config), databases, adapters);
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling remaining pairs");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run(items, &mut sink).await;
    let summary = RunSummary::from_outcome(&run_id, started_at, &outcome);
    write_run_outputs(&paths, &summary)?;

    println!("{}", summary.render_markdown());
    println!("Results written to {}", paths.dir.display());

    if outcome.status.is_completed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PARTIAL))
    }
}

fn aggregate(path: PathBuf, markdown: bool) -> Result<ExitCode> {
    let summary =
        RunSummary::for_stream(&path).with_context(|| format!("reading {}", path.display()))?;
    if markdown {
        println!("{}", summary.render_markdown());
    } else {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(ExitCode::SUCCESS)
}

async fn schema(
    config_path: PathBuf,
    database: String,
    question: Option<String>,
    max_tables: Option<usize>,
) -> Result<ExitCode> {
    let config = HarnessConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let db = config
        .database(&database)
        .with_context(|| format!("database '{database}' is not configured"))?;
    let connector = eval_agent::db::connector_for_url(&db.url)
        .with_context(|| format!("database '{database}'"))?;
    let handle = DatabaseHandle::connect(&db.id, connector, 1).await?;

    let mut settings = RunSettings::from_config(&config);
    if let Some(n) = max_tables {
        settings.max_tables = n;
    }
    let text = match question {
        Some(q) => handle.schema_for(&q, &settings),
        None => handle.schema.render_compact(settings.include_types),
    };
    println!("{text}");
    Ok(ExitCode::SUCCESS)
}

fn check_sql(sql: &str) -> ExitCode {
    match check_read_only(sql) {
        Ok(()) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("rejected: {e}");
            ExitCode::FAILURE
        }
    }
}
