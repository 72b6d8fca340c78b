//! Benchmark Module
//!
//! Dataset loading, metrics aggregation and report rendering.
//!
//! # Architecture
//!
//! ```text
//! dataset file → load_dataset → BenchmarkItem*
//!                                     ↓
//!                     (orchestrator: one Verdict per item × model)
//!                                     ↓
//!                 MetricsAccumulator::fold  ≡  aggregate(&[Verdict])
//!                                     ↓
//!                 AggregateStat per (model, tier) + per-model roll-up
//!                 AgreementStat per (database, mirror)
//!                                     ↓
//!                               format_report
//! ```

pub mod agreement;
pub mod dataset;
pub mod metrics;
pub mod report;

pub use agreement::{
    aggregate_agreement, engine_outcome, AgreementAccumulator, AgreementKey, AgreementRow,
    AgreementStat, EngineTally,
};
pub use dataset::{load_dataset, parse_jsonl, parse_text2sql, DatasetError, DatasetFormat, DatasetSpec};
pub use metrics::{
    aggregate, nearest_rank, to_rows, wilson_interval, AggregateStat, LatencySummary,
    MetricsAccumulator, StatKey, StatRow,
};
pub use report::{format_agreement, format_report, ReportHeader};
