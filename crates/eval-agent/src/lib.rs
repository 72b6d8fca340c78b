//! Evaluation agent: runs text-to-SQL candidates from several models against
//! live databases and scores them against gold queries.
//!
//! The deterministic scoring core lives in the `scoring` crate. This crate
//! owns everything that touches the outside world:
//!
//! - [`db`]: read-only connections, pooling and schema introspection
//! - [`executor`]: bounded, cancellable statement execution
//! - [`adapters`]: model backends with retry and rate limiting
//! - [`orchestrator`]: the item × model run and its per-pair state machine
//! - [`telemetry`]: tracing setup and run outputs

pub mod adapters;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod orchestrator;
pub mod prompts;
pub mod state_machine;
pub mod telemetry;

pub use config::HarnessConfig;
pub use errors::HarnessError;
pub use orchestrator::{Orchestrator, RunOutcome, RunSettings, RunStatus};
