//! Run-level errors.
//!
//! Everything that goes wrong inside one (item, model) pair is folded into
//! that pair's verdict. Only the failures below abort a run before pairs are
//! attempted or stop the binary from writing its outputs.

use std::path::PathBuf;

use scoring::benchmark::DatasetError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("dataset is empty after filtering")]
    EmptyDataset,

    /// A dataset item targets a database the config does not declare.
    #[error("item '{item}' targets unknown database '{database}'")]
    UnknownDatabase { item: String, database: String },

    /// Infrastructure pre-check failed: no connection or no schema.
    #[error("database '{database}' is unavailable: {source}")]
    DatabaseUnavailable {
        database: String,
        #[source]
        source: DbError,
    },

    #[error("database '{database}' exposes no tables")]
    EmptySchema { database: String },

    #[error("model '{model}' could not be initialised: {message}")]
    Adapter { model: String, message: String },

    #[error("failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Output {
            path: path.into(),
            source,
        }
    }
}
