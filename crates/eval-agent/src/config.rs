//! Harness configuration.
//!
//! Loaded from a TOML file, then overridden from `EVAL_*` environment
//! variables, then from CLI flags (applied by the binary). Every field has a
//! default so a minimal file only lists databases and models.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use scoring::benchmark::DatasetSpec;
use scoring::EquivalencePolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_MAX_CONCURRENCY: &str = "EVAL_MAX_CONCURRENCY";
const ENV_ROW_LIMIT: &str = "EVAL_ROW_LIMIT";
const ENV_TIME_LIMIT_MS: &str = "EVAL_TIME_LIMIT_MS";
const ENV_OUTPUT_DIR: &str = "EVAL_OUTPUT_DIR";
const ENV_RUN_DEADLINE_SECS: &str = "EVAL_RUN_DEADLINE_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunConfig,
    pub execution: ExecutionConfig,
    pub comparison: EquivalencePolicy,
    pub dataset: DatasetSpec,
    pub schema: SchemaConfig,
    pub databases: Vec<DatabaseConfig>,
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run directory name; a timestamped id is generated when unset.
    pub run_id: Option<String>,
    pub output_dir: PathBuf,
    /// Upper bound on pairs evaluated at once.
    pub max_concurrency: usize,
    /// Budget for one (item, model) pair from generation to verdict.
    pub pair_timeout_secs: u64,
    /// Global deadline; pairs still running when it expires become `timeout`.
    pub run_deadline_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            output_dir: PathBuf::from("results"),
            max_concurrency: 8,
            pair_timeout_secs: 300,
            run_deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub row_limit: usize,
    pub time_limit_ms: u64,
    /// Default pool size for databases that do not set their own.
    pub pool_size: usize,
    /// Rewrite near-miss table names in candidates before execution.
    pub repair_table_names: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            row_limit: 10_000,
            time_limit_ms: 30_000,
            pool_size: 4,
            repair_table_names: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Tables shown to the model per question; 0 shows the whole schema.
    pub max_tables: usize,
    pub include_types: bool,
    /// Character budget for the rendered schema; 0 is unlimited.
    pub max_chars: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            max_tables: 12,
            include_types: true,
            max_chars: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub id: String,
    /// `postgres://...`, `postgresql://...` or `sqlite://path`.
    pub url: String,
    #[serde(default)]
    pub pool_size: Option<usize>,
    /// Id of a database holding the same data. Pairs on that database
    /// re-run gold and candidate here to measure cross-database agreement.
    #[serde(default)]
    pub mirror_of: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local model server speaking the `/chat/completions` protocol.
    OpenaiCompatible,
    /// Hosted Messages API.
    Anthropic,
    /// Pre-recorded candidates keyed by item id.
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomised in both directions, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Remote model name; defaults to `id`.
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key. Keys never live in the file.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    /// Per-request deadline.
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_in_flight() -> usize {
    4
}

impl ModelConfig {
    pub fn remote_model(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.id)
    }

    /// Resolve the API key from the named environment variable.
    pub fn api_key(&self) -> Result<Option<String>, ConfigError> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.is_empty() => Ok(Some(key)),
                _ => Err(ConfigError::Invalid(format!(
                    "model '{}' expects an API key in ${var}, which is unset",
                    self.id
                ))),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HarnessConfig {
    /// Read, parse and apply environment overrides. Validation is left to
    /// the caller so CLI overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse(ENV_MAX_CONCURRENCY)? {
            self.run.max_concurrency = v;
        }
        if let Some(v) = env_parse(ENV_ROW_LIMIT)? {
            self.execution.row_limit = v;
        }
        if let Some(v) = env_parse(ENV_TIME_LIMIT_MS)? {
            self.execution.time_limit_ms = v;
        }
        if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR) {
            if !dir.is_empty() {
                self.run.output_dir = PathBuf::from(dir);
            }
        }
        if let Some(v) = env_parse(ENV_RUN_DEADLINE_SECS)? {
            self.run.run_deadline_secs = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases.is_empty() {
            return Err(ConfigError::Invalid("no [[databases]] configured".into()));
        }
        if self.models.is_empty() {
            return Err(ConfigError::Invalid("no [[models]] configured".into()));
        }
        if self.run.max_concurrency == 0 {
            return Err(ConfigError::Invalid("run.max_concurrency must be > 0".into()));
        }
        if self.run.pair_timeout_secs == 0 {
            return Err(ConfigError::Invalid("run.pair_timeout_secs must be > 0".into()));
        }
        if self.execution.row_limit == 0 {
            return Err(ConfigError::Invalid("execution.row_limit must be > 0".into()));
        }
        if self.execution.time_limit_ms == 0 {
            return Err(ConfigError::Invalid("execution.time_limit_ms must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for db in &self.databases {
            if !seen.insert(db.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate database id '{}'", db.id)));
            }
            if db.pool_size == Some(0) || (db.pool_size.is_none() && self.execution.pool_size == 0)
            {
                return Err(ConfigError::Invalid(format!(
                    "database '{}' has a zero pool size",
                    db.id
                )));
            }
        }
        for db in &self.databases {
            let Some(primary) = db.mirror_of.as_deref() else {
                continue;
            };
            match self.database(primary) {
                _ if primary == db.id => {
                    return Err(ConfigError::Invalid(format!(
                        "database '{}' cannot mirror itself",
                        db.id
                    )));
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "database '{}' mirrors unknown database '{primary}'",
                        db.id
                    )));
                }
                Some(target) if target.mirror_of.is_some() => {
                    return Err(ConfigError::Invalid(format!(
                        "database '{}' mirrors '{primary}', which is itself a mirror",
                        db.id
                    )));
                }
                Some(_) => {}
            }
        }

        let mut seen = HashSet::new();
        for m in &self.models {
            if !seen.insert(m.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate model id '{}'", m.id)));
            }
            match m.kind {
                BackendKind::OpenaiCompatible | BackendKind::Anthropic if m.base_url.is_none() => {
                    return Err(ConfigError::Invalid(format!("model '{}' needs base_url", m.id)));
                }
                BackendKind::Replay if m.replay_path.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "model '{}' needs replay_path",
                        m.id
                    )));
                }
                _ => {}
            }
            if m.max_in_flight == 0 || m.retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' needs max_in_flight and retry.max_attempts > 0",
                    m.id
                )));
            }
            if !(0.0..=1.0).contains(&m.retry.jitter) {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' retry.jitter must be within [0, 1]",
                    m.id
                )));
            }
        }
        Ok(())
    }

    pub fn database(&self, id: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.id == id)
    }

    /// Mirror ids per primary database id.
    pub fn mirrors(&self) -> HashMap<String, Vec<String>> {
        let mut mirrors: HashMap<String, Vec<String>> = HashMap::new();
        for db in &self.databases {
            if let Some(primary) = &db.mirror_of {
                mirrors.entry(primary.clone()).or_default().push(db.id.clone());
            }
        }
        mirrors
    }

    pub fn pool_size_for(&self, db: &DatabaseConfig) -> usize {
        db.pool_size.unwrap_or(self.execution.pool_size)
    }

    /// Keep only the named models (CLI `--model`). Unknown names are an error.
    pub fn retain_models(&mut self, ids: &[String]) -> Result<(), ConfigError> {
        if ids.is_empty() {
            return Ok(());
        }
        for id in ids {
            if !self.models.iter().any(|m| &m.id == id) {
                return Err(ConfigError::Invalid(format!("unknown model '{id}'")));
            }
        }
        self.models.retain(|m| ids.contains(&m.id));
        Ok(())
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.execution.time_limit_ms)
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.run.pair_timeout_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run.run_deadline_secs.map(Duration::from_secs)
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[databases]]
id = "geo"
url = "sqlite:///tmp/geo.sqlite"

[[models]]
id = "local-coder"
kind = "openai_compatible"
base_url = "http://localhost:8080/v1"
"#;

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = HarnessConfig::from_toml(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.run.max_concurrency, 8);
        assert_eq!(config.execution.row_limit, 10_000);
        assert_eq!(config.models[0].retry.max_attempts, 3);
        assert_eq!(config.models[0].remote_model(), "local-coder");
        assert_eq!(config.pool_size_for(&config.databases[0]), 4);
        assert!((config.comparison.float_tolerance - 1e-6).abs() < 1e-12);
    }

    #[test]
    fn test_full_sections_parse() {
        let text = r#"
[run]
run_id = "nightly"
output_dir = "out"
max_concurrency = 2
run_deadline_secs = 600

[execution]
row_limit = 50
time_limit_ms = 2000
repair_table_names = true

[comparison]
float_tolerance = 1e-4
case_insensitive = true
row_order = "always_ignore"

[dataset]
path = "data/geo.json"
format = "text2sql"
name = "geography"
database = "geo"
split = "test"
limit = 10

[schema]
max_tables = 0

[[databases]]
id = "geo"
url = "postgres://eval@localhost/geo"
pool_size = 6

[[models]]
id = "hosted"
kind = "anthropic"
base_url = "https://api.anthropic.com"
model = "some-model"
api_key_env = "HOSTED_KEY"
requests_per_minute = 50

[models.retry]
max_attempts = 5
"#;
        let config = HarnessConfig::from_toml(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.run.run_id.as_deref(), Some("nightly"));
        assert_eq!(config.run_deadline(), Some(Duration::from_secs(600)));
        assert_eq!(config.time_limit(), Duration::from_millis(2000));
        assert!(config.comparison.case_insensitive);
        assert_eq!(config.dataset.limit, Some(10));
        assert_eq!(config.pool_size_for(&config.databases[0]), 6);
        assert_eq!(config.models[0].kind, BackendKind::Anthropic);
        assert_eq!(config.models[0].retry.max_attempts, 5);
        assert_eq!(config.models[0].remote_model(), "some-model");
    }

    #[test]
    fn test_validate_rejects_empty_lists() {
        let config = HarnessConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_limits() {
        let mut config = HarnessConfig::from_toml(MINIMAL).unwrap();
        config.models.push(config.models[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("duplicate model"));

        let mut config = HarnessConfig::from_toml(MINIMAL).unwrap();
        config.execution.row_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_backend_location() {
        let text = r#"
[[databases]]
id = "geo"
url = "sqlite://geo.db"

[[models]]
id = "replayed"
kind = "replay"
"#;
        let config = HarnessConfig::from_toml(text).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("replay_path"));
    }

    #[test]
    fn test_mirror_databases() {
        let text = r#"
[[databases]]
id = "uni"
url = "sqlite:///tmp/uni.sqlite"

[[databases]]
id = "uni_pg"
url = "postgres://eval@localhost/uni"
mirror_of = "uni"

[[models]]
id = "replayed"
kind = "replay"
replay_path = "candidates.jsonl"
"#;
        let config = HarnessConfig::from_toml(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mirrors()["uni"], vec!["uni_pg".to_string()]);
        assert!(!config.mirrors().contains_key("uni_pg"));

        let mut selfish = config.clone();
        selfish.databases[1].mirror_of = Some("uni_pg".into());
        assert!(selfish.validate().unwrap_err().to_string().contains("itself"));

        let mut dangling = config.clone();
        dangling.databases[1].mirror_of = Some("geo".into());
        assert!(dangling.validate().unwrap_err().to_string().contains("unknown database 'geo'"));

        let mut chained = config;
        chained.databases[0].mirror_of = Some("uni_pg".into());
        assert!(chained.validate().unwrap_err().to_string().contains("itself a mirror"));
    }

    #[test]
    fn test_retain_models() {
        let mut config = HarnessConfig::from_toml(MINIMAL).unwrap();
        assert!(config.retain_models(&["missing".into()]).is_err());
        config.retain_models(&["local-coder".into()]).unwrap();
        assert_eq!(config.models.len(), 1);
    }

    #[test]
    fn test_missing_api_key_env_is_reported() {
        let mut config = HarnessConfig::from_toml(MINIMAL).unwrap();
        config.models[0].api_key_env = Some("EVAL_TEST_KEY_THAT_IS_NEVER_SET".into());
        assert!(config.models[0].api_key().is_err());
    }
}
