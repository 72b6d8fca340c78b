//! Dataset loading.
//!
//! Two on-disk formats:
//! - `jsonl`: one [`BenchmarkItem`] per line; `tier` may be omitted and is
//!   then inferred from the gold SQL.
//! - `text2sql`: the text2sql-data JSON layout (a list of entries, each with
//!   SQL variants, variable declarations and templated sentences). Every
//!   sentence becomes one item.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

use crate::sql_text::{fill_placeholders, infer_complexity};
use crate::types::{BenchmarkItem, ComplexityTier, Variables};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON on line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid dataset JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed dataset: {0}")]
    Format(String),
    #[error("duplicate item id '{0}'")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    #[default]
    Jsonl,
    Text2sql,
}

/// Where and how to load benchmark items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSpec {
    pub path: PathBuf,
    pub format: DatasetFormat,
    /// Dataset name used in generated ids; defaults to the file stem.
    pub name: Option<String>,
    /// Database id for `text2sql` items; defaults to the dataset name.
    pub database: Option<String>,
    /// Keep only items whose query or question split equals this label.
    pub split: Option<String>,
    pub limit: Option<usize>,
}

impl DatasetSpec {
    fn dataset_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dataset".to_string())
        })
    }
}

/// Read, parse, de-duplicate, filter and cap a dataset.
pub fn load_dataset(spec: &DatasetSpec) -> Result<Vec<BenchmarkItem>, DatasetError> {
    let text = std::fs::read_to_string(&spec.path).map_err(|source| DatasetError::Io {
        path: spec.path.clone(),
        source,
    })?;
    let name = spec.dataset_name();
    let items = match spec.format {
        DatasetFormat::Jsonl => parse_jsonl(&text)?,
        DatasetFormat::Text2sql => {
            let database = spec.database.clone().unwrap_or_else(|| name.clone());
            parse_text2sql(&text, &name, &database)?
        }
    };
    let parsed = items.len();
    let selected = select(items, spec.split.as_deref(), spec.limit)?;
    tracing::info!(
        dataset = %name,
        parsed,
        selected = selected.len(),
        split = spec.split.as_deref().unwrap_or("-"),
        "loaded dataset"
    );
    Ok(selected)
}

/// Reject duplicate ids, then apply the split filter and limit.
pub fn select(
    items: Vec<BenchmarkItem>,
    split: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<BenchmarkItem>, DatasetError> {
    let mut seen = BTreeSet::new();
    for item in &items {
        if !seen.insert(item.id.as_str()) {
            return Err(DatasetError::DuplicateId(item.id.clone()));
        }
    }
    let filtered = items
        .into_iter()
        .filter(|item| split.map_or(true, |s| item.in_split(s)))
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Ok(filtered)
}

#[derive(Debug, Deserialize)]
struct JsonlRecord {
    id: String,
    question: String,
    database: String,
    gold_sql: String,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    query_split: Option<String>,
    #[serde(default)]
    question_split: Option<String>,
    #[serde(default)]
    variables: Variables,
}

/// Parse the `jsonl` format. Blank lines are skipped.
pub fn parse_jsonl(text: &str) -> Result<Vec<BenchmarkItem>, DatasetError> {
    let mut items = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: JsonlRecord = serde_json::from_str(line).map_err(|source| DatasetError::Line {
            line: idx + 1,
            source,
        })?;
        let gold_sql = fill_placeholders(&rec.gold_sql, &rec.variables);
        let tier = match rec.tier.as_deref() {
            Some(label) => ComplexityTier::parse(label).ok_or_else(|| {
                DatasetError::Format(format!("line {}: unknown tier '{label}'", idx + 1))
            })?,
            None => infer_complexity(&gold_sql),
        };
        let mut item = BenchmarkItem::new(
            rec.id,
            fill_placeholders(&rec.question, &rec.variables),
            rec.database,
            gold_sql,
            tier,
        )
        .with_splits(rec.query_split, rec.question_split);
        item.variables = rec.variables;
        items.push(item);
    }
    Ok(items)
}

/// Parse the text2sql-data JSON layout.
///
/// The question is filled from the sentence's variables. The gold SQL is the
/// first SQL variant, filled from the sentence's variables and then from the
/// entry's declared `example` values.
pub fn parse_text2sql(
    text: &str,
    dataset: &str,
    database: &str,
) -> Result<Vec<BenchmarkItem>, DatasetError> {
    let root: Json = serde_json::from_str(text)?;
    let entries = root
        .as_array()
        .ok_or_else(|| DatasetError::Format("top level must be a list of entries".into()))?;

    let mut items = Vec::new();
    for (e_idx, entry) in entries.iter().enumerate() {
        let Some(sql_template) = entry
            .get("sql")
            .and_then(Json::as_array)
            .and_then(|v| v.first())
            .and_then(Json::as_str)
        else {
            continue;
        };

        let mut defaults = Variables::new();
        for var in entry
            .get("variables")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
        {
            if let (Some(name), Some(example)) =
                (var.get("name").and_then(Json::as_str), var.get("example"))
            {
                if let Some(value) = scalar_to_string(example) {
                    defaults.insert(name.to_string(), value);
                }
            }
        }

        let query_split = entry
            .get("query-split")
            .and_then(Json::as_str)
            .map(str::to_string);
        let declared_tier = entry
            .get("difficulty")
            .and_then(Json::as_str)
            .and_then(ComplexityTier::parse);

        let sentences = entry
            .get("sentences")
            .and_then(Json::as_array)
            .into_iter()
            .flatten();
        for (s_idx, sentence) in sentences.enumerate() {
            let Some(question) = sentence.get("text").and_then(Json::as_str) else {
                continue;
            };
            let mut sentence_vars = Variables::new();
            if let Some(obj) = sentence.get("variables").and_then(Json::as_object) {
                for (k, v) in obj {
                    if let Some(value) = scalar_to_string(v) {
                        sentence_vars.insert(k.clone(), value);
                    }
                }
            }
            let mut sql_vars = defaults.clone();
            sql_vars.extend(sentence_vars.clone());

            let gold_sql = fill_placeholders(sql_template, &sql_vars);
            let tier = declared_tier.unwrap_or_else(|| infer_complexity(&gold_sql));
            let question_split = sentence
                .get("question-split")
                .and_then(Json::as_str)
                .map(str::to_string);

            let mut item = BenchmarkItem::new(
                format!("{dataset}-{e_idx}-{s_idx}"),
                fill_placeholders(question, &sentence_vars),
                database,
                gold_sql,
                tier,
            )
            .with_splits(query_split.clone(), question_split);
            item.variables = sql_vars;
            items.push(item);
        }
    }
    Ok(items)
}

fn scalar_to_string(v: &Json) -> Option<String> {
    match v {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT2SQL: &str = r#"[
      {
        "query-split": "train",
        "sql": ["SELECT COUNT(*) FROM STUDENT WHERE program_id = program_id0",
                "SELECT COUNT(1) FROM STUDENT WHERE program_id = program_id0"],
        "variables": [{"name": "program_id0", "example": "7", "type": "program_id"}],
        "sentences": [
          {"text": "How many students are in program program_id0 ?",
           "question-split": "test",
           "variables": {"program_id0": "5"}},
          {"text": "Count students in the default program",
           "question-split": "dev",
           "variables": {}}
        ]
      },
      {"sql": [], "sentences": [{"text": "orphan"}]}
    ]"#;

    #[test]
    fn text2sql_expands_sentences() {
        let items = parse_text2sql(TEXT2SQL, "advising", "advising_db").unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].id, "advising-0-0");
        assert_eq!(items[0].question, "How many students are in program 5 ?");
        assert_eq!(
            items[0].gold_sql,
            "SELECT COUNT(*) FROM STUDENT WHERE program_id = 5"
        );
        assert_eq!(items[0].database, "advising_db");
        assert_eq!(items[0].tier, ComplexityTier::Simple);
        assert_eq!(items[0].query_split.as_deref(), Some("train"));
        assert_eq!(items[0].question_split.as_deref(), Some("test"));

        // Falls back to the declared example value.
        assert_eq!(
            items[1].gold_sql,
            "SELECT COUNT(*) FROM STUDENT WHERE program_id = 7"
        );
    }

    #[test]
    fn text2sql_rejects_non_list() {
        assert!(matches!(
            parse_text2sql("{}", "d", "d"),
            Err(DatasetError::Format(_))
        ));
    }

    #[test]
    fn jsonl_infers_missing_tier_and_fills_variables() {
        let text = r#"
{"id": "q1", "question": "How many in city0?", "database": "geo", "gold_sql": "SELECT COUNT(*) FROM city WHERE name = 'city0'", "variables": {"city0": "Boston"}}
{"id": "q2", "question": "join", "database": "geo", "gold_sql": "SELECT * FROM a JOIN b ON a.x = b.x", "tier": "hard"}
"#;
        let items = parse_jsonl(text).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].question, "How many in Boston?");
        assert_eq!(items[0].gold_sql, "SELECT COUNT(*) FROM city WHERE name = 'Boston'");
        assert_eq!(items[0].tier, ComplexityTier::Simple);
        assert_eq!(items[1].tier, ComplexityTier::Complex);
    }

    #[test]
    fn jsonl_reports_bad_line_number() {
        let text = "{\"id\": \"q1\", \"question\": \"q\", \"database\": \"d\", \"gold_sql\": \"SELECT 1\"}\nnot json";
        match parse_jsonl(text) {
            Err(DatasetError::Line { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected line error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let a = BenchmarkItem::new("q1", "q", "d", "SELECT 1", ComplexityTier::Simple);
        let result = select(vec![a.clone(), a], None, None);
        assert!(matches!(result, Err(DatasetError::DuplicateId(id)) if id == "q1"));
    }

    #[test]
    fn split_then_limit() {
        let items = parse_text2sql(TEXT2SQL, "advising", "advising").unwrap();
        let dev = select(items.clone(), Some("dev"), None).unwrap();
        assert_eq!(dev.len(), 1);
        assert_eq!(dev[0].id, "advising-0-1");

        let train = select(items, Some("train"), Some(1)).unwrap();
        assert_eq!(train.len(), 1);
    }

    #[test]
    fn load_from_file_uses_stem_as_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("advising.json");
        std::fs::write(&path, TEXT2SQL).unwrap();
        let spec = DatasetSpec {
            path,
            format: DatasetFormat::Text2sql,
            limit: Some(1),
            ..Default::default()
        };
        let items = load_dataset(&spec).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "advising-0-0");
        assert_eq!(items[0].database, "advising");
    }
}
