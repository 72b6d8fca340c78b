//! Schema description handed to model adapters as read-only context.
//!
//! Introspected once per database by the connection layer. Rendering is
//! deterministic so the same question always sees the same prompt.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Words that carry no table-selection signal.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "all", "any", "from", "to", "of", "in", "on", "at", "for", "with", "and",
    "or", "is", "are", "was", "were", "be", "been", "do", "does", "did", "list", "show", "give",
    "get", "find", "what", "which", "who", "where", "when", "how", "many", "much",
];

const TABLE_WEIGHT: usize = 3;
const COLUMN_WEIGHT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(default)]
    pub data_type: String,
}

/// `column` of the owning table references `ref_table.ref_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    #[serde(default)]
    pub ref_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: &[(&str, &str)]) -> Self {
        Self {
            name: name.into(),
            columns: columns
                .iter()
                .map(|(n, t)| ColumnSchema {
                    name: n.to_string(),
                    data_type: t.to_string(),
                })
                .collect(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_key(mut self, column: &str, ref_table: &str, ref_column: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            ref_table: ref_table.to_string(),
            ref_column: ref_column.to_string(),
        });
        self
    }

    fn render(&self, include_types: bool) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if include_types && !c.data_type.is_empty() {
                    format!("{} {}", c.name, c.data_type)
                } else {
                    c.name.clone()
                }
            })
            .collect();
        format!("{}({})", self.name, cols.join(", "))
    }
}

/// Tables and columns of one benchmark database, sorted by table name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub database: String,
    pub tables: Vec<TableSchema>,
}

impl SchemaDescription {
    pub fn new(database: impl Into<String>, mut tables: Vec<TableSchema>) -> Self {
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            database: database.into(),
            tables,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// One `table(col, ...)` line per table.
    pub fn render_compact(&self, include_types: bool) -> String {
        self.tables
            .iter()
            .map(|t| t.render(include_types))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Undirected table adjacency through foreign keys.
    fn fk_graph(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let known: BTreeSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for t in &self.tables {
            for fk in &t.foreign_keys {
                let Some(&target) = known.get(fk.ref_table.as_str()) else {
                    continue;
                };
                if target == t.name {
                    continue;
                }
                graph.entry(t.name.as_str()).or_default().insert(target);
                graph.entry(target).or_default().insert(t.name.as_str());
            }
        }
        graph
    }

    /// Rank tables by overlap with the question; score and name descending/ascending.
    pub fn rank_tables(&self, question: &str) -> Vec<(String, usize)> {
        let q: BTreeSet<String> = normalize_tokens(question).into_iter().collect();
        let mut ranked: Vec<(String, usize)> = self
            .tables
            .iter()
            .map(|t| {
                let t_tokens: BTreeSet<String> =
                    split_ident(&t.name).iter().map(|s| stem(&s.to_lowercase())).collect();
                let c_tokens: BTreeSet<String> = t
                    .columns
                    .iter()
                    .flat_map(|c| split_ident(&c.name))
                    .map(|s| stem(&s.to_lowercase()))
                    .collect();
                let score = TABLE_WEIGHT * q.intersection(&t_tokens).count()
                    + COLUMN_WEIGHT * q.intersection(&c_tokens).count();
                (t.name.clone(), score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Subset of tables most relevant to a question, at most `max_tables`.
    ///
    /// Falls back to the first tables alphabetically when nothing scores,
    /// then adds 1-hop foreign-key neighbours while room remains.
    pub fn select_relevant(&self, question: &str, max_tables: usize) -> SchemaDescription {
        if max_tables == 0 || self.tables.len() <= max_tables {
            return self.clone();
        }

        let mut selected: Vec<String> = self
            .rank_tables(question)
            .into_iter()
            .filter(|(_, score)| *score > 0)
            .map(|(name, _)| name)
            .take(max_tables)
            .collect();
        if selected.is_empty() {
            selected = self
                .tables
                .iter()
                .take(max_tables)
                .map(|t| t.name.clone())
                .collect();
        }

        let graph = self.fk_graph();
        let base = selected.clone();
        'expand: for t in &base {
            if let Some(neighbours) = graph.get(t.as_str()) {
                for nb in neighbours {
                    if selected.len() >= max_tables {
                        break 'expand;
                    }
                    if !selected.iter().any(|s| s == nb) {
                        selected.push(nb.to_string());
                    }
                }
            }
        }

        let tables = self
            .tables
            .iter()
            .filter(|t| selected.contains(&t.name))
            .cloned()
            .collect();
        SchemaDescription::new(self.database.clone(), tables)
    }
}

/// Split an identifier on underscores, camel-case humps and digit runs.
fn split_ident(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut prev: Option<char> = None;
    for c in s.chars() {
        if !c.is_ascii_alphanumeric() {
            if !cur.is_empty() {
                parts.push(std::mem::take(&mut cur));
            }
            prev = None;
            continue;
        }
        let boundary = match prev {
            Some(p) => {
                (p.is_ascii_lowercase() && c.is_ascii_uppercase())
                    || (p.is_ascii_digit() != c.is_ascii_digit())
            }
            None => false,
        };
        if boundary && !cur.is_empty() {
            parts.push(std::mem::take(&mut cur));
        }
        cur.push(c);
        prev = Some(c);
    }
    if !cur.is_empty() {
        parts.push(cur);
    }
    parts
}

/// Tiny deterministic stemmer: plural and a few common suffixes.
fn stem(tok: &str) -> String {
    let n = tok.len();
    if n > 4 && tok.ends_with("ing") {
        tok[..n - 3].to_string()
    } else if n > 3 && (tok.ends_with("ed") || tok.ends_with("es")) {
        tok[..n - 2].to_string()
    } else if n > 2 && tok.ends_with('s') {
        tok[..n - 1].to_string()
    } else {
        tok.to_string()
    }
}

fn normalize_tokens(text: &str) -> Vec<String> {
    split_ident(&text.to_lowercase())
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| stem(&t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SchemaDescription {
        SchemaDescription::new(
            "advising",
            vec![
                TableSchema::new("student", &[("student_id", "INTEGER"), ("program_id", "INTEGER")]),
                TableSchema::new("program", &[("program_id", "INTEGER"), ("name", "TEXT")]),
                TableSchema::new("course", &[("course_id", "INTEGER"), ("title", "TEXT")]),
                TableSchema::new("instructor", &[("instructor_id", "INTEGER"), ("name", "TEXT")]),
                TableSchema::new("area", &[("course_id", "INTEGER"), ("area", "TEXT")])
                    .with_foreign_key("course_id", "course", "course_id"),
            ],
        )
    }

    #[test]
    fn compact_rendering_is_sorted() {
        let schema = SchemaDescription::new(
            "db",
            vec![
                TableSchema::new("zeta", &[("z", "TEXT")]),
                TableSchema::new("alpha", &[("a", "INTEGER"), ("b", "")]),
            ],
        );
        assert_eq!(schema.render_compact(false), "alpha(a, b)\nzeta(z)");
        assert_eq!(schema.render_compact(true), "alpha(a INTEGER, b)\nzeta(z TEXT)");
    }

    #[test]
    fn identifier_splitting() {
        assert_eq!(split_ident("flightLeg_2020"), vec!["flight", "Leg", "2020"]);
        assert_eq!(stem("students"), "student");
        assert_eq!(stem("teaching"), "teach");
    }

    #[test]
    fn relevant_tables_rank_by_overlap() {
        let picked = sample().select_relevant("How many students are in program 5?", 2);
        assert_eq!(picked.table_names(), vec!["program", "student"]);
    }

    #[test]
    fn generic_question_falls_back_alphabetically() {
        let picked = sample().select_relevant("zzz", 2);
        assert_eq!(picked.table_names(), vec!["area", "course"]);
    }

    #[test]
    fn foreign_key_neighbours_fill_remaining_room() {
        let picked = sample().select_relevant("which area?", 2);
        assert_eq!(picked.table_names(), vec!["area", "course"]);
    }

    #[test]
    fn small_schema_is_returned_whole() {
        let schema = sample();
        assert_eq!(schema.select_relevant("anything", 10), schema);
    }
}
