//! Prompt construction for SQL generation.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever the preamble or layout
//! changes, so verdict streams can be tied to the prompt that produced them.

use scoring::sql_text::SQL_MARKER;

use crate::db::Dialect;

/// Prompt version. Bump on any preamble or layout change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// System message sent to chat-style backends.
pub const SQL_PREAMBLE: &str = "\
You translate questions about a relational database into SQL. \
Answer with exactly one read-only SQL statement that answers the question \
against the schema provided. Do not explain the query, do not add comments, \
and do not modify data.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Assemble the prompt for one question.
///
/// `schema` is the compact rendering produced by
/// [`scoring::SchemaDescription::render_compact`].
pub fn build_prompt(schema: &str, question: &str, dialect: Dialect) -> Prompt {
    let dialect_name = match dialect {
        Dialect::Postgres => "PostgreSQL",
        Dialect::Sqlite => "SQLite",
    };
    Prompt {
        system: format!("{SQL_PREAMBLE} Target dialect: {dialect_name}."),
        user: format!(
            "### Database schema:\n{schema}\n\n### Question:\n{question}\n\n{SQL_MARKER}\n"
        ),
    }
}

/// Keep whole lines (one table each) until `max_chars` would be exceeded.
/// Zero means no limit.
pub fn truncate_schema_lines(schema: &str, max_chars: usize) -> String {
    if max_chars == 0 || schema.len() <= max_chars {
        return schema.to_string();
    }
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in schema.lines().filter(|l| !l.trim().is_empty()) {
        let cost = line.len() + 1;
        if used + cost > max_chars {
            break;
        }
        kept.push(line);
        used += cost;
    }
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_layout() {
        let p = build_prompt("student(id, program_id)", "How many students?", Dialect::Sqlite);
        assert_eq!(
            p.user,
            "### Database schema:\nstudent(id, program_id)\n\n### Question:\nHow many students?\n\n### SQL:\n"
        );
        assert!(p.system.ends_with("Target dialect: SQLite."));
    }

    #[test]
    fn test_schema_truncation_keeps_whole_lines() {
        let schema = "alpha(a, b)\nbeta(c, d)\ngamma(e, f)";
        assert_eq!(truncate_schema_lines(schema, 0), schema);
        assert_eq!(truncate_schema_lines(schema, 24), "alpha(a, b)\nbeta(c, d)");
        assert_eq!(truncate_schema_lines(schema, 5), "");
    }
}
