//! SQL text utilities: candidate sanitization, placeholder filling,
//! complexity inference and table-name repair.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::sql_safety::{mask, scan_words};
use crate::types::{ComplexityTier, Variables};

/// Prompt cue after which the model is expected to write SQL.
pub const SQL_MARKER: &str = "### SQL:";

/// Lowest similarity at which a misspelled table name is rewritten.
pub const MIN_TABLE_SIMILARITY: f64 = 0.86;
/// Required lead of the best table over the runner-up.
pub const MIN_TABLE_SIMILARITY_GAP: f64 = 0.03;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:sqlite|postgresql|sql)?[ \t]*\n?(.*?)```")
        .expect("FENCED_BLOCK regex should compile")
});

static OPEN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*```[ \t]*(?:sqlite|postgresql|sql)?")
        .expect("OPEN_FENCE regex should compile")
});

/// Pull a single SQL statement out of raw model output.
///
/// Takes the text after the last `### SQL:` marker (some backends echo the
/// prompt), prefers the first fenced code block, cuts at the first statement
/// terminator outside literals and drops stray fences. Returns `None` when
/// nothing usable remains.
pub fn extract_sql(raw: &str) -> Option<String> {
    let tail = match raw.rfind(SQL_MARKER) {
        Some(pos) => &raw[pos + SQL_MARKER.len()..],
        None => raw,
    };

    let body = FENCED_BLOCK
        .captures(tail)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(tail);

    let cleaned = OPEN_FENCE.replace(body, "").replace("```", "");
    let masked = mask(&cleaned);
    let sql: String = match masked.iter().position(|&c| c == ';') {
        Some(cut) => cleaned.chars().take(cut).collect(),
        None => cleaned,
    };

    let sql = sql.trim();
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

/// Classify a query by join and subquery count.
///
/// `simple`: no joins and no subqueries. `moderate`: at most two joins and
/// at most one subquery. Everything else is `complex`.
pub fn infer_complexity(sql: &str) -> ComplexityTier {
    let words = scan_words(&mask(sql));
    let joins = words.iter().filter(|w| w.upper == "JOIN").count();
    let selects = words.iter().filter(|w| w.upper == "SELECT").count();
    let subqueries = selects.saturating_sub(1);

    if joins == 0 && subqueries == 0 {
        ComplexityTier::Simple
    } else if joins <= 2 && subqueries <= 1 {
        ComplexityTier::Moderate
    } else {
        ComplexityTier::Complex
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Substitute whole-identifier placeholders with their values.
///
/// Longer names are substituted first so `city0` never matches inside
/// `city01`. Values are inserted verbatim: no quoting, escaping or casting.
/// Placeholders inside quoted literals are substituted too, since datasets
/// write them as `name = "city_name0"`.
pub fn fill_placeholders(sql: &str, vars: &Variables) -> String {
    let mut names: Vec<&String> = vars.keys().filter(|k| !k.is_empty()).collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut out = sql.to_string();
    for name in names {
        out = replace_identifier(&out, name, &vars[name]);
    }
    out
}

fn replace_identifier(text: &str, name: &str, value: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut prev: Option<char> = None;
    while let Some(pos) = rest.find(name) {
        let before = rest[..pos].chars().next_back().or(prev);
        let after = rest[pos + name.len()..].chars().next();
        let bounded = !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char);

        out.push_str(&rest[..pos]);
        if bounded {
            out.push_str(value);
        } else {
            out.push_str(name);
        }
        prev = name.chars().next_back();
        rest = &rest[pos + name.len()..];
    }
    out.push_str(rest);
    out
}

/// One table identifier rewritten by [`repair_table_names`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRepair {
    pub from: String,
    pub to: String,
}

/// Rewrite table identifiers after `FROM`/`JOIN` to real table names.
///
/// Case-insensitive matches and a stripped plural `s` are always rewritten.
/// Otherwise the most similar table wins if it scores at least
/// [`MIN_TABLE_SIMILARITY`] and leads the runner-up by
/// [`MIN_TABLE_SIMILARITY_GAP`]. Literals, quoted identifiers and comments
/// are left alone.
pub fn repair_table_names(sql: &str, tables: &[String]) -> (String, Vec<TableRepair>) {
    if tables.is_empty() {
        return (sql.to_string(), Vec::new());
    }
    let chars: Vec<char> = sql.chars().collect();
    let words = scan_words(&mask(sql));

    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    let mut repairs = Vec::new();
    for pair in words.windows(2) {
        let (kw, tok) = (&pair[0], &pair[1]);
        if kw.upper != "FROM" && kw.upper != "JOIN" {
            continue;
        }
        if !chars[kw.end..tok.start].iter().all(|c| c.is_whitespace()) {
            continue;
        }
        let token: String = chars[tok.start..tok.end].iter().collect();
        if let Some(real) = best_table_match(&token, tables) {
            if real != token {
                repairs.push(TableRepair {
                    from: token,
                    to: real.clone(),
                });
                replacements.push((tok.start, tok.end, real));
            }
        }
    }

    if replacements.is_empty() {
        return (sql.to_string(), repairs);
    }
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (start, end, real) in replacements {
        out.extend(&chars[cursor..start]);
        out.push_str(&real);
        cursor = end;
    }
    out.extend(&chars[cursor..]);
    (out, repairs)
}

fn best_table_match(token: &str, tables: &[String]) -> Option<String> {
    let lower = token.to_lowercase();
    if let Some(real) = tables.iter().find(|t| t.to_lowercase() == lower) {
        return Some(real.clone());
    }
    if let Some(singular) = lower.strip_suffix('s') {
        if let Some(real) = tables.iter().find(|t| t.to_lowercase() == singular) {
            return Some(real.clone());
        }
    }

    let mut scored: Vec<(f64, &String)> = tables
        .iter()
        .map(|t| (strsim::normalized_damerau_levenshtein(&lower, &t.to_lowercase()), t))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    let (best, real) = *scored.first()?;
    let runner_up = scored.get(1).map_or(0.0, |s| s.0);
    if best < MIN_TABLE_SIMILARITY || best - runner_up < MIN_TABLE_SIMILARITY_GAP {
        return None;
    }
    Some(real.clone())
}
