//! SQL safety: read-only allow-list
//!
//! Every statement sent to a benchmark database, gold or candidate, passes
//! through [`check_read_only`] first. The check is lexical: literals,
//! quoted identifiers and comments are masked out, then the remaining words
//! are matched against an allow-list of leading keywords and a deny-list of
//! data-modifying keywords.
//!
//! The database session is additionally put in read-only mode by the
//! connection layer, so this is the first of two gates.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scoring::sql_safety::check_read_only;
//!
//! check_read_only("SELECT COUNT(*) FROM orders")?;
//! assert!(check_read_only("DELETE FROM orders").is_err());
//! ```

use thiserror::Error;

/// Leading keywords a statement may start with.
const ALLOWED_LEADING: &[&str] = &["SELECT", "WITH", "VALUES", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Keywords that may not appear anywhere outside literals.
const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "REPLACE", "DROP", "ALTER", "CREATE", "TRUNCATE",
    "GRANT", "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "COPY", "CALL", "LOCK", "INTO",
];

/// Reason a statement was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlSafetyError {
    #[error("empty statement")]
    Empty,
    #[error("multiple statements are not allowed in: {input_preview}")]
    MultipleStatements { input_preview: String },
    #[error("statement must start with SELECT, WITH, VALUES, SHOW, DESCRIBE or EXPLAIN, found '{keyword}'")]
    NotReadOnly { keyword: String },
    #[error("EXPLAIN ANALYZE executes the statement and is not allowed")]
    ExplainAnalyze,
    #[error("forbidden keyword '{keyword}' in: {input_preview}")]
    ForbiddenKeyword {
        keyword: String,
        input_preview: String,
    },
}

/// A bare word found in masked SQL text, with its char span and paren depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Word {
    pub upper: String,
    pub start: usize,
    pub end: usize,
    pub depth: usize,
}

/// Replace string literals, quoted identifiers and comments with spaces.
///
/// The output has exactly one char per input char, so char offsets found in
/// the masked text are valid in the original.
pub(crate) fn mask(sql: &str) -> Vec<char> {
    let src: Vec<char> = sql.chars().collect();
    let mut out = src.clone();
    let mut i = 0;
    while i < src.len() {
        let c = src[i];
        let next = src.get(i + 1).copied();
        let span_end = match c {
            '\'' | '"' | '`' => Some(quoted_end(&src, i, c)),
            '-' if next == Some('-') => {
                Some(src[i..].iter().position(|&ch| ch == '\n').map_or(src.len(), |p| i + p))
            }
            '/' if next == Some('*') => Some(
                (i + 2..src.len().saturating_sub(1))
                    .find(|&j| src[j] == '*' && src[j + 1] == '/')
                    .map_or(src.len(), |j| j + 2),
            ),
            '$' => dollar_quoted_end(&src, i),
            _ => None,
        };
        match span_end {
            Some(end) => {
                for ch in out.iter_mut().take(end).skip(i) {
                    if *ch != '\n' {
                        *ch = ' ';
                    }
                }
                i = end.max(i + 1);
            }
            None => i += 1,
        }
    }
    out
}

/// End (exclusive) of a quoted run starting at `start`; doubled quotes escape.
fn quoted_end(src: &[char], start: usize, quote: char) -> usize {
    let mut j = start + 1;
    while j < src.len() {
        if src[j] == quote {
            if src.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    src.len()
}

/// PostgreSQL `$tag$ ... $tag$` strings. Returns `None` for `$1` parameters.
fn dollar_quoted_end(src: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    while j < src.len() && (src[j].is_ascii_alphabetic() || src[j] == '_') {
        j += 1;
    }
    if src.get(j) != Some(&'$') {
        return None;
    }
    let tag: Vec<char> = src[start..=j].to_vec();
    let body = j + 1;
    (body..src.len())
        .find(|&k| src[k..].starts_with(&tag))
        .map(|k| k + tag.len())
        .or(Some(src.len()))
}

/// Words of masked SQL with paren depth at their position.
pub(crate) fn scan_words(masked: &[char]) -> Vec<Word> {
    let mut words = Vec::new();
    let mut depth: usize = 0;
    let mut i = 0;
    while i < masked.len() {
        let c = masked[i];
        if c == '(' {
            depth += 1;
            i += 1;
        } else if c == ')' {
            depth = depth.saturating_sub(1);
            i += 1;
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < masked.len() && (masked[i].is_alphanumeric() || masked[i] == '_') {
                i += 1;
            }
            let upper: String = masked[start..i].iter().collect::<String>().to_uppercase();
            words.push(Word {
                upper,
                start,
                end: i,
                depth,
            });
        } else {
            i += 1;
        }
    }
    words
}

fn preview(sql: &str) -> String {
    if sql.chars().count() > 100 {
        format!("{}...", sql.chars().take(100).collect::<String>())
    } else {
        sql.to_string()
    }
}

/// Reject anything that is not a single read-only statement.
pub fn check_read_only(sql: &str) -> Result<(), SqlSafetyError> {
    let masked = mask(sql);

    // Trailing terminators are tolerated, anything after a terminator is not.
    let mut end = masked.len();
    while end > 0 && (masked[end - 1].is_whitespace() || masked[end - 1] == ';') {
        end -= 1;
    }
    let body = &masked[..end];
    if body.iter().all(|c| c.is_whitespace()) {
        return Err(SqlSafetyError::Empty);
    }
    if body.contains(&';') {
        return Err(SqlSafetyError::MultipleStatements {
            input_preview: preview(sql),
        });
    }

    let words = scan_words(body);
    let first = match words.first() {
        Some(w) => w,
        None => return Err(SqlSafetyError::Empty),
    };
    if !ALLOWED_LEADING.contains(&first.upper.as_str()) {
        return Err(SqlSafetyError::NotReadOnly {
            keyword: first.upper.clone(),
        });
    }
    if first.upper == "EXPLAIN"
        && words
            .iter()
            .skip(1)
            .take(3)
            .any(|w| w.upper == "ANALYZE" || w.upper == "ANALYSE")
    {
        return Err(SqlSafetyError::ExplainAnalyze);
    }

    for w in &words {
        if !FORBIDDEN.contains(&w.upper.as_str()) {
            continue;
        }
        // REPLACE(str, from, to) is a scalar function, not a statement.
        if w.upper == "REPLACE" && next_non_space(body, w.end) == Some('(') {
            continue;
        }
        return Err(SqlSafetyError::ForbiddenKeyword {
            keyword: w.upper.clone(),
            input_preview: preview(sql),
        });
    }
    Ok(())
}

fn next_non_space(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

/// Whether the statement has an `ORDER BY` at parenthesis depth zero.
///
/// Orderings inside window specifications or subqueries do not count, and
/// neither do occurrences inside literals or comments.
pub fn has_top_level_order_by(sql: &str) -> bool {
    let words = scan_words(&mask(sql));
    words
        .windows(2)
        .any(|w| w[0].depth == 0 && w[1].depth == 0 && w[0].upper == "ORDER" && w[1].upper == "BY")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_is_allowed() {
        assert!(check_read_only("SELECT COUNT(*) FROM orders;").is_ok());
        assert!(check_read_only("  with t as (select 1) select * from t").is_ok());
        assert!(check_read_only("(SELECT a FROM t) UNION (SELECT b FROM u)").is_ok());
        assert!(check_read_only("EXPLAIN SELECT 1").is_ok());
    }

    #[test]
    fn data_modification_is_rejected() {
        assert!(matches!(
            check_read_only("DELETE FROM orders"),
            Err(SqlSafetyError::NotReadOnly { .. })
        ));
        assert!(matches!(
            check_read_only("WITH d AS (DELETE FROM t RETURNING *) SELECT * FROM d"),
            Err(SqlSafetyError::ForbiddenKeyword { .. })
        ));
        assert!(matches!(
            check_read_only("SELECT * INTO backup FROM t"),
            Err(SqlSafetyError::ForbiddenKeyword { keyword, .. }) if keyword == "INTO"
        ));
    }

    #[test]
    fn stacked_statements_are_rejected() {
        assert!(matches!(
            check_read_only("SELECT 1; DROP TABLE t"),
            Err(SqlSafetyError::MultipleStatements { .. })
        ));
    }

    #[test]
    fn keywords_inside_literals_and_comments_are_ignored() {
        assert!(check_read_only("SELECT 'DELETE FROM t; DROP' AS note").is_ok());
        assert!(check_read_only("SELECT \"update\" FROM t -- drop later").is_ok());
        assert!(check_read_only("SELECT 1 /* insert ; here */").is_ok());
        assert!(check_read_only("SELECT $$ truncate $$").is_ok());
        assert!(check_read_only("SELECT 'it''s; fine'").is_ok());
    }

    #[test]
    fn replace_function_is_not_a_statement() {
        assert!(check_read_only("SELECT REPLACE(name, 'a', 'b') FROM t").is_ok());
        assert!(check_read_only("REPLACE INTO t VALUES (1)").is_err());
    }

    #[test]
    fn explain_analyze_is_rejected() {
        assert_eq!(
            check_read_only("EXPLAIN ANALYZE SELECT 1"),
            Err(SqlSafetyError::ExplainAnalyze)
        );
        assert_eq!(
            check_read_only("explain (analyze, buffers) select 1"),
            Err(SqlSafetyError::ExplainAnalyze)
        );
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(check_read_only("  ;  "), Err(SqlSafetyError::Empty));
        assert_eq!(check_read_only("-- nothing"), Err(SqlSafetyError::Empty));
    }

    #[test]
    fn order_by_detection_is_top_level_only() {
        assert!(has_top_level_order_by("SELECT a FROM t ORDER BY a"));
        assert!(has_top_level_order_by("select a from t order\n  by a desc"));
        assert!(!has_top_level_order_by(
            "SELECT a, ROW_NUMBER() OVER (ORDER BY b) FROM t"
        ));
        assert!(!has_top_level_order_by(
            "SELECT * FROM (SELECT a FROM t ORDER BY a LIMIT 3) s"
        ));
        assert!(!has_top_level_order_by("SELECT 'order by' FROM t"));
    }

    #[test]
    fn mask_preserves_char_offsets() {
        let sql = "SELECT 'é;' , x -- ü\nFROM t";
        let masked = mask(sql);
        assert_eq!(masked.len(), sql.chars().count());
        assert!(!masked.contains(&';'));
        assert!(masked.contains(&'\n'));
    }
}
