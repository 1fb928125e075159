//! Syntax-Aware Risk Analysis
//!
//! The safety controller merges the verdict of a [`RiskAnalyzer`] with its
//! own pattern matching for SQL-like operations. [`SqlStatementAnalyzer`] is
//! the built-in implementation: it strips comments and string literals,
//! splits the text into statements and classifies each one by its verb.

use std::collections::HashSet;

use thiserror::Error;

use super::risk::RiskLevel;

/// Verdict returned by an analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskVerdict {
    pub level: RiskLevel,
    pub findings: Vec<String>,
}

#[derive(Debug, Clone, Error)]
#[error("risk analyzer failed: {0}")]
pub struct AnalyzerError(pub String);

/// Deeper, syntax-aware risk scoring for structured-query statements.
pub trait RiskAnalyzer: Send + Sync {
    fn analyze(&self, statement: &str) -> Result<RiskVerdict, AnalyzerError>;
}

/// Statement-level SQL classifier.
#[derive(Debug, Clone, Default)]
pub struct SqlStatementAnalyzer;

impl SqlStatementAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl RiskAnalyzer for SqlStatementAnalyzer {
    fn analyze(&self, statement: &str) -> Result<RiskVerdict, AnalyzerError> {
        let cleaned = strip_comments_and_literals(statement)?;

        let mut level = RiskLevel::Safe;
        let mut findings = Vec::new();

        for (index, stmt) in cleaned
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
        {
            let (stmt_level, finding) = classify_statement(stmt);
            if stmt_level > RiskLevel::Safe {
                findings.push(format!("statement {}: {}", index + 1, finding));
            }
            level = level.max(stmt_level);
        }

        Ok(RiskVerdict { level, findings })
    }
}

/// Classifies one statement by its leading verb (or, for CTEs, the first
/// data-modifying verb).
fn classify_statement(stmt: &str) -> (RiskLevel, String) {
    let words: Vec<String> = stmt
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let present: HashSet<&str> = words.iter().map(String::as_str).collect();

    let mut verb = words.first().map(String::as_str).unwrap_or("");
    if verb == "WITH" {
        verb = ["DELETE", "UPDATE", "INSERT", "MERGE"]
            .into_iter()
            .find(|v| present.contains(v))
            .unwrap_or("SELECT");
    }

    let has_where = present.contains("WHERE");

    match verb {
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "VALUES" => {
            (RiskLevel::Safe, "read-only query".to_string())
        }
        "DROP" => (RiskLevel::Critical, "DROP statement".to_string()),
        "TRUNCATE" => (RiskLevel::Critical, "TRUNCATE statement".to_string()),
        "DELETE" if has_where => (RiskLevel::Medium, "filtered DELETE".to_string()),
        "DELETE" => (RiskLevel::Critical, "DELETE without WHERE".to_string()),
        "UPDATE" if has_where => (RiskLevel::Medium, "filtered UPDATE".to_string()),
        "UPDATE" => (RiskLevel::High, "UPDATE without WHERE".to_string()),
        "ALTER" | "GRANT" | "REVOKE" | "RENAME" => {
            (RiskLevel::High, format!("{} statement", verb))
        }
        "CREATE" => (RiskLevel::Medium, "CREATE statement".to_string()),
        "INSERT" | "MERGE" | "REPLACE" | "COPY" | "UPSERT" => {
            (RiskLevel::Low, format!("{} statement", verb))
        }
        other => (RiskLevel::Low, format!("unrecognised statement '{}'", other)),
    }
}

/// Removes `--` and `/* */` comments and replaces quoted literals with `''`.
fn strip_comments_and_literals(sql: &str) -> Result<String, AnalyzerError> {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut closed = false;
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        closed = true;
                        break;
                    }
                    prev = next;
                }
                if !closed {
                    return Err(AnalyzerError("unterminated block comment".to_string()));
                }
                out.push(' ');
            }
            '\'' => {
                let mut closed = false;
                while let Some(next) = chars.next() {
                    if next == '\'' {
                        // '' is an escaped quote inside the literal
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            continue;
                        }
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(AnalyzerError("unterminated string literal".to_string()));
                }
                out.push_str("''");
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(sql: &str) -> RiskLevel {
        SqlStatementAnalyzer::new().analyze(sql).unwrap().level
    }

    #[test]
    fn test_read_only_queries_are_safe() {
        assert_eq!(level("SELECT * FROM users"), RiskLevel::Safe);
        assert_eq!(level("explain select 1"), RiskLevel::Safe);
        assert_eq!(level(""), RiskLevel::Safe);
    }

    #[test]
    fn test_destructive_statements() {
        assert_eq!(level("DROP TABLE users"), RiskLevel::Critical);
        assert_eq!(level("truncate orders"), RiskLevel::Critical);
        assert_eq!(level("DELETE FROM users"), RiskLevel::Critical);
        assert_eq!(level("DELETE FROM users WHERE id = 1"), RiskLevel::Medium);
        assert_eq!(level("UPDATE users SET active = false"), RiskLevel::High);
        assert_eq!(level("UPDATE users SET active = false WHERE id = 9"), RiskLevel::Medium);
    }

    #[test]
    fn test_comments_cannot_hide_verbs() {
        assert_eq!(level("DELETE /* cleanup */ FROM users"), RiskLevel::Critical);
        assert_eq!(level("-- harmless\nDROP TABLE users"), RiskLevel::Critical);
    }

    #[test]
    fn test_literals_do_not_trigger() {
        assert_eq!(
            level("SELECT 'DROP TABLE users' AS note FROM dual"),
            RiskLevel::Safe
        );
        assert_eq!(
            level("INSERT INTO notes VALUES ('it''s; DROP TABLE x')"),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_multi_statement_takes_maximum() {
        let verdict = SqlStatementAnalyzer::new()
            .analyze("SELECT 1; INSERT INTO t VALUES (1); DROP TABLE t;")
            .unwrap();
        assert_eq!(verdict.level, RiskLevel::Critical);
        assert_eq!(verdict.findings.len(), 2);
        assert!(verdict.findings[1].starts_with("statement 3"));
    }

    #[test]
    fn test_cte_with_delete() {
        assert_eq!(
            level("WITH old AS (SELECT id FROM s) DELETE FROM s"),
            RiskLevel::Critical
        );
        assert_eq!(level("WITH x AS (SELECT 1) SELECT * FROM x"), RiskLevel::Safe);
    }

    #[test]
    fn test_unterminated_input_is_an_error() {
        let analyzer = SqlStatementAnalyzer::new();
        assert!(analyzer.analyze("SELECT 'oops").is_err());
        assert!(analyzer.analyze("SELECT 1 /* never closed").is_err());
    }
}
