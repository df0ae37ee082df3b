//! SQL canonicalization applied before an answer leaves the pipeline

use regex::{Captures, Regex};
use std::sync::LazyLock;

use sluice_core::config::ValidationConfig;

use super::scan::{code_only, map_code};

static LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(LIMIT|FETCH\s+FIRST)\b").expect("valid limit regex"));

static AGGREGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(COUNT|SUM|AVG|MAX|MIN)\s*\(|\bGROUP\s+BY\b").expect("valid aggregate regex")
});

static SELECT_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SELECT\b").expect("valid select regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(SELECT|FROM|WHERE|AND|OR|LEFT\s+JOIN|RIGHT\s+JOIN|INNER\s+JOIN|JOIN|ON|GROUP\s+BY|ORDER\s+BY|HAVING|LIMIT)\b",
    )
    .expect("valid keyword regex")
});

/// Idempotent SQL rewriter: bounds unaggregated SELECTs with a default
/// LIMIT and canonicalizes whitespace and keyword case outside quoted text
#[derive(Debug, Clone)]
pub struct SqlPostProcessor {
    default_limit: Option<usize>,
}

impl Default for SqlPostProcessor {
    fn default() -> Self {
        Self::new(100)
    }
}

impl SqlPostProcessor {
    /// Post-processor appending `LIMIT default_limit`
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: Some(default_limit),
        }
    }

    /// Post-processor configured from the validation section
    pub fn from_config(config: &ValidationConfig) -> Self {
        Self {
            default_limit: config.enforce_limit.then_some(config.default_limit),
        }
    }

    /// Apply every rewrite to `sql`
    pub fn process(&self, sql: &str) -> String {
        let sql = sql.trim();
        let sql = match self.default_limit {
            Some(limit) => Self::ensure_limit(sql, limit),
            None => sql.to_string(),
        };
        Self::canonicalize(&sql)
    }

    fn ensure_limit(sql: &str, limit: usize) -> String {
        let code = code_only(sql);
        if LIMIT.is_match(&code) || AGGREGATE.is_match(&code) || !SELECT_START.is_match(&code) {
            return sql.to_string();
        }
        // comments are dropped so the appended clause cannot be commented out
        let body = map_code(sql, str::to_string);
        let body = body.trim_end().trim_end_matches(';').trim_end();
        format!("{} LIMIT {}", body, limit)
    }

    fn canonicalize(sql: &str) -> String {
        let spaced = map_code(sql, |code| {
            let collapsed = WHITESPACE.replace_all(code, " ");
            KEYWORD
                .replace_all(&collapsed, |caps: &Captures<'_>| {
                    caps[1]
                        .split_whitespace()
                        .map(str::to_uppercase)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .into_owned()
        });
        spaced.trim().to_string()
    }
}
