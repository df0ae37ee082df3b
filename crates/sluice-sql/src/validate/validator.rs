//! Schema-aware SQL validation

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

use sluice_core::schema::SchemaDefinition;

use super::scan::code_only;

// ============================================================================
// Result types
// ============================================================================

/// Category of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// Table not in the schema
    InvalidTable,
    /// Column not in its table
    InvalidColumn,
    /// Malformed statement
    SyntaxError,
    /// Implicit comma join
    MissingJoin,
    /// Column name resolvable to more than one table
    AmbiguousColumn,
    /// Statement other than a read
    DangerousQuery,
    /// Unbounded `SELECT *`
    MissingLimit,
    /// Multiple tables without a join condition
    CartesianProduct,
}

impl ValidationErrorKind {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorKind::InvalidTable => "invalid_table",
            ValidationErrorKind::InvalidColumn => "invalid_column",
            ValidationErrorKind::SyntaxError => "syntax_error",
            ValidationErrorKind::MissingJoin => "missing_join",
            ValidationErrorKind::AmbiguousColumn => "ambiguous_column",
            ValidationErrorKind::DangerousQuery => "dangerous_query",
            ValidationErrorKind::MissingLimit => "missing_limit",
            ValidationErrorKind::CartesianProduct => "cartesian_product",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a finding matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks acceptance
    Error,
    /// Surfaced, does not block
    Warning,
    /// Style note
    Info,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Category
    pub kind: ValidationErrorKind,
    /// What is wrong
    pub message: String,
    /// How to fix it
    pub suggestion: String,
    /// Severity
    pub severity: Severity,
}

impl ValidationIssue {
    fn new(
        kind: ValidationErrorKind,
        severity: Severity,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: suggestion.into(),
            severity,
        }
    }
}

/// Outcome of validating one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// No errors were found
    pub is_valid: bool,
    /// Blocking findings
    pub errors: Vec<ValidationIssue>,
    /// Warnings and info notes
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Error messages, in check order
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    /// Whether any error has `kind`
    pub fn has_error(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

// ============================================================================
// Extraction
// ============================================================================

static DANGEROUS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bDROP\s+(TABLE|DATABASE|INDEX|VIEW|SCHEMA)\b", "DROP operation detected"),
        (r"\bTRUNCATE\s+", "TRUNCATE operation detected"),
        (r"\bDELETE\s+FROM\b", "DELETE operation detected"),
        (r"\bUPDATE\s+\w+\s+SET\b", "UPDATE operation detected"),
        (r"\bINSERT\s+", "INSERT operation detected"),
        (r"\bALTER\s+", "ALTER operation detected"),
        (r"\bCREATE\s+", "CREATE operation detected"),
        (r"\bGRANT\s+", "GRANT operation detected"),
        (r"\bREVOKE\s+", "REVOKE operation detected"),
    ]
    .into_iter()
    .map(|(p, m)| (Regex::new(p).expect("valid dangerous-statement regex"), m))
    .collect()
});

static WHERE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bWHERE\b").expect("valid where regex"));

static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bJOIN\b").expect("valid join regex"));

static LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(LIMIT|TOP|FETCH\s+FIRST)\b").expect("valid limit regex"));

static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSELECT\s+(DISTINCT\s+)?\*").expect("valid select-star regex"));

static AGGREGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(COUNT|SUM|AVG|MAX|MIN)\s*\(").expect("valid aggregate regex")
});

static IMPLICIT_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bFROM\s+[\w.]+(\s+(AS\s+)?\w+)?\s*,\s*\w+").expect("valid implicit join regex")
});

static FROM_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)\bfrom\s+(.+?)(?:\b(?:where|join|inner|left|right|full|cross|natural|group|order|limit|having|union|on|select|from)\b|;|\)|$)",
    )
    .expect("valid from clause regex")
});

static JOIN_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bjoin\s+([`"\[]?[\w.]+[`"\]]?)(?:\s+(?:as\s+)?(\w+))?"#)
        .expect("valid join table regex")
});

static QUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([`"\[]?[A-Za-z_]\w*[`"\]]?)\.([`"\[]?[A-Za-z_]\w*[`"\]]?)"#)
        .expect("valid qualified column regex")
});

static CTE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bwith(?:\s+recursive)?|,)\s*([A-Za-z_]\w*)\s*(?:\([^()]*\)\s*)?\bas\s*\(")
        .expect("valid cte regex")
});

/// Functions whose arguments use FROM as a keyword, not a table clause
const FROM_FUNCTIONS: [&str; 6] = ["extract", "substring", "substr", "trim", "overlay", "position"];

const NOT_ALIASES: [&str; 12] = [
    "on", "using", "where", "inner", "left", "right", "full", "cross", "join", "group", "order",
    "limit",
];

fn unquote(name: &str) -> String {
    name.trim_matches(|c: char| matches!(c, '`' | '"' | '[' | ']'))
        .to_lowercase()
}

/// Last component of a possibly schema-qualified name
fn base_name(name: &str) -> String {
    let name = unquote(name);
    match name.rsplit_once('.') {
        Some((_, base)) => unquote(base),
        None => name,
    }
}

/// Byte offset of the innermost `(` still open at `pos`
fn open_paren_before(code: &str, pos: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in code[..pos].char_indices().rev() {
        match c {
            ')' => depth += 1,
            '(' if depth == 0 => return Some(i),
            '(' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Whether `pos` sits inside the argument list of `EXTRACT(... FROM x)` and friends
fn in_from_function(code: &str, pos: usize) -> bool {
    let Some(open) = open_paren_before(code, pos) else {
        return false;
    };
    let function = code[..open]
        .trim_end()
        .rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("")
        .to_lowercase();
    FROM_FUNCTIONS.contains(&function.as_str())
}

/// Names introduced by a leading `WITH` clause
fn cte_names(code: &str) -> BTreeSet<String> {
    let starts_with_with = code
        .trim_start()
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("with"));
    if !starts_with_with {
        return BTreeSet::new();
    }
    CTE_NAME
        .captures_iter(code)
        .filter(|caps| caps.get(0).is_some_and(|m| open_paren_before(code, m.start()).is_none()))
        .map(|caps| caps[1].to_lowercase())
        .collect()
}

/// A table reference with its optional alias, lowercased
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Table name
    pub name: String,
    /// Alias, if any
    pub alias: Option<String>,
}

/// Tables referenced in FROM and JOIN clauses, in order of appearance.
///
/// Names defined by a `WITH` clause are not tables and are left out.
pub fn table_refs(sql: &str) -> Vec<TableRef> {
    let code = code_only(sql);
    let ctes = cte_names(&code);
    let mut refs: Vec<TableRef> = Vec::new();
    let mut push = |name: &str, alias: Option<&str>| {
        let name = base_name(name);
        if name.is_empty() || name.starts_with('(') || ctes.contains(&name) {
            return;
        }
        let alias = alias
            .map(str::to_lowercase)
            .filter(|a| !NOT_ALIASES.contains(&a.as_str()) && *a != name);
        refs.push(TableRef { name, alias });
    };

    for caps in FROM_CLAUSE.captures_iter(&code) {
        if caps.get(0).is_some_and(|m| in_from_function(&code, m.start())) {
            continue;
        }
        for item in caps[1].split(',') {
            let mut words = item.split_whitespace();
            let Some(name) = words.next() else { continue };
            let alias = match words.next() {
                Some(w) if w.eq_ignore_ascii_case("as") => words.next(),
                other => other,
            };
            push(name, alias);
        }
    }
    for caps in JOIN_TABLE.captures_iter(&code) {
        push(&caps[1], caps.get(2).map(|m| m.as_str()));
    }
    refs
}

/// Distinct table names referenced by `sql`
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    table_refs(sql)
        .into_iter()
        .filter_map(|r| seen.insert(r.name.clone()).then_some(r.name))
        .collect()
}

/// `qualifier.column` references, lowercased and unquoted
pub fn qualified_columns(sql: &str) -> Vec<(String, String)> {
    let code = code_only(sql);
    QUALIFIED
        .captures_iter(&code)
        .map(|c| (unquote(&c[1]), unquote(&c[2])))
        .collect()
}

// ============================================================================
// Validator
// ============================================================================

/// Validates SQL against a known schema.
///
/// Checks run in order:
///
/// 1. statement type (anything but a read is an error)
/// 2. table existence, with a nearest-name suggestion
/// 3. qualified `table.column` existence, only when every table is known
/// 4. multi-table queries without JOIN or WHERE (warning)
/// 5. `SELECT *` without LIMIT or aggregate (warning)
/// 6. comma joins (info)
#[derive(Debug, Clone)]
pub struct SqlValidator {
    tables: BTreeSet<String>,
    columns: BTreeMap<String, BTreeSet<String>>,
    similarity_threshold: f32,
}

impl SqlValidator {
    /// Validator over explicit table and column names
    pub fn new<T, C>(tables: T, columns: BTreeMap<String, C>) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        Self {
            tables: tables
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .collect(),
            columns: columns
                .into_iter()
                .map(|(t, cols)| {
                    (
                        t.to_lowercase(),
                        cols.into_iter().map(|c| c.as_ref().to_lowercase()).collect(),
                    )
                })
                .collect(),
            similarity_threshold: 0.6,
        }
    }

    /// Validator over every table and column of `schema`
    pub fn from_schema(schema: &SchemaDefinition) -> Self {
        let columns = schema
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.column_names()))
            .collect::<BTreeMap<_, _>>();
        Self::new(schema.tables.keys(), columns)
    }

    /// Override the suggestion threshold
    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Known table names, lowercased
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    /// Known columns of `table`
    pub fn columns_of(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.columns.get(&table.to_lowercase())
    }

    /// Validate `sql`
    pub fn validate(&self, sql: &str) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let code = code_only(sql);
        let upper = code.to_uppercase();

        if code.trim().is_empty() {
            errors.push(ValidationIssue::new(
                ValidationErrorKind::SyntaxError,
                Severity::Error,
                "Empty query",
                "Generate a SELECT statement",
            ));
            return ValidationResult {
                is_valid: false,
                errors,
                warnings,
            };
        }

        errors.extend(self.check_dangerous(&upper));
        errors.extend(self.check_parentheses(&code));

        let refs = table_refs(sql);
        let table_errors = self.check_tables(&refs);
        let tables_known = table_errors.is_empty();
        errors.extend(table_errors);

        if tables_known {
            errors.extend(self.check_columns(sql, &refs));
        }

        let distinct: BTreeSet<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        if distinct.len() > 1 && !JOIN.is_match(&upper) && !WHERE.is_match(&upper) {
            warnings.push(ValidationIssue::new(
                ValidationErrorKind::CartesianProduct,
                Severity::Warning,
                "Multiple tables without JOIN or WHERE may cause cartesian product",
                "Add proper JOIN conditions between tables",
            ));
        }

        if SELECT_STAR.is_match(&upper) && !LIMIT.is_match(&upper) && !AGGREGATE.is_match(&upper)
        {
            warnings.push(ValidationIssue::new(
                ValidationErrorKind::MissingLimit,
                Severity::Warning,
                "SELECT * without LIMIT may return too many rows",
                "Add LIMIT clause to restrict results",
            ));
        }

        if IMPLICIT_JOIN.is_match(&upper) {
            warnings.push(ValidationIssue::new(
                ValidationErrorKind::MissingJoin,
                Severity::Info,
                "Implicit join (comma-separated tables) detected",
                "Use explicit JOIN syntax for clarity",
            ));
        }

        debug!(
            errors = errors.len(),
            warnings = warnings.len(),
            tables = distinct.len(),
            "sql validated"
        );

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn check_dangerous(&self, upper: &str) -> Vec<ValidationIssue> {
        DANGEROUS
            .iter()
            .filter(|(re, _)| re.is_match(upper))
            .map(|(re, message)| {
                let message = match *message {
                    "DELETE operation detected" if !WHERE.is_match(upper) => {
                        "DELETE without WHERE clause"
                    }
                    "UPDATE operation detected" if !WHERE.is_match(upper) => {
                        "UPDATE without WHERE clause"
                    }
                    other => other,
                };
                debug!(pattern = %re.as_str(), "dangerous statement");
                ValidationIssue::new(
                    ValidationErrorKind::DangerousQuery,
                    Severity::Error,
                    message,
                    "Only SELECT queries are allowed",
                )
            })
            .collect()
    }

    fn check_parentheses(&self, code: &str) -> Option<ValidationIssue> {
        let mut depth: i64 = 0;
        for c in code.chars() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
        (depth != 0).then(|| {
            ValidationIssue::new(
                ValidationErrorKind::SyntaxError,
                Severity::Error,
                "Unbalanced parentheses",
                "Check that every '(' has a matching ')'",
            )
        })
    }

    fn check_tables(&self, refs: &[TableRef]) -> Vec<ValidationIssue> {
        let mut seen = BTreeSet::new();
        refs.iter()
            .filter(|r| seen.insert(r.name.as_str()))
            .filter(|r| !self.tables.contains(&r.name))
            .map(|r| {
                let suggestion = match self.find_similar(&r.name, self.tables.iter()) {
                    Some(similar) => format!("Did you mean '{}'?", similar),
                    None => "Check available tables".to_string(),
                };
                ValidationIssue::new(
                    ValidationErrorKind::InvalidTable,
                    Severity::Error,
                    format!("Table '{}' does not exist", r.name),
                    suggestion,
                )
            })
            .collect()
    }

    fn check_columns(&self, sql: &str, refs: &[TableRef]) -> Vec<ValidationIssue> {
        let mut aliases: BTreeMap<&str, &str> = BTreeMap::new();
        for r in refs {
            aliases.insert(r.name.as_str(), r.name.as_str());
            if let Some(alias) = &r.alias {
                aliases.insert(alias.as_str(), r.name.as_str());
            }
        }

        let mut seen = BTreeSet::new();
        let mut issues = Vec::new();
        for (qualifier, column) in qualified_columns(sql) {
            let Some(table) = aliases.get(qualifier.as_str()) else {
                continue;
            };
            let Some(known) = self.columns.get(*table) else {
                continue;
            };
            if known.contains(&column) || !seen.insert((table.to_string(), column.clone())) {
                continue;
            }
            let suggestion = match self.find_similar(&column, known.iter()) {
                Some(similar) => format!("Did you mean '{}'?", similar),
                None => "Check available columns".to_string(),
            };
            issues.push(ValidationIssue::new(
                ValidationErrorKind::InvalidColumn,
                Severity::Error,
                format!("Column '{}' does not exist in table '{}'", column, table),
                suggestion,
            ));
        }
        issues
    }

    /// Closest candidate to `name`.
    ///
    /// Containment scores `len(name) / len(longer)` and always qualifies;
    /// otherwise the character-set overlap must reach the threshold.
    pub fn find_similar<'a, I>(&self, name: &str, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        similar_name(name, candidates, self.similarity_threshold)
    }

    /// Render errors and the first three warnings as a correction request
    pub fn generate_error_feedback(&self, result: &ValidationResult) -> String {
        if result.is_valid {
            return String::new();
        }

        let mut lines = vec!["The SQL query has the following issues:\n".to_string()];
        for error in &result.errors {
            lines.push(format!("- ERROR: {}", error.message));
            lines.push(format!("  Suggestion: {}", error.suggestion));
        }
        for warning in result.warnings.iter().take(3) {
            lines.push(format!("- WARNING: {}", warning.message));
        }
        lines.push("\nPlease fix these issues and generate a corrected query.".to_string());
        lines.join("\n")
    }
}

/// Closest name to `name` among `candidates` by containment or
/// character-set overlap
pub fn similar_name<'a, I>(name: &str, candidates: I, threshold: f32) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let name = name.to_lowercase();
    if name.is_empty() {
        return None;
    }
    let name_chars: BTreeSet<char> = name.chars().collect();

    let mut best: Option<&String> = None;
    let mut best_score: f32 = 0.0;
    for candidate in candidates {
        let lower = candidate.to_lowercase();
        if lower.is_empty() {
            continue;
        }

        if lower.contains(&name) || name.contains(&lower) {
            let score = name.len() as f32 / name.len().max(lower.len()) as f32;
            if score > best_score {
                best_score = score;
                best = Some(candidate);
            }
        }

        let cand_chars: BTreeSet<char> = lower.chars().collect();
        let common = name_chars.intersection(&cand_chars).count();
        let score = common as f32 / name_chars.len().max(cand_chars.len()) as f32;
        if score > best_score && score >= threshold {
            best_score = score;
            best = Some(candidate);
        }
    }
    best.cloned()
}
