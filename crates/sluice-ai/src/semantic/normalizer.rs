//! Question normalization and intent extraction
//!
//! Normalization maps surface variants of a question onto one string so
//! the exact cache can match them and the embedder sees less noise:
//!
//! | Step | Example |
//! |------|---------|
//! | lowercase, trim, collapse whitespace | `"  How  MANY users "` → `"how many users"` |
//! | number words two..twenty to digits | `"top five"` → `"top 5"` |
//! | dates to `<DATE>` | `"since 2024-01-31"` → `"since <DATE>"` |
//! | numbers ≥ 20 to `<NUM>` | `"over 250 orders"` → `"over <NUM> orders"` |
//! | emails to `<EMAIL>` | `"by a@b.io"` → `"by <EMAIL>"` |
//!
//! Small numbers are kept because they usually carry meaning ("top 5").

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[-/]\d{1,2}[-/]\d{1,2}\b|\b\d{1,2}[-/]\d{1,2}[-/]\d{4}\b")
        .expect("valid date regex")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid number regex"));

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w.-]+@[\w.-]+\.\w+\b").expect("valid email regex"));

static NUMBER_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty)\b",
    )
    .expect("valid number word regex")
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(date|num|email)>").expect("valid placeholder regex"));

/// Numbers at or above this are abstracted to `<NUM>`
const SMALL_NUMBER_LIMIT: f64 = 20.0;

fn number_word_value(word: &str) -> &'static str {
    match word {
        "two" => "2",
        "three" => "3",
        "four" => "4",
        "five" => "5",
        "six" => "6",
        "seven" => "7",
        "eight" => "8",
        "nine" => "9",
        "ten" => "10",
        "eleven" => "11",
        "twelve" => "12",
        "thirteen" => "13",
        "fourteen" => "14",
        "fifteen" => "15",
        "sixteen" => "16",
        "seventeen" => "17",
        "eighteen" => "18",
        "nineteen" => "19",
        _ => "20",
    }
}

// ============================================================================
// Intent
// ============================================================================

/// Aggregation asked for by a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// COUNT
    Count,
    /// SUM
    Sum,
    /// AVG
    Avg,
    /// MAX / top
    Max,
    /// MIN
    Min,
}

impl Aggregation {
    /// Label used for intent matching
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
        }
    }
}

/// Shape of the requested result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Plain selection
    Select,
    /// Comparison between groups
    Compare,
    /// Ordered ranking
    Rank,
    /// Grouped breakdown
    Group,
}

impl Operation {
    /// Label used for intent matching
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Compare => "compare",
            Operation::Rank => "rank",
            Operation::Group => "group",
        }
    }
}

/// Time window mentioned in a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporal {
    /// today
    Today,
    /// this/last week
    Week,
    /// this/last month
    Month,
    /// this/last year
    Year,
    /// explicit from..to / between
    Range,
}

/// Coarse intent features of a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Aggregation, if any
    pub aggregation: Option<Aggregation>,
    /// Operation kind
    pub operation: Operation,
    /// Temporal scope, if any
    pub temporal: Option<Temporal>,
}

impl Intent {
    /// Single label for type-aware matching: the aggregation when present,
    /// otherwise the operation
    pub fn label(&self) -> &'static str {
        match self.aggregation {
            Some(agg) => agg.as_str(),
            None => self.operation.as_str(),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct Rules {
    aggregation: Vec<(Aggregation, Regex)>,
    compare: Regex,
    rank: Regex,
    group: Regex,
    temporal: Vec<(Temporal, Regex)>,
}

static RULES: LazyLock<Rules> = LazyLock::new(|| {
    let re = |pattern: &str| Regex::new(pattern).expect("valid intent regex");
    Rules {
        aggregation: vec![
            (Aggregation::Count, re(r"\bcount\b|\bhow many\b|\bnumber of\b")),
            (Aggregation::Sum, re(r"\bsum\b|\btotal\b")),
            (Aggregation::Avg, re(r"\bavg\b|\baverage\b|\bmean\b")),
            (Aggregation::Max, re(r"\bmax\b|\bmaximum\b|\bhighest\b|\btop\b")),
            (Aggregation::Min, re(r"\bmin\b|\bminimum\b|\blowest\b")),
        ],
        compare: re(r"\bcompare\b|\bvs\b|\bversus\b"),
        rank: re(r"\btop\b|\brank\b|\branking\b"),
        group: re(r"\bgroup\b|\bby\s+\w+\b|\bper\s+\w+\b"),
        temporal: vec![
            (Temporal::Today, re(r"\btoday\b")),
            (Temporal::Week, re(r"\b(this|last) week\b")),
            (Temporal::Month, re(r"\b(this|last) month\b")),
            (Temporal::Year, re(r"\b(this|last) year\b")),
            (Temporal::Range, re(r"\bfrom\s+\S+\s+to\b|\bbetween\b")),
        ],
    }
});

// ============================================================================
// Normalizer
// ============================================================================

/// Canonical English question normalizer
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryNormalizer;

impl QueryNormalizer {
    /// Normalize `question` for hashing and embedding. Idempotent.
    pub fn normalize(question: &str) -> String {
        let lowered = question.to_lowercase();
        let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
        // Placeholders from an earlier pass were lowercased above
        let text = PLACEHOLDER.replace_all(&collapsed, |caps: &Captures<'_>| {
            format!("<{}>", caps[1].to_uppercase())
        });

        let text = NUMBER_WORD.replace_all(&text, |caps: &Captures<'_>| {
            number_word_value(&caps[1]).to_string()
        });
        let text = DATE.replace_all(&text, "<DATE>");
        let text = NUMBER.replace_all(&text, |caps: &Captures<'_>| {
            let raw = &caps[0];
            match raw.parse::<f64>() {
                Ok(n) if n >= SMALL_NUMBER_LIMIT => "<NUM>".to_string(),
                _ => raw.to_string(),
            }
        });
        EMAIL.replace_all(&text, "<EMAIL>").into_owned()
    }

    /// Extract coarse intent features from `question`.
    ///
    /// The first matching aggregation in the order count, sum, avg, max,
    /// min wins.
    pub fn intent(question: &str) -> Intent {
        let text = question.to_lowercase();
        let rules = &*RULES;

        let aggregation = rules
            .aggregation
            .iter()
            .find(|(_, re)| re.is_match(&text))
            .map(|(agg, _)| *agg);

        let operation = if rules.compare.is_match(&text) {
            Operation::Compare
        } else if rules.rank.is_match(&text) {
            Operation::Rank
        } else if rules.group.is_match(&text) {
            Operation::Group
        } else {
            Operation::Select
        };

        let temporal = rules
            .temporal
            .iter()
            .find(|(_, re)| re.is_match(&text))
            .map(|(t, _)| *t);

        Intent {
            aggregation,
            operation,
            temporal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_and_case() {
        assert_eq!(
            QueryNormalizer::normalize("  How   MANY users\tare there? "),
            "how many users are there?"
        );
    }

    #[test]
    fn test_small_numbers_kept_large_abstracted() {
        assert_eq!(
            QueryNormalizer::normalize("top 5 orders over 250"),
            "top 5 orders over <NUM>"
        );
        assert_eq!(QueryNormalizer::normalize("price above 19.5"), "price above 19.5");
    }

    #[test]
    fn test_number_words_fold_to_digits() {
        assert_eq!(
            QueryNormalizer::normalize("Top five products by price"),
            QueryNormalizer::normalize("top 5 products by price")
        );
        assert_eq!(QueryNormalizer::normalize("top twenty"), "top <NUM>");
        // "one" is left alone
        assert_eq!(QueryNormalizer::normalize("which one"), "which one");
    }

    #[test]
    fn test_dates_and_emails() {
        assert_eq!(
            QueryNormalizer::normalize("orders since 2024-01-31 and before 31/12/2024"),
            "orders since <DATE> and before <DATE>"
        );
        assert_eq!(
            QueryNormalizer::normalize("orders by jane.doe@example.com"),
            "orders by <EMAIL>"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for q in [
            "Orders since 2024-01-31 by a@b.io over 500",
            "TOP FIVE customers",
            "how many users",
        ] {
            let once = QueryNormalizer::normalize(q);
            assert_eq!(QueryNormalizer::normalize(&once), once);
        }
    }

    #[test]
    fn test_intent_aggregation() {
        assert_eq!(
            QueryNormalizer::intent("How many users are there?").label(),
            "count"
        );
        assert_eq!(QueryNormalizer::intent("average order value").label(), "avg");
        assert_eq!(QueryNormalizer::intent("lowest price").label(), "min");
        assert_eq!(QueryNormalizer::intent("highest price").label(), "max");
    }

    #[test]
    fn test_intent_operation_and_temporal() {
        let intent = QueryNormalizer::intent("Compare revenue this month vs last month");
        assert_eq!(intent.operation, Operation::Compare);
        assert_eq!(intent.temporal, Some(Temporal::Month));
        assert_eq!(intent.label(), "compare");

        let intent = QueryNormalizer::intent("orders grouped by status");
        assert_eq!(intent.operation, Operation::Group);
        assert_eq!(intent.aggregation, None);

        let intent = QueryNormalizer::intent("list customers");
        assert_eq!(intent.label(), "select");
        assert_eq!(intent.temporal, None);

        let intent = QueryNormalizer::intent("sales between march and may");
        assert_eq!(intent.temporal, Some(Temporal::Range));
    }
}
