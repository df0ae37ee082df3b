//! Rule-table query pattern detection

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Structural shape of a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPattern {
    /// "top N items by metric"
    TopN,
    /// "how many X"
    Count,
    /// "total/sum/average of X"
    Aggregate,
    /// "list/show all X"
    List,
    /// "X in the last N days"
    TimeRange,
    /// "X where condition"
    Filter,
    /// "X by category"
    GroupBy,
    /// "X that have/never Y"
    Exists,
    /// "rank X by Y"
    Ranking,
    /// "compare X and Y"
    Comparison,
    /// No rule matched well enough
    Unknown,
}

impl QueryPattern {
    /// Stable name used in keys and statistics
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPattern::TopN => "top_n",
            QueryPattern::Count => "count",
            QueryPattern::Aggregate => "aggregate",
            QueryPattern::List => "list",
            QueryPattern::TimeRange => "time_range",
            QueryPattern::Filter => "filter",
            QueryPattern::GroupBy => "group_by",
            QueryPattern::Exists => "exists",
            QueryPattern::Ranking => "ranking",
            QueryPattern::Comparison => "comparison",
            QueryPattern::Unknown => "unknown",
        }
    }

    /// Parse a pattern name
    pub fn parse(name: &str) -> Option<Self> {
        RULES
            .iter()
            .map(|r| r.pattern)
            .chain(std::iter::once(QueryPattern::Unknown))
            .find(|p| p.as_str() == name)
    }
}

impl fmt::Display for QueryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pattern detection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    /// Winning pattern
    pub pattern: QueryPattern,
    /// Rule confidence in [0, 1]
    pub confidence: f32,
    /// Parameters pulled out of the question by the winning rule
    pub extracted_params: BTreeMap<String, String>,
    /// Lowercased, trimmed question
    pub normalized_question: String,
}

/// Confidence of a regex match
const REGEX_CONFIDENCE: f32 = 0.8;
/// Confidence per matched keyword
const KEYWORD_STEP: f32 = 0.3;
/// Keyword-only confidence cap
const KEYWORD_CAP: f32 = 0.6;

struct Rule {
    pattern: QueryPattern,
    regexes: Vec<Regex>,
    keywords: &'static [&'static str],
    extract: Vec<(&'static str, Regex)>,
}

fn rule(
    pattern: QueryPattern,
    regexes: &[&str],
    keywords: &'static [&'static str],
    extract: &[(&'static str, &str)],
) -> Rule {
    let re = |p: &str| Regex::new(p).expect("valid pattern regex");
    Rule {
        pattern,
        regexes: regexes.iter().map(|p| re(p)).collect(),
        keywords,
        extract: extract.iter().map(|(name, p)| (*name, re(p))).collect(),
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            QueryPattern::TopN,
            &[
                r"top\s+(\d+)",
                r"first\s+(\d+)",
                r"best\s+(\d+)",
                r"highest\s+(\d+)",
                r"lowest\s+(\d+)",
            ],
            &["top", "best", "highest", "lowest", "first", "leading"],
            &[("limit", r"(?:top|first|best|highest|lowest)\s+(\d+)")],
        ),
        rule(
            QueryPattern::Count,
            &[r"how many", r"count of", r"number of", r"total count"],
            &["how many", "count", "number of", "total number"],
            &[],
        ),
        rule(
            QueryPattern::Aggregate,
            &[
                r"(?:total|sum|average|avg|mean|min|max|minimum|maximum)\s+(?:of\s+)?",
                r"what is the (?:total|sum|average)",
            ],
            &["total", "sum", "average", "avg", "mean", "min", "max"],
            &[(
                "agg_func",
                r"(total|sum|average|avg|mean|minimum|maximum|min|max)",
            )],
        ),
        rule(
            QueryPattern::List,
            &[
                r"^(?:list|show|display|get|fetch)\s+(?:all\s+)?",
                r"^what are",
                r"^give me",
            ],
            &["list", "show", "display", "all", "get all"],
            &[],
        ),
        rule(
            QueryPattern::TimeRange,
            &[
                r"(?:in|from|during)\s+(?:the\s+)?(?:last|past)\s+(\d+)\s*(day|week|month|year)s?",
                r"(?:this|current)\s+(week|month|year)",
                r"(?:yesterday|today|last week|last month)",
            ],
            &[
                "last",
                "past",
                "recent",
                "this week",
                "this month",
                "yesterday",
                "today",
            ],
            &[
                ("time_value", r"(?:last|past)\s+(\d+)"),
                ("time_unit", r"(?:last|past)\s+\d+\s*(day|week|month|year)s?"),
            ],
        ),
        rule(
            QueryPattern::Filter,
            &[
                r"(?:where|with|having|that have|that has)\s+",
                r"(?:greater|less|more|fewer)\s+than",
                r"(?:equal|equals)\s+to",
            ],
            &["where", "with", "having", "greater than", "less than", "equal"],
            &[(
                "threshold",
                r"(?:above|over|greater than|more than|below|under|less than)\s+(\d+(?:\.\d+)?)",
            )],
        ),
        rule(
            QueryPattern::GroupBy,
            &[r"(?:by|per|for each|grouped by)\s+(\w+)", r"breakdown\s+by"],
            &["by", "per", "each", "grouped", "breakdown"],
            &[("group_column", r"(?:by|per|for each)\s+(\w+)")],
        ),
        rule(
            QueryPattern::Exists,
            &[
                r"(?:that|who|which)\s+(?:have|has|had|never|don't have|doesn't have)",
                r"without\s+(?:any\s+)?",
            ],
            &["never", "without", "don't have", "no orders", "no purchases"],
            &[],
        ),
        rule(
            QueryPattern::Ranking,
            &[r"rank(?:ed|ing)?\s+by", r"order(?:ed)?\s+by"],
            &["rank", "ranked", "ranking", "order by", "sorted"],
            &[],
        ),
        rule(
            QueryPattern::Comparison,
            &[r"compare\s+", r"(?:versus|vs\.?)\s+", r"difference\s+between"],
            &["compare", "versus", "vs", "difference", "comparison"],
            &[],
        ),
    ]
});

/// Classifies questions by walking the rule table
#[derive(Debug, Clone, Copy)]
pub struct QueryPatternDetector {
    floor: f32,
}

impl Default for QueryPatternDetector {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl QueryPatternDetector {
    /// Detector that reports `Unknown` below `floor`
    pub fn new(floor: f32) -> Self {
        Self { floor }
    }

    /// Detect the pattern of `question`.
    ///
    /// A regex hit scores 0.8; keyword hits score 0.3 each up to 0.6. The
    /// first rule with the strictly highest score wins and its extraction
    /// map is applied.
    pub fn detect(&self, question: &str) -> PatternMatch {
        let text = question.trim().to_lowercase();

        let mut best: Option<(&Rule, f32)> = None;
        for rule in RULES.iter() {
            let mut confidence: f32 = 0.0;
            if rule.regexes.iter().any(|re| re.is_match(&text)) {
                confidence = REGEX_CONFIDENCE;
            }
            let keyword_hits = rule.keywords.iter().filter(|kw| text.contains(*kw)).count();
            if keyword_hits > 0 {
                confidence = confidence.max((KEYWORD_STEP * keyword_hits as f32).min(KEYWORD_CAP));
            }

            if confidence > best.map(|(_, c)| c).unwrap_or(0.0) {
                best = Some((rule, confidence));
            }
        }

        match best {
            Some((rule, confidence)) if confidence >= self.floor => {
                let extracted_params = rule
                    .extract
                    .iter()
                    .filter_map(|(name, re)| {
                        re.captures(&text)
                            .and_then(|c| c.get(1))
                            .map(|m| (name.to_string(), m.as_str().to_string()))
                    })
                    .collect();
                PatternMatch {
                    pattern: rule.pattern,
                    confidence,
                    extracted_params,
                    normalized_question: text,
                }
            }
            _ => PatternMatch {
                pattern: QueryPattern::Unknown,
                confidence: 0.0,
                extracted_params: BTreeMap::new(),
                normalized_question: text,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(q: &str) -> PatternMatch {
        QueryPatternDetector::default().detect(q)
    }

    #[test]
    fn test_top_n_with_limit() {
        let m = detect("Top 5 products by price");
        assert_eq!(m.pattern, QueryPattern::TopN);
        assert!((m.confidence - 0.8).abs() < 1e-6);
        assert_eq!(m.extracted_params.get("limit").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_count() {
        let m = detect("How many users are there?");
        assert_eq!(m.pattern, QueryPattern::Count);
        assert!(m.extracted_params.is_empty());
    }

    #[test]
    fn test_aggregate_extracts_function() {
        let m = detect("what is the average order value");
        assert_eq!(m.pattern, QueryPattern::Aggregate);
        assert_eq!(
            m.extracted_params.get("agg_func").map(String::as_str),
            Some("average")
        );
    }

    #[test]
    fn test_time_range_params() {
        let m = detect("orders in the last 30 days");
        assert_eq!(m.pattern, QueryPattern::TimeRange);
        assert_eq!(m.extracted_params["time_value"], "30");
        assert_eq!(m.extracted_params["time_unit"], "day");
    }

    #[test]
    fn test_group_by_column() {
        let m = detect("revenue breakdown by region");
        assert_eq!(m.pattern, QueryPattern::GroupBy);
        assert_eq!(m.extracted_params["group_column"], "region");
    }

    #[test]
    fn test_comparison_and_exists() {
        assert_eq!(detect("compare sales vs returns").pattern, QueryPattern::Comparison);
        assert_eq!(detect("customers who never ordered").pattern, QueryPattern::Exists);
    }

    #[test]
    fn test_earlier_rule_wins_ties() {
        // GROUP_BY and RANKING both match "ranked by"; table order decides
        assert_eq!(detect("customers ranked by spend").pattern, QueryPattern::GroupBy);
    }

    #[test]
    fn test_unknown_below_floor() {
        let m = detect("hello there");
        assert_eq!(m.pattern, QueryPattern::Unknown);
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_keyword_only_confidence() {
        // "sorted" is a keyword but no ranking regex matches
        let m = detect("sorted names");
        assert_eq!(m.pattern, QueryPattern::Ranking);
        assert!((m.confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_pattern_names_round_trip() {
        for name in ["top_n", "time_range", "group_by", "unknown"] {
            assert_eq!(QueryPattern::parse(name).map(|p| p.as_str()), Some(name));
        }
        assert!(QueryPattern::parse("join").is_none());
    }
}
