//! Query-plan cache
//!
//! Stores generated SQL as templates keyed by the question's structural
//! pattern, so "top 5 products by price" and "top 20 products by price"
//! share one plan. Plans are persisted through the cache store's SQL level
//! under `plan:{pattern}:{digest}`; the in-process LRU list only bounds how
//! many are kept.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info};

use sluice_core::cache::{short_digest, CacheLevel, CacheStore};
use sluice_core::config::PlanCacheConfig;

use super::{PatternMatch, QueryPattern, QueryPatternDetector};

/// Parameters that change the SQL's structure and therefore the key
const STRUCTURAL_PARAMS: [&str; 2] = ["agg_func", "group_column"];

/// Limit used when a templated plan is reused without an explicit N
const DEFAULT_LIMIT: &str = "10";

static LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+\d+").expect("valid limit regex"));

static DATE_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'\d{4}-\d{2}-\d{2}'").expect("valid date literal regex"));

static INTERVAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bINTERVAL\s+\d+\s+(DAY|WEEK|MONTH|YEAR)S?\b").expect("valid interval regex")
});

static QUOTED_INTERVAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bINTERVAL\s+'\d+\s+(DAY|WEEK|MONTH|YEAR)S?'")
        .expect("valid quoted interval regex")
});

static COMPARISON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(<=|>=|<>|!=|<|>|=)\s*(\d+(?:\.\d+)?)\b").expect("valid comparison regex")
});

static RUNTIME_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:top|first|best)\s+(\d+)").expect("valid limit regex"));

static RUNTIME_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:last|past)\s+(\d+)\s*(day|week|month|year)").expect("valid time regex")
});

static RUNTIME_THRESHOLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:above|over|greater than|more than|below|under|less than)\s+(\d+(?:\.\d+)?)")
        .expect("valid threshold regex")
});

/// A reusable SQL template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Pattern the plan answers
    pub pattern: QueryPattern,
    /// SQL with `{name}` placeholders
    pub sql_template: String,
    /// Parameters extracted when the plan was stored
    pub parameters: BTreeMap<String, String>,
    /// Tables the SQL reads
    pub tables_used: Vec<String>,
    /// Columns the SQL reads
    pub columns_used: Vec<String>,
    /// Confidence of the generation the plan came from
    pub confidence: f32,
    /// Placeholder names present in the template
    pub placeholders: Vec<String>,
    /// Times the plan was served
    #[serde(default)]
    pub hit_count: u64,
    /// When the plan was stored
    pub created_at: DateTime<Utc>,
}

/// Plan cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct PlanStats {
    /// Plans tracked in the LRU list
    pub size: usize,
    /// Capacity
    pub max_size: usize,
    /// Hits
    pub hits: u64,
    /// Misses
    pub misses: u64,
    /// hits / lookups
    pub hit_rate: f64,
    /// Hits per pattern
    pub pattern_stats: BTreeMap<String, u64>,
    /// Up to five most used patterns, most used first
    pub most_used_patterns: Vec<(String, u64)>,
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    pattern: &'a str,
    tables: Vec<String>,
    key_params: BTreeMap<&'a str, &'a str>,
}

/// Pattern-keyed SQL template cache
pub struct QueryPlanCache {
    store: Arc<CacheStore>,
    detector: QueryPatternDetector,
    config: PlanCacheConfig,
    order: Mutex<VecDeque<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
    pattern_hits: Mutex<BTreeMap<String, u64>>,
}

impl QueryPlanCache {
    /// Create a plan cache persisting through `store`
    pub fn new(store: Arc<CacheStore>, config: PlanCacheConfig) -> Self {
        Self {
            store,
            detector: QueryPatternDetector::new(config.detect_floor),
            config,
            order: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            pattern_hits: Mutex::new(BTreeMap::new()),
        }
    }

    /// The pattern detector used for keys
    pub fn detector(&self) -> &QueryPatternDetector {
        &self.detector
    }

    /// Store key for `pattern`, `tables` and the structural subset of
    /// `params`
    pub fn cache_key(
        pattern: QueryPattern,
        tables: &[String],
        params: &BTreeMap<String, String>,
    ) -> String {
        let mut tables: Vec<String> = tables.iter().map(|t| t.to_lowercase()).collect();
        tables.sort();
        tables.dedup();

        let material = KeyMaterial {
            pattern: pattern.as_str(),
            tables,
            key_params: params
                .iter()
                .filter(|(k, _)| STRUCTURAL_PARAMS.contains(&k.as_str()))
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        };
        let canonical = serde_json::to_string(&material).unwrap_or_default();
        format!("plan:{}:{}", pattern, short_digest(canonical.as_bytes()))
    }

    fn miss(&self) -> Option<(QueryPlan, BTreeMap<String, String>)> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn touch(&self, key: &str) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.to_string());
    }

    /// Look up a plan for `question`.
    ///
    /// Returns the plan and runtime parameters extracted afresh from this
    /// question, ready for [`fill_template`](Self::fill_template).
    pub fn get(
        &self,
        question: &str,
        tables_hint: Option<&[String]>,
    ) -> Option<(QueryPlan, BTreeMap<String, String>)> {
        if !self.config.enabled {
            return None;
        }

        let matched = self.detector.detect(question);
        if matched.pattern == QueryPattern::Unknown
            || matched.confidence < self.config.min_confidence
        {
            return self.miss();
        }

        let key = Self::cache_key(
            matched.pattern,
            tables_hint.unwrap_or(&[]),
            &matched.extracted_params,
        );
        let Some(entry) = self.store.get_entry(&key, CacheLevel::Sql, false) else {
            return self.miss();
        };
        let mut plan: QueryPlan = match serde_json::from_value(entry.value) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(key = %key, error = %e, "stored plan unreadable");
                self.store.invalidate(&key, CacheLevel::Sql);
                return self.miss();
            }
        };
        plan.hit_count = entry.hit_count;

        self.touch(&key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        *self
            .pattern_hits
            .lock()
            .entry(matched.pattern.as_str().to_string())
            .or_insert(0) += 1;

        info!(pattern = %matched.pattern, key = %key, "query plan cache hit");
        let params = Self::runtime_params(question, &matched, &plan);
        Some((plan, params))
    }

    /// Store `sql` as a plan for `question`'s pattern.
    ///
    /// Returns the key, or `None` when the question has no recognizable
    /// pattern. An existing plan under the same key is kept.
    pub fn put(
        &self,
        question: &str,
        sql: &str,
        tables_used: &[String],
        columns_used: &[String],
        confidence: f32,
    ) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let matched = self.detector.detect(question);
        if matched.pattern == QueryPattern::Unknown {
            debug!("unknown pattern, plan not cached");
            return None;
        }

        let key = Self::cache_key(matched.pattern, tables_used, &matched.extracted_params);
        if self.order.lock().iter().any(|k| *k == key) {
            debug!(key = %key, "plan already cached");
            return Some(key);
        }

        let (sql_template, placeholders) = Self::templatize(sql, &matched.extracted_params);
        let plan = QueryPlan {
            pattern: matched.pattern,
            sql_template,
            parameters: matched.extracted_params,
            tables_used: tables_used.to_vec(),
            columns_used: columns_used.to_vec(),
            confidence,
            placeholders,
            hit_count: 0,
            created_at: Utc::now(),
        };

        let evicted: Vec<String> = {
            let mut order = self.order.lock();
            let mut evicted = Vec::new();
            while order.len() >= self.config.max_plans.max(1) {
                match order.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            order.push_back(key.clone());
            evicted
        };
        for oldest in evicted {
            self.store.invalidate(&oldest, CacheLevel::Sql);
        }

        let ttl = Duration::from_secs(self.config.ttl_secs);
        if !self.store.set(&key, &plan, CacheLevel::Sql, Some(ttl), None) {
            self.order.lock().retain(|k| *k != key);
            return None;
        }

        info!(pattern = %plan.pattern, key = %key, "query plan cached");
        Some(key)
    }

    /// Replace literal LIMIT values, dates, intervals and the extracted
    /// threshold in `sql` with placeholders
    pub fn templatize(sql: &str, params: &BTreeMap<String, String>) -> (String, Vec<String>) {
        let mut template = sql.to_string();
        let mut placeholders: Vec<String> = Vec::new();
        let mut mark = |name: &str| {
            if !placeholders.iter().any(|p| p == name) {
                placeholders.push(name.to_string());
            }
        };

        if LIMIT.is_match(&template) {
            template = LIMIT.replace_all(&template, "LIMIT {limit}").into_owned();
            mark("limit");
        }

        if DATE_LITERAL.is_match(&template) {
            template = DATE_LITERAL
                .replace_all(&template, "{date_value}")
                .into_owned();
            mark("date_value");
        }

        if QUOTED_INTERVAL.is_match(&template) {
            template = QUOTED_INTERVAL
                .replace_all(&template, "INTERVAL '{time_value} {time_unit}'")
                .into_owned();
            mark("time_value");
            mark("time_unit");
        }

        if INTERVAL.is_match(&template) {
            template = INTERVAL
                .replace_all(&template, "INTERVAL {time_value} {time_unit}")
                .into_owned();
            mark("time_value");
            mark("time_unit");
        }

        if let Some(threshold) = params.get("threshold") {
            let wanted: Option<f64> = threshold.parse().ok();
            let mut replaced = false;
            template = COMPARISON
                .replace_all(&template, |caps: &Captures<'_>| {
                    let literal: Option<f64> = caps[2].parse().ok();
                    if literal.is_some() && literal == wanted {
                        replaced = true;
                        format!("{} {{threshold}}", &caps[1])
                    } else {
                        caps[0].to_string()
                    }
                })
                .into_owned();
            if replaced {
                mark("threshold");
            }
        }

        placeholders.sort();
        (template, placeholders)
    }

    fn runtime_params(
        question: &str,
        matched: &PatternMatch,
        plan: &QueryPlan,
    ) -> BTreeMap<String, String> {
        let text = question.to_lowercase();
        let needs = |name: &str| plan.placeholders.iter().any(|p| p == name);
        let mut params = BTreeMap::new();

        if needs("limit") {
            let limit = RUNTIME_LIMIT
                .captures(&text)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| DEFAULT_LIMIT.to_string());
            params.insert("limit".to_string(), limit);
        }

        if needs("time_value") {
            let (value, unit) = RUNTIME_TIME
                .captures(&text)
                .map(|c| (c[1].to_string(), c[2].to_uppercase()))
                .unwrap_or_else(|| ("7".to_string(), "DAY".to_string()));
            params.insert("time_value".to_string(), value);
            params.insert("time_unit".to_string(), unit);
        }

        if needs("threshold") {
            if let Some(c) = RUNTIME_THRESHOLD.captures(&text) {
                params.insert("threshold".to_string(), c[1].to_string());
            }
        }

        for (k, v) in &matched.extracted_params {
            let v = if k == "time_unit" { v.to_uppercase() } else { v.clone() };
            params.insert(k.clone(), v);
        }
        params
    }

    /// Substitute `{name}` placeholders. Placeholders without a value are
    /// left in place; a result containing `{` is a failed fill.
    pub fn fill_template(plan: &QueryPlan, params: &BTreeMap<String, String>) -> String {
        let mut sql = plan.sql_template.clone();
        for (key, value) in params {
            let placeholder = format!("{{{}}}", key);
            if sql.contains(&placeholder) {
                sql = sql.replace(&placeholder, value);
            }
        }
        sql
    }

    /// Whether a filled template still has unresolved placeholders
    pub fn is_unfilled(sql: &str) -> bool {
        sql.contains('{')
    }

    /// Drop every plan, or only those for `pattern`
    pub fn invalidate(&self, pattern: Option<QueryPattern>) -> usize {
        let key_prefix = match pattern {
            Some(p) => format!("plan:{}:", p),
            None => "plan:".to_string(),
        };
        self.order.lock().retain(|k| !k.starts_with(&key_prefix));
        let removed = self.store.invalidate_prefix(CacheLevel::Sql, &key_prefix);
        info!(prefix = %key_prefix, removed, "query plans invalidated");
        removed
    }

    /// Cache statistics
    pub fn stats(&self) -> PlanStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let pattern_stats = self.pattern_hits.lock().clone();

        let mut most_used: Vec<(String, u64)> =
            pattern_stats.iter().map(|(k, v)| (k.clone(), *v)).collect();
        most_used.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_used.truncate(5);

        PlanStats {
            size: self.order.lock().len(),
            max_size: self.config.max_plans,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            pattern_stats,
            most_used_patterns: most_used,
        }
    }

    /// Reset hit/miss counters
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.pattern_hits.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(config: PlanCacheConfig) -> QueryPlanCache {
        QueryPlanCache::new(Arc::new(CacheStore::in_memory()), config)
    }

    fn cache() -> QueryPlanCache {
        cache_with(PlanCacheConfig::default())
    }

    fn tables() -> Vec<String> {
        vec!["products".to_string()]
    }

    #[test]
    fn test_top_n_plan_reused_with_new_limit() {
        let cache = cache();
        let key = cache.put(
            "top 5 products by price",
            "SELECT name, price FROM products ORDER BY price DESC LIMIT 5",
            &tables(),
            &["name".to_string(), "price".to_string()],
            0.9,
        );
        assert!(key.unwrap().starts_with("plan:top_n:"));

        let (plan, params) = cache
            .get("top 20 products by price", Some(&tables()))
            .unwrap();
        assert_eq!(plan.placeholders, vec!["limit".to_string()]);
        let sql = QueryPlanCache::fill_template(&plan, &params);
        assert_eq!(
            sql,
            "SELECT name, price FROM products ORDER BY price DESC LIMIT 20"
        );
        assert!(!QueryPlanCache::is_unfilled(&sql));
    }

    #[test]
    fn test_different_tables_miss() {
        let cache = cache();
        cache.put(
            "top 5 products by price",
            "SELECT * FROM products LIMIT 5",
            &tables(),
            &[],
            0.9,
        );
        assert!(cache
            .get("top 5 products by price", Some(&["orders".to_string()]))
            .is_none());
        assert!(cache.get("top 5 products by price", None).is_none());
    }

    #[test]
    fn test_unknown_pattern_not_stored() {
        let cache = cache();
        assert!(cache
            .put("hello there", "SELECT 1", &tables(), &[], 0.9)
            .is_none());
    }

    #[test]
    fn test_low_confidence_detection_misses() {
        let cache = cache();
        // keyword-only match scores 0.3, below the 0.7 lookup minimum
        cache.put("sorted names", "SELECT name FROM products ORDER BY name", &tables(), &[], 0.9);
        assert!(cache.get("sorted names", Some(&tables())).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_time_range_template() {
        let cache = cache();
        let orders = vec!["orders".to_string()];
        cache.put(
            "orders in the last 30 days",
            "SELECT * FROM orders WHERE created_at >= NOW() - INTERVAL 30 DAY LIMIT 100",
            &orders,
            &[],
            0.9,
        );
        let (plan, params) = cache
            .get("orders in the last 2 weeks", Some(&orders))
            .unwrap();
        let sql = QueryPlanCache::fill_template(&plan, &params);
        assert!(sql.contains("INTERVAL 2 WEEK"), "{sql}");
        assert!(sql.contains("LIMIT 10"));
    }

    #[test]
    fn test_templatize_threshold_and_dates() {
        let mut params = BTreeMap::new();
        params.insert("threshold".to_string(), "100".to_string());
        let (template, placeholders) = QueryPlanCache::templatize(
            "SELECT * FROM products WHERE price > 100 AND stock > 5 AND added > '2024-01-01'",
            &params,
        );
        assert_eq!(
            template,
            "SELECT * FROM products WHERE price > {threshold} AND stock > 5 AND added > {date_value}"
        );
        assert_eq!(
            placeholders,
            vec!["date_value".to_string(), "threshold".to_string()]
        );
    }

    #[test]
    fn test_unfilled_placeholder_is_detected() {
        let mut params = BTreeMap::new();
        params.insert("threshold".to_string(), "100".to_string());
        let (sql_template, placeholders) =
            QueryPlanCache::templatize("SELECT * FROM t WHERE d > '2024-01-01'", &params);
        let plan = QueryPlan {
            pattern: QueryPattern::Filter,
            sql_template,
            parameters: BTreeMap::new(),
            tables_used: vec![],
            columns_used: vec![],
            confidence: 0.9,
            placeholders,
            hit_count: 0,
            created_at: Utc::now(),
        };
        let sql = QueryPlanCache::fill_template(&plan, &BTreeMap::new());
        assert!(QueryPlanCache::is_unfilled(&sql));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache_with(PlanCacheConfig {
            max_plans: 1,
            ..Default::default()
        });
        cache.put("top 5 products by price", "SELECT 1 LIMIT 5", &tables(), &[], 0.9);
        cache.put("how many products", "SELECT COUNT(*) FROM products", &tables(), &[], 0.9);

        assert!(cache.get("top 5 products by price", Some(&tables())).is_none());
        assert!(cache.get("how many products", Some(&tables())).is_some());
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn test_invalidate_by_pattern_and_stats() {
        let cache = cache();
        cache.put("top 5 products by price", "SELECT 1 LIMIT 5", &tables(), &[], 0.9);
        cache.put("how many products", "SELECT COUNT(*) FROM products", &tables(), &[], 0.9);
        cache.get("how many products", Some(&tables()));
        cache.get("how many products", Some(&tables()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.pattern_stats.get("count"), Some(&2));
        assert_eq!(stats.most_used_patterns[0], ("count".to_string(), 2));

        assert_eq!(cache.invalidate(Some(QueryPattern::TopN)), 1);
        assert!(cache.get("top 5 products by price", Some(&tables())).is_none());
        assert!(cache.get("how many products", Some(&tables())).is_some());
        assert_eq!(cache.invalidate(None), 1);
    }

    #[test]
    fn test_hit_count_tracked() {
        let cache = cache();
        cache.put("how many products", "SELECT COUNT(*) FROM products", &tables(), &[], 0.9);
        cache.get("how many products", Some(&tables()));
        let (plan, _) = cache.get("how many products", Some(&tables())).unwrap();
        assert_eq!(plan.hit_count, 2);
    }
}
