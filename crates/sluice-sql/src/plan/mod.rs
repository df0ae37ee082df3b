//! Query pattern detection and plan caching
//!
//! Questions that differ only in their literals ("top 5" vs "top 20") share
//! a structural pattern. The detector names the pattern; the plan cache
//! keeps one SQL template per pattern and table set.
//!
//! # Patterns
//!
//! | Pattern | Example | Extracted |
//! |---------|---------|-----------|
//! | `top_n` | "top 5 products by price" | `limit` |
//! | `count` | "how many users" | |
//! | `aggregate` | "average order value" | `agg_func` |
//! | `list` | "show all customers" | |
//! | `time_range` | "orders in the last 30 days" | `time_value`, `time_unit` |
//! | `filter` | "products over 100" | `threshold` |
//! | `group_by` | "revenue by region" | `group_column` |
//! | `exists` | "customers who never ordered" | |
//! | `ranking` | "sorted names" | |
//! | `comparison` | "compare sales vs returns" | |
//!
//! # Example
//!
//! ```ignore
//! let plans = QueryPlanCache::new(store, PlanCacheConfig::default());
//! plans.put("top 5 products by price", sql, &tables, &columns, 0.9);
//!
//! if let Some((plan, params)) = plans.get("top 20 products by price", Some(&tables)) {
//!     let sql = QueryPlanCache::fill_template(&plan, &params);
//! }
//! ```

mod cache;
mod detector;

pub use cache::{PlanStats, QueryPlan, QueryPlanCache};
pub use detector::{PatternMatch, QueryPattern, QueryPatternDetector};
