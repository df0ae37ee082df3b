//! Prompt assembly with cached static components
//!
//! A prompt is split into a static part that only changes with the schema
//! (base instructions, rendered schema, few-shot examples) and a dynamic
//! part (conversation history and the question). The static part is cached
//! at the prompt level under the schema version so a schema change drops it.
//!
//! ```text
//! system:  base instructions
//!          ## Database Schema
//!          ## Query Hints      (when a pattern was detected)
//!          ## Examples         (pattern/table specific, else the defaults)
//! history: last `history_window` messages
//! user:    question
//! ```

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sluice_core::cache::{hash_key, CacheLevel, CacheStore};
use sluice_core::config::SqlDialect;
use sluice_core::schema::SchemaDefinition;

use crate::plan::QueryPattern;
use crate::types::ChatMessage;

/// Rough characters per token
const CHARS_PER_TOKEN: usize = 4;

/// Rough token count of `text`
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// A worked question → SQL pair shown to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    /// Question
    pub question: String,
    /// SQL answering it
    pub query: String,
    /// Explanation
    pub explanation: String,
    /// Tables involved
    #[serde(default)]
    pub tables_used: Vec<String>,
}

impl FewShotExample {
    fn new(question: &str, query: &str, explanation: &str, tables: &[&str]) -> Self {
        Self {
            question: question.to_string(),
            query: query.to_string(),
            explanation: explanation.to_string(),
            tables_used: tables.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Built-in examples used when none are configured
pub fn default_examples() -> Vec<FewShotExample> {
    vec![
        FewShotExample::new(
            "Show me all users",
            "SELECT * FROM users LIMIT 100",
            "All columns of users, bounded to 100 rows",
            &["users"],
        ),
        FewShotExample::new(
            "How many users do we have?",
            "SELECT COUNT(*) AS total_users FROM users",
            "Counts the rows of users",
            &["users"],
        ),
        FewShotExample::new(
            "List orders with the customer's name",
            "SELECT o.id, o.total_amount, u.name FROM orders o INNER JOIN users u ON o.user_id = u.id LIMIT 100",
            "Joins orders to users through the user_id foreign key",
            &["orders", "users"],
        ),
        FewShotExample::new(
            "What's the average order amount?",
            "SELECT AVG(total_amount) AS average_amount FROM orders",
            "Average of total_amount over all orders",
            &["orders"],
        ),
        FewShotExample::new(
            "Top 10 customers by total spending",
            "SELECT u.id, u.name, SUM(o.total_amount) AS spent FROM users u INNER JOIN orders o ON o.user_id = u.id GROUP BY u.id, u.name ORDER BY spent DESC LIMIT 10",
            "Sums order totals per user and keeps the ten largest",
            &["users", "orders"],
        ),
        FewShotExample::new(
            "Orders placed in the last 30 days",
            "SELECT * FROM orders WHERE order_date >= CURRENT_DATE - INTERVAL '30 days' LIMIT 100",
            "Filters orders to a trailing 30-day window",
            &["orders"],
        ),
        FewShotExample::new(
            "Users who never placed an order",
            "SELECT u.id, u.name FROM users u WHERE NOT EXISTS (SELECT 1 FROM orders o WHERE o.user_id = u.id) LIMIT 100",
            "Anti-join through NOT EXISTS",
            &["users", "orders"],
        ),
    ]
}

/// Render examples as prompt text
pub fn format_examples(examples: &[FewShotExample]) -> String {
    let mut out = String::from("Example conversions from questions to SQL:\n");
    for (i, example) in examples.iter().enumerate() {
        let _ = write!(
            out,
            "\nExample {}:\nQuestion: {}\nSQL: {}\nExplanation: {}\n",
            i + 1,
            example.question,
            example.query,
            example.explanation
        );
    }
    out
}

/// Render a schema as compact prompt text
pub fn render_schema(schema: &SchemaDefinition) -> String {
    let mut out = String::new();
    for (name, table) in &schema.tables {
        let _ = writeln!(out, "Table: {}", name);
        for column in &table.columns {
            let mut flags = String::new();
            if column.is_primary_key {
                flags.push_str(" PRIMARY KEY");
            }
            if !column.nullable && !column.is_primary_key {
                flags.push_str(" NOT NULL");
            }
            let _ = writeln!(out, "  - {} {}{}", column.name, column.data_type, flags);
        }
        for fk in &table.foreign_keys {
            let _ = writeln!(
                out,
                "  FK: {} -> {}.{}",
                fk.column, fk.ref_table, fk.ref_column
            );
        }
    }
    out
}

fn base_instructions(dialect: SqlDialect) -> String {
    let dialect = dialect.to_string().to_uppercase();
    format!(
        "You translate questions into {dialect} SQL.\n\
         \n\
         Rules:\n\
         - Generate a single read-only SELECT statement. Never modify data or schema.\n\
         - Use only the tables and columns in the schema below; never invent names.\n\
         - Prefer explicit JOIN ... ON over comma joins, and follow the foreign keys.\n\
         - Qualify columns with table aliases when more than one table is involved.\n\
         - Add a LIMIT to queries that return rows rather than aggregates.\n\
         - Use {dialect} date functions.\n\
         - If the schema cannot answer the question, say so in potential_issues and set confidence to 0.\n\
         - When unsure of intent, keep confidence below 0.7 and state the assumption."
    )
}

fn query_hints(pattern: QueryPattern) -> Option<&'static str> {
    let hints = match pattern {
        QueryPattern::TopN | QueryPattern::Ranking => {
            "- ORDER BY the ranking metric (DESC for highest)\n- LIMIT to the requested N\n- Think about ties"
        }
        QueryPattern::Count | QueryPattern::Aggregate => {
            "- Use COUNT, SUM, AVG, MIN, MAX\n- GROUP BY when aggregating per category\n- Filter aggregates with HAVING"
        }
        QueryPattern::GroupBy => {
            "- Every non-aggregated selected column belongs in GROUP BY\n- Use HAVING for aggregate conditions\n- Order groups when a ranking is implied"
        }
        QueryPattern::Filter | QueryPattern::TimeRange => {
            "- Use =, <>, <, >, LIKE, IN, BETWEEN as needed\n- Handle NULL with IS NULL / IS NOT NULL\n- Parenthesize mixed AND/OR"
        }
        QueryPattern::Exists => {
            "- Use EXISTS / NOT EXISTS or NOT IN subqueries\n- A LEFT JOIN ... IS NULL is an alternative anti-join"
        }
        QueryPattern::List => "- Select specific columns\n- Add a LIMIT",
        QueryPattern::Comparison => {
            "- Compute each side in the same query (CASE or grouped aggregates)\n- Label the compared values clearly"
        }
        QueryPattern::Unknown => return None,
    };
    Some(hints)
}

/// Static prompt parts cached per schema version, dialect and example set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptComponents {
    /// Base instructions
    pub system_prompt: String,
    /// Rendered schema
    pub schema_text: String,
    /// Default few-shot block
    pub few_shot_examples: String,
    /// Schema version the parts were built for
    pub schema_version: Option<String>,
    /// Build time
    pub cached_at: DateTime<Utc>,
    /// Token estimates
    pub system_tokens: usize,
    /// Token estimate of the schema
    pub schema_tokens: usize,
    /// Token estimate of the examples
    pub examples_tokens: usize,
}

impl PromptComponents {
    /// Total estimated tokens of the static parts
    pub fn total_tokens(&self) -> usize {
        self.system_tokens + self.schema_tokens + self.examples_tokens
    }
}

/// A prompt ready for the completion collaborator
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    /// System prompt
    pub system: String,
    /// History followed by the question
    pub messages: Vec<ChatMessage>,
    /// Static parts came from the cache
    pub components_cached: bool,
    /// Pattern/table specific examples came from the cache
    pub examples_cached: bool,
    /// Rough size of the whole prompt
    pub estimated_tokens: usize,
}

/// Inputs for one prompt
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    /// The question
    pub question: &'a str,
    /// Current schema
    pub schema: &'a SchemaDefinition,
    /// Current schema version
    pub schema_version: Option<&'a str>,
    /// Detected pattern, if any
    pub pattern: Option<QueryPattern>,
    /// Tables the question mentions
    pub relevant_tables: &'a [String],
    /// Earlier conversation
    pub history: &'a [ChatMessage],
}

/// Builds prompts, caching the static parts through the cache store
pub struct PromptBuilder {
    store: Arc<CacheStore>,
    dialect: SqlDialect,
    history_window: usize,
    examples: Vec<FewShotExample>,
    enable_few_shot: bool,
}

impl PromptBuilder {
    /// Builder with the default examples
    pub fn new(store: Arc<CacheStore>, dialect: SqlDialect, history_window: usize) -> Self {
        Self {
            store,
            dialect,
            history_window,
            examples: default_examples(),
            enable_few_shot: true,
        }
    }

    /// Replace the example set
    pub fn with_examples(mut self, examples: Vec<FewShotExample>) -> Self {
        self.examples = examples;
        self
    }

    /// Turn few-shot examples off
    pub fn without_examples(mut self) -> Self {
        self.enable_few_shot = false;
        self
    }

    /// Dialect prompts are written for
    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    fn components_key(&self, schema_version: Option<&str>) -> String {
        let material = format!(
            "{}:{}:{}",
            schema_version.unwrap_or("none"),
            self.dialect,
            self.enable_few_shot
        );
        format!("components:{}", hash_key(&material))
    }

    /// Static components for `schema`, from the cache when possible.
    /// Returns the components and whether they were cached.
    pub fn components(
        &self,
        schema: &SchemaDefinition,
        schema_version: Option<&str>,
    ) -> (PromptComponents, bool) {
        let key = self.components_key(schema_version);
        if let Some(cached) = self
            .store
            .get::<PromptComponents>(&key, CacheLevel::Prompt, true)
        {
            debug!(key = %key, "prompt components cache hit");
            return (cached, true);
        }

        let system_prompt = base_instructions(self.dialect);
        let schema_text = render_schema(schema);
        let few_shot_examples = if self.enable_few_shot {
            format_examples(&self.examples)
        } else {
            String::new()
        };
        let components = PromptComponents {
            system_tokens: estimate_tokens(&system_prompt),
            schema_tokens: estimate_tokens(&schema_text),
            examples_tokens: estimate_tokens(&few_shot_examples),
            system_prompt,
            schema_text,
            few_shot_examples,
            schema_version: schema_version.map(str::to_string),
            cached_at: Utc::now(),
        };
        self.store
            .set(&key, &components, CacheLevel::Prompt, None, schema_version);
        debug!(key = %key, tokens = components.total_tokens(), "prompt components built");
        (components, false)
    }

    /// Examples relevant to `pattern` and `tables`, cached at the examples
    /// level. Returns the text and whether it was cached.
    pub fn relevant_examples(
        &self,
        pattern: QueryPattern,
        tables: &[String],
    ) -> Option<(String, bool)> {
        let mut key_tables: Vec<String> = tables.iter().map(|t| t.to_lowercase()).collect();
        key_tables.sort();
        key_tables.truncate(3);
        let key = format!("examples:{}:{}", pattern, key_tables.join(":"));

        if let Some(text) = self.store.get_examples::<String>(&key) {
            return Some((text, true));
        }

        let mut scored: Vec<(usize, &FewShotExample)> = self
            .examples
            .iter()
            .map(|example| {
                let overlap = example
                    .tables_used
                    .iter()
                    .filter(|t| key_tables.iter().any(|k| k.eq_ignore_ascii_case(t)))
                    .count();
                (overlap, example)
            })
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        if scored.is_empty() {
            return None;
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        let picked: Vec<FewShotExample> =
            scored.into_iter().take(3).map(|(_, e)| e.clone()).collect();

        let text = format_examples(&picked);
        self.store.cache_examples(&key, &text);
        Some((text, false))
    }

    /// Assemble the full prompt for a question
    pub fn build(&self, request: PromptRequest<'_>) -> BuiltPrompt {
        let (components, components_cached) =
            self.components(request.schema, request.schema_version);

        let mut system = components.system_prompt.clone();
        let _ = write!(system, "\n\n## Database Schema\n{}", components.schema_text);

        if let Some(hints) = request.pattern.and_then(query_hints) {
            let _ = write!(system, "\n\n## Query Hints\n{}", hints);
        }

        let mut examples_cached = false;
        if self.enable_few_shot {
            let specific = match request.pattern {
                Some(pattern) if !request.relevant_tables.is_empty() => {
                    self.relevant_examples(pattern, request.relevant_tables)
                }
                _ => None,
            };
            let examples = match specific {
                Some((text, cached)) => {
                    examples_cached = cached;
                    text
                }
                None => components.few_shot_examples.clone(),
            };
            let _ = write!(system, "\n\n## Examples\n{}", examples);
        }

        let skip = request.history.len().saturating_sub(self.history_window);
        let mut messages: Vec<ChatMessage> = request.history[skip..].to_vec();
        messages.push(ChatMessage::user(request.question));

        let estimated_tokens = estimate_tokens(&system)
            + messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<usize>();

        BuiltPrompt {
            system,
            messages,
            components_cached,
            examples_cached,
            estimated_tokens,
        }
    }

    /// Follow-up turns asking the model to repair `failed_sql`; appended to
    /// the original conversation
    pub fn correction_turns(
        &self,
        failed_sql: &str,
        feedback: &str,
        schema: &SchemaDefinition,
    ) -> [ChatMessage; 2] {
        let tables = schema.table_names().join(", ");
        let request = format!(
            "The query above is not valid for this {} database.\n\n{}\n\nAvailable tables: {}\n\n\
             Return a corrected query that uses only the available tables and still answers the question.",
            self.dialect, feedback, tables
        );
        [
            ChatMessage::assistant(format!("```sql\n{}\n```", failed_sql)),
            ChatMessage::user(request),
        ]
    }

    /// Drop cached prompt components
    pub fn invalidate(&self) -> usize {
        self.store.invalidate_level(CacheLevel::Prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::schema::{ColumnInfo, TableInfo};

    fn schema() -> SchemaDefinition {
        SchemaDefinition::new()
            .with_table(
                "users",
                TableInfo::new(vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("name", "TEXT").not_null(),
                ]),
            )
            .with_table(
                "orders",
                TableInfo::new(vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("user_id", "INTEGER"),
                ])
                .with_foreign_key("user_id", "users", "id"),
            )
    }

    fn builder() -> PromptBuilder {
        let store = Arc::new(CacheStore::in_memory());
        store.update_schema_version("v1");
        PromptBuilder::new(store, SqlDialect::Postgres, 2)
    }

    fn request<'a>(
        schema: &'a SchemaDefinition,
        history: &'a [ChatMessage],
        tables: &'a [String],
        pattern: Option<QueryPattern>,
    ) -> PromptRequest<'a> {
        PromptRequest {
            question: "how many users",
            schema,
            schema_version: Some("v1"),
            pattern,
            relevant_tables: tables,
            history,
        }
    }

    #[test]
    fn test_render_schema() {
        let text = render_schema(&schema());
        assert!(text.contains("Table: users\n  - id INTEGER PRIMARY KEY\n  - name TEXT NOT NULL"));
        assert!(text.contains("  FK: user_id -> users.id"));
    }

    #[test]
    fn test_components_cached_per_version() {
        let b = builder();
        let s = schema();
        let (first, cached) = b.components(&s, Some("v1"));
        assert!(!cached);
        let (second, cached) = b.components(&s, Some("v1"));
        assert!(cached);
        assert_eq!(first, second);

        let (_, cached) = b.components(&s, Some("v2"));
        assert!(!cached);
    }

    #[test]
    fn test_build_sections_and_history_window() {
        let b = builder();
        let s = schema();
        let history = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("SELECT 1"),
            ChatMessage::user("second"),
        ];
        let prompt = b.build(request(&s, &history, &[], Some(QueryPattern::Count)));

        assert!(prompt.system.contains("POSTGRES SQL"));
        assert!(prompt.system.contains("## Database Schema\nTable: orders"));
        assert!(prompt.system.contains("## Query Hints\n- Use COUNT"));
        assert!(prompt.system.contains("## Examples\n"));
        assert_eq!(prompt.messages.len(), 3);
        assert_eq!(prompt.messages[0].content, "SELECT 1");
        assert_eq!(prompt.messages[2], ChatMessage::user("how many users"));
        assert!(prompt.estimated_tokens > 0);
    }

    #[test]
    fn test_relevant_examples_cached() {
        let b = builder();
        let s = schema();
        let tables = vec!["orders".to_string()];

        let prompt = b.build(request(&s, &[], &tables, Some(QueryPattern::Aggregate)));
        assert!(!prompt.examples_cached);
        assert!(prompt.system.contains("AVG(total_amount)"));

        let prompt = b.build(request(&s, &[], &tables, Some(QueryPattern::Aggregate)));
        assert!(prompt.examples_cached);
        assert!(prompt.components_cached);
    }

    #[test]
    fn test_without_examples() {
        let b = builder().without_examples();
        let s = schema();
        let prompt = b.build(request(&s, &[], &[], None));
        assert!(!prompt.system.contains("## Examples"));
        assert!(!prompt.system.contains("## Query Hints"));
    }

    #[test]
    fn test_correction_turns() {
        let b = builder();
        let [failed, request] = b.correction_turns(
            "SELECT COUNT(*) FROM user",
            "- ERROR: Table 'user' does not exist",
            &schema(),
        );
        assert_eq!(failed, ChatMessage::assistant("```sql\nSELECT COUNT(*) FROM user\n```"));
        assert!(request.content.contains("this postgres database"));
        assert!(request.content.contains("- ERROR: Table 'user' does not exist"));
        assert!(request.content.contains("Available tables: orders, users"));
    }

    #[test]
    fn test_invalidate_drops_components() {
        let b = builder();
        let s = schema();
        b.components(&s, Some("v1"));
        assert_eq!(b.invalidate(), 1);
        let (_, cached) = b.components(&s, Some("v1"));
        assert!(!cached);
    }
}
