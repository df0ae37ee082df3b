//! Schema definitions and their canonical hash

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::cache::short_digest;

/// A column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Declared SQL type
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether NULL is allowed
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Part of the primary key
    #[serde(default, alias = "primary_key")]
    pub is_primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnInfo {
    /// Create a nullable, non-key column
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
        }
    }

    /// Mark the column as primary key (and NOT NULL)
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark the column NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// A foreign key constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing column
    pub column: String,
    /// Referenced table
    #[serde(alias = "references_table")]
    pub ref_table: String,
    /// Referenced column
    #[serde(alias = "references_column")]
    pub ref_column: String,
}

/// Structure of a single table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Columns in extraction order
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    /// Foreign keys in extraction order
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Approximate row count; informational, not part of the version hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl TableInfo {
    /// Create a table from its columns
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns,
            foreign_keys: Vec::new(),
            row_count: None,
        }
    }

    /// Add a foreign key
    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        ref_table: impl Into<String>,
        ref_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            ref_table: ref_table.into(),
            ref_column: ref_column.into(),
        });
        self
    }

    /// Column lookup, case-insensitive
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column names in extraction order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Raw schema as produced by a schema provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Tables by name
    pub tables: BTreeMap<String, TableInfo>,
}

impl SchemaDefinition {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table
    pub fn with_table(mut self, name: impl Into<String>, table: TableInfo) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Parse from JSON, accepting both `{"tables": {...}}` and a bare table map
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if value.get("tables").is_some() {
            serde_json::from_value(value)
        } else {
            Ok(Self {
                tables: serde_json::from_value(value)?,
            })
        }
    }

    /// Table lookup, case-insensitive; returns the canonical name too
    pub fn table(&self, name: &str) -> Option<(&str, &TableInfo)> {
        if let Some((k, v)) = self.tables.get_key_value(name) {
            return Some((k.as_str(), v));
        }
        self.tables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Table names, sorted
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Number of tables
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Deterministic structural hash
    pub fn version_hash(&self) -> String {
        compute_hash(Some(self))
    }
}

// Canonical form. Field order is fixed by declaration, collections are
// sorted before serialization.

#[derive(Serialize)]
struct CanonicalColumn<'a> {
    name: &'a str,
    nullable: bool,
    primary_key: bool,
    #[serde(rename = "type")]
    data_type: &'a str,
}

#[derive(Serialize)]
struct CanonicalForeignKey<'a> {
    column: &'a str,
    references_column: &'a str,
    references_table: &'a str,
}

#[derive(Serialize)]
struct CanonicalTable<'a> {
    columns: Vec<CanonicalColumn<'a>>,
    foreign_keys: Vec<CanonicalForeignKey<'a>>,
}

#[derive(Serialize)]
struct CanonicalSchema<'a> {
    table_count: usize,
    tables: BTreeMap<&'a str, CanonicalTable<'a>>,
}

fn canonical(schema: &SchemaDefinition) -> CanonicalSchema<'_> {
    let tables = schema
        .tables
        .iter()
        .map(|(name, table)| {
            let mut columns: Vec<CanonicalColumn<'_>> = table
                .columns
                .iter()
                .map(|c| CanonicalColumn {
                    name: &c.name,
                    nullable: c.nullable,
                    primary_key: c.is_primary_key,
                    data_type: &c.data_type,
                })
                .collect();
            columns.sort_by(|a, b| a.name.cmp(b.name).then(a.data_type.cmp(b.data_type)));

            let mut foreign_keys: Vec<CanonicalForeignKey<'_>> = table
                .foreign_keys
                .iter()
                .map(|fk| CanonicalForeignKey {
                    column: &fk.column,
                    references_column: &fk.ref_column,
                    references_table: &fk.ref_table,
                })
                .collect();
            foreign_keys.sort_by(|a, b| {
                (a.column, a.references_table, a.references_column).cmp(&(
                    b.column,
                    b.references_table,
                    b.references_column,
                ))
            });

            (
                name.as_str(),
                CanonicalTable {
                    columns,
                    foreign_keys,
                },
            )
        })
        .collect();

    CanonicalSchema {
        table_count: schema.tables.len(),
        tables,
    }
}

/// Hash a schema: truncated SHA-256 over its canonical JSON form.
///
/// `None` hashes the literal `empty_schema`.
pub fn compute_hash(schema: Option<&SchemaDefinition>) -> String {
    match schema {
        None => short_digest(b"empty_schema"),
        Some(schema) => {
            // Serializing plain structs, string keys and bools cannot fail
            let json = serde_json::to_vec(&canonical(schema)).unwrap_or_default();
            short_digest(&json)
        }
    }
}

/// An immutable, hashed view of a schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    version_hash: String,
    table_count: usize,
    definition: SchemaDefinition,
    created_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    /// Hash and freeze a definition
    pub fn new(definition: SchemaDefinition) -> Self {
        Self {
            version_hash: definition.version_hash(),
            table_count: definition.table_count(),
            definition,
            created_at: Utc::now(),
        }
    }

    /// Structural hash
    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }

    /// Number of tables
    pub fn table_count(&self) -> usize {
        self.table_count
    }

    /// Underlying definition
    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    /// Tables by name
    pub fn tables(&self) -> &BTreeMap<String, TableInfo> {
        &self.definition.tables
    }

    /// When the snapshot was taken
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Table-level difference between two schemas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    /// Tables only in the new schema
    pub tables_added: Vec<String>,
    /// Tables only in the old schema
    pub tables_removed: Vec<String>,
    /// Tables present in both with a different structure
    pub tables_modified: Vec<String>,
}

impl SchemaDiff {
    /// Compute the difference from `old` to `new`
    pub fn between(old: &SchemaDefinition, new: &SchemaDefinition) -> Self {
        let old_names: BTreeSet<&String> = old.tables.keys().collect();
        let new_names: BTreeSet<&String> = new.tables.keys().collect();

        let tables_added = new_names
            .difference(&old_names)
            .map(|s| s.to_string())
            .collect();
        let tables_removed = old_names
            .difference(&new_names)
            .map(|s| s.to_string())
            .collect();

        let old_canonical = canonical(old);
        let new_canonical = canonical(new);
        let tables_modified = old_names
            .intersection(&new_names)
            .filter(|name| {
                let a = serde_json::to_string(&old_canonical.tables.get(name.as_str()))
                    .unwrap_or_default();
                let b = serde_json::to_string(&new_canonical.tables.get(name.as_str()))
                    .unwrap_or_default();
                a != b
            })
            .map(|s| s.to_string())
            .collect();

        Self {
            tables_added,
            tables_removed,
            tables_modified,
        }
    }

    /// True when nothing changed at table level
    pub fn is_empty(&self) -> bool {
        self.tables_added.is_empty()
            && self.tables_removed.is_empty()
            && self.tables_modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableInfo {
        TableInfo::new(vec![
            ColumnInfo::new("id", "INTEGER").primary_key(),
            ColumnInfo::new("name", "TEXT"),
            ColumnInfo::new("email", "TEXT").not_null(),
        ])
    }

    fn orders() -> TableInfo {
        TableInfo::new(vec![
            ColumnInfo::new("id", "INTEGER").primary_key(),
            ColumnInfo::new("user_id", "INTEGER"),
            ColumnInfo::new("total", "NUMERIC"),
        ])
        .with_foreign_key("user_id", "users", "id")
    }

    #[test]
    fn test_hash_ignores_extraction_order() {
        let a = SchemaDefinition::new()
            .with_table("users", users())
            .with_table("orders", orders());

        let mut reversed_users = users();
        reversed_users.columns.reverse();
        let b = SchemaDefinition::new()
            .with_table("orders", orders())
            .with_table("users", reversed_users);

        assert_eq!(a.version_hash(), b.version_hash());
        assert_eq!(a.version_hash().len(), 16);
    }

    #[test]
    fn test_hash_detects_structural_changes() {
        let base = SchemaDefinition::new().with_table("users", users());

        let mut added = users();
        added.columns.push(ColumnInfo::new("age", "INTEGER"));
        let with_column = SchemaDefinition::new().with_table("users", added);
        assert_ne!(base.version_hash(), with_column.version_hash());

        let fk_a = SchemaDefinition::new().with_table("orders", orders());
        let fk_b = SchemaDefinition::new().with_table(
            "orders",
            TableInfo::new(orders().columns).with_foreign_key("user_id", "customers", "id"),
        );
        assert_ne!(fk_a.version_hash(), fk_b.version_hash());
    }

    #[test]
    fn test_row_count_not_hashed() {
        let mut counted = users();
        counted.row_count = Some(42);
        let a = SchemaDefinition::new().with_table("users", users());
        let b = SchemaDefinition::new().with_table("users", counted);
        assert_eq!(a.version_hash(), b.version_hash());
    }

    #[test]
    fn test_empty_schema_hash() {
        assert_eq!(compute_hash(None), short_digest(b"empty_schema"));
        assert_ne!(compute_hash(None), SchemaDefinition::new().version_hash());
    }

    #[test]
    fn test_from_json_both_shapes() {
        let wrapped = r#"{"tables": {"users": {"columns": [{"name": "id", "type": "INTEGER", "primary_key": true}]}}}"#;
        let bare = r#"{"users": {"columns": [{"name": "id", "type": "INTEGER", "is_primary_key": true}]}}"#;

        let a = SchemaDefinition::from_json(wrapped).unwrap();
        let b = SchemaDefinition::from_json(bare).unwrap();
        assert_eq!(a, b);
        assert!(a.tables["users"].columns[0].is_primary_key);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let schema = SchemaDefinition::new().with_table("Users", users());
        let (name, table) = schema.table("users").unwrap();
        assert_eq!(name, "Users");
        assert!(table.column("EMAIL").is_some());
    }

    #[test]
    fn test_diff() {
        let old = SchemaDefinition::new()
            .with_table("users", users())
            .with_table("legacy", TableInfo::default());
        let mut changed = users();
        changed.columns.pop();
        let new = SchemaDefinition::new()
            .with_table("users", changed)
            .with_table("orders", orders());

        let diff = SchemaDiff::between(&old, &new);
        assert_eq!(diff.tables_added, vec!["orders".to_string()]);
        assert_eq!(diff.tables_removed, vec!["legacy".to_string()]);
        assert_eq!(diff.tables_modified, vec!["users".to_string()]);
        assert!(!diff.is_empty());
    }
}
