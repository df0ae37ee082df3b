//! Schema version tracking

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;

use super::snapshot::{compute_hash, SchemaDefinition, SchemaDiff, SchemaSnapshot};

/// Default number of versions remembered
pub const DEFAULT_HISTORY_DEPTH: usize = 10;

/// One entry of the version history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Version hash
    pub version: String,
    /// Number of tables
    pub table_count: usize,
    /// When the version became current
    pub created_at: DateTime<Utc>,
}

/// Summary of the current version for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    /// `initialized` or `not_initialized`
    pub status: String,
    /// Current version hash
    pub version: Option<String>,
    /// Number of tables in the current version
    pub table_count: usize,
    /// When the current version was recorded
    pub created_at: Option<DateTime<Utc>>,
    /// Number of remembered versions
    pub history_count: usize,
}

/// Tracks the structural version of the database schema.
///
/// The manager only reports whether the schema changed; callers decide
/// what to invalidate. Reads vastly outnumber writes, so the current
/// snapshot sits behind a read-mostly lock and is swapped whole.
pub struct SchemaVersionManager {
    current: RwLock<Option<Arc<SchemaSnapshot>>>,
    history: Mutex<VecDeque<VersionRecord>>,
    max_history: usize,
}

impl SchemaVersionManager {
    /// Create a manager with the default history depth
    pub fn new() -> Self {
        Self::with_history_depth(DEFAULT_HISTORY_DEPTH)
    }

    /// Create a manager remembering `depth` versions
    pub fn with_history_depth(depth: usize) -> Self {
        Self {
            current: RwLock::new(None),
            history: Mutex::new(VecDeque::with_capacity(depth)),
            max_history: depth.max(1),
        }
    }

    /// Hash a schema without recording it
    pub fn compute_hash(schema: Option<&SchemaDefinition>) -> String {
        compute_hash(schema)
    }

    /// Make `schema` current. Returns true if its hash differs from the
    /// previous version; the first call always reports a change.
    pub fn update(&self, schema: SchemaDefinition) -> bool {
        let snapshot = Arc::new(SchemaSnapshot::new(schema));

        let previous = {
            let mut current = self.current.write();
            if let Some(existing) = current.as_ref() {
                if existing.version_hash() == snapshot.version_hash() {
                    return false;
                }
            }
            current.replace(Arc::clone(&snapshot))
        };

        {
            let mut history = self.history.lock();
            history.push_back(VersionRecord {
                version: snapshot.version_hash().to_string(),
                table_count: snapshot.table_count(),
                created_at: snapshot.created_at(),
            });
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        match previous {
            Some(old) => {
                let diff = SchemaDiff::between(old.definition(), snapshot.definition());
                info!(
                    old_version = %old.version_hash(),
                    new_version = %snapshot.version_hash(),
                    tables_added = ?diff.tables_added,
                    tables_removed = ?diff.tables_removed,
                    tables_modified = ?diff.tables_modified,
                    "schema changed"
                );
            }
            None => {
                info!(
                    version = %snapshot.version_hash(),
                    tables = snapshot.table_count(),
                    "schema version initialized"
                );
            }
        }
        true
    }

    /// Current version hash
    pub fn current_version(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .map(|s| s.version_hash().to_string())
    }

    /// Current snapshot
    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.current.read().clone()
    }

    /// Whether `version` is the current version
    pub fn is_compatible(&self, version: &str) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|s| s.version_hash() == version)
            .unwrap_or(false)
    }

    /// Prefix for keys that must not outlive the current schema
    pub fn cache_key_prefix(&self) -> String {
        match self.current_version() {
            Some(version) => format!("schema_{}", version),
            None => "schema_none".to_string(),
        }
    }

    /// Remembered versions, oldest first
    pub fn history(&self) -> Vec<VersionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Summary for monitoring
    pub fn version_info(&self) -> VersionInfo {
        let history_count = self.history.lock().len();
        match self.current() {
            Some(snapshot) => VersionInfo {
                status: "initialized".to_string(),
                version: Some(snapshot.version_hash().to_string()),
                table_count: snapshot.table_count(),
                created_at: Some(snapshot.created_at()),
                history_count,
            },
            None => VersionInfo {
                status: "not_initialized".to_string(),
                version: None,
                table_count: 0,
                created_at: None,
                history_count,
            },
        }
    }
}

impl Default for SchemaVersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, TableInfo};

    fn schema_with(tables: &[&str]) -> SchemaDefinition {
        tables.iter().fold(SchemaDefinition::new(), |schema, name| {
            schema.with_table(
                *name,
                TableInfo::new(vec![ColumnInfo::new("id", "INTEGER").primary_key()]),
            )
        })
    }

    #[test]
    fn test_first_update_reports_change() {
        let manager = SchemaVersionManager::new();
        assert!(manager.current_version().is_none());
        assert_eq!(manager.version_info().status, "not_initialized");
        assert_eq!(manager.cache_key_prefix(), "schema_none");

        assert!(manager.update(schema_with(&["users"])));
        assert!(manager.current_version().is_some());
        assert_eq!(manager.version_info().status, "initialized");
    }

    #[test]
    fn test_unchanged_schema_is_not_a_change() {
        let manager = SchemaVersionManager::new();
        assert!(manager.update(schema_with(&["users", "orders"])));
        assert!(!manager.update(schema_with(&["orders", "users"])));
        assert_eq!(manager.history().len(), 1);
    }

    #[test]
    fn test_change_detected_and_compatibility() {
        let manager = SchemaVersionManager::new();
        manager.update(schema_with(&["users"]));
        let v1 = manager.current_version().unwrap();

        assert!(manager.update(schema_with(&["users", "orders"])));
        let v2 = manager.current_version().unwrap();

        assert_ne!(v1, v2);
        assert!(manager.is_compatible(&v2));
        assert!(!manager.is_compatible(&v1));
        assert_eq!(manager.cache_key_prefix(), format!("schema_{}", v2));
        assert_eq!(manager.version_info().table_count, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let manager = SchemaVersionManager::with_history_depth(3);
        for i in 0..6 {
            let name = format!("t{}", i);
            manager.update(schema_with(&[name.as_str()]));
        }
        let history = manager.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().version, manager.current_version().unwrap());
        assert_eq!(manager.version_info().history_count, 3);
    }
}
