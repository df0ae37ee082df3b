//! # Schema versioning
//!
//! A schema version is a content hash over the table, column and foreign
//! key structure of the database. It scopes cache entries whose meaning
//! depends on that structure (rendered schema text, few-shot examples,
//! prompts, semantic answers).
//!
//! The hash is computed over a canonical JSON form with every collection
//! sorted, so two extractions of the same schema always agree no matter
//! the order the introspection returned them in.
//!
//! ```rust
//! use sluice_core::schema::{ColumnInfo, SchemaDefinition, SchemaVersionManager, TableInfo};
//!
//! let manager = SchemaVersionManager::new();
//! let schema = SchemaDefinition::new().with_table(
//!     "users",
//!     TableInfo::new(vec![ColumnInfo::new("id", "INTEGER").primary_key()]),
//! );
//!
//! assert!(manager.update(schema.clone()));   // first version
//! assert!(!manager.update(schema));          // unchanged
//! ```

mod manager;
mod snapshot;

pub use manager::{SchemaVersionManager, VersionInfo, VersionRecord, DEFAULT_HISTORY_DEPTH};
pub use snapshot::{
    compute_hash, ColumnInfo, ForeignKey, SchemaDefinition, SchemaDiff, SchemaSnapshot, TableInfo,
};
