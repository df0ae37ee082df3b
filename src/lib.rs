//! # Sluice
//!
//! A cached, self-correcting response pipeline for natural-language to SQL
//! generation. Sluice sits between a question and an LLM: repeated and
//! paraphrased questions are answered from cache, generated SQL is checked
//! against the live schema and fixed before it is returned, and failed
//! executions are fed back to the model for correction.
//!
//! This is the top-level crate that re-exports all workspace crates for a unified API.
//! Individual crates can also be used independently for a smaller dependency footprint.
//!
//! ## Crate Organization
//!
//! | Crate | Description |
//! |-------|-------------|
//! | [`sluice-core`] | Errors, configuration, schema versioning, multi-level cache store |
//! | [`sluice-ai`] | Embeddings, question normalization, vector index, semantic cache |
//! | [`sluice-sql`] | Plan cache, validation, prompts, feedback loop, orchestrator |
//!
//! ## Pipeline
//!
//! ```text
//! question ─► metadata? ─► semantic cache ─► plan cache ─► LLM ─► validate ─► post-process
//!                               │                │          ▲         │
//!                               └── hit ─────────┴── hit    └─ fix ◄──┘
//! ```

// ── Re-exports from sluice-core ─────────────────────────────────────────────

pub use sluice_core::cache;
pub use sluice_core::config;
pub use sluice_core::error;
pub use sluice_core::schema;
pub use sluice_core::startup_errors;
pub use sluice_core::telemetry;
pub use sluice_core::{Result, SluiceError};

// ── Re-exports from extension crates ─────────────────────────────────────────

pub use sluice_ai as ai;
pub use sluice_sql as sql;

pub use sluice_sql::{
    ChatMessage, Collaborators, Completion, QueryResult, RequestOrchestrator, SchemaProvider,
    SqlExecutor, SqlQuery,
};
