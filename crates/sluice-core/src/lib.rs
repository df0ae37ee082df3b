//! # sluice-core
//!
//! Foundation of the Sluice NL→SQL response pipeline: the error taxonomy,
//! configuration, logging, schema versioning and the multi-level cache
//! store every other stage persists through.

pub mod cache;
pub mod config;
pub mod error;
pub mod schema;
pub mod startup_errors;
pub mod telemetry;

pub use error::{Result, SluiceError};
