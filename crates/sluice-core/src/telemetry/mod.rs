//! Logging initialization for Sluice binaries and embedders.
//!
//! Library code only emits `tracing` events. Processes that want them
//! printed call [`init_logging`] once at start-up; the level can be
//! overridden with `RUST_LOG`.
//!
//! # Quick start
//!
//! ```ignore
//! use sluice_core::config::LoggingConfig;
//! use sluice_core::telemetry::init_logging;
//!
//! init_logging(&LoggingConfig::default())?;
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, SluiceError};

// ── Initialization ─────────────────────────────────────────────────────────

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level` when set.
///
/// # Errors
///
/// Returns [`SluiceError::Configuration`] if the level directive is invalid
/// or a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
    };

    installed.map_err(|e| {
        SluiceError::Configuration(format!("Failed to install log subscriber: {}", e))
    })
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            SluiceError::Configuration(format!("Invalid log level '{}': {}", level, e))
        }),
    }
}
