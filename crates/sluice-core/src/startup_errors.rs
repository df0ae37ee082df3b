//! Actionable startup error messages
//!
//! User-facing messages for the failures the `sluice` binary can hit
//! before any request is processed. Each error carries a machine-readable
//! code so wrappers can react without parsing text.
//!
//! ## Error Code Format
//!
//! Error codes follow the format `SLC{category}{number}`:
//! - `SLC1xxx` - Network / remote store errors
//! - `SLC2xxx` - File system errors
//! - `SLC3xxx` - Configuration errors
//! - `SLC9xxx` - Other errors

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    code: &'static str,
    category: ErrorCategory,
}

impl ErrorCode {
    const fn new(code: &'static str, category: ErrorCategory) -> Self {
        Self { code, category }
    }

    /// Code string (e.g. "SLC3001")
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Error category
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Transient failures worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self.category, ErrorCategory::Network)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network and remote store errors (SLC1xxx)
    Network,
    /// File system errors (SLC2xxx)
    FileSystem,
    /// Configuration errors (SLC3xxx)
    Configuration,
    /// Other errors (SLC9xxx)
    Other,
}

/// Remote store unreachable
pub const SLC1001: ErrorCode = ErrorCode::new("SLC1001", ErrorCategory::Network);
/// Permission denied
pub const SLC2001: ErrorCode = ErrorCode::new("SLC2001", ErrorCategory::FileSystem);
/// General I/O error
pub const SLC2002: ErrorCode = ErrorCode::new("SLC2002", ErrorCategory::FileSystem);
/// Configuration file not found
pub const SLC3001: ErrorCode = ErrorCode::new("SLC3001", ErrorCategory::Configuration);
/// Configuration parse error
pub const SLC3002: ErrorCode = ErrorCode::new("SLC3002", ErrorCategory::Configuration);
/// Invalid configuration value
pub const SLC3003: ErrorCode = ErrorCode::new("SLC3003", ErrorCategory::Configuration);
/// Other error
pub const SLC9001: ErrorCode = ErrorCode::new("SLC9001", ErrorCategory::Other);

/// Startup error types with context for actionable messages
#[derive(Debug)]
pub enum StartupError {
    /// Remote cache store configured but not answering
    BackendUnreachable {
        /// Store URL
        url: String,
        /// Failure detail
        message: String,
    },

    /// Permission denied accessing a path
    PermissionDenied {
        /// Path where permission was denied
        path: PathBuf,
        /// Operation that failed ("reading", "creating", ...)
        operation: String,
    },

    /// General I/O error with context
    IoError {
        /// Operation that failed
        operation: String,
        /// Path involved, if any
        path: Option<PathBuf>,
        /// Underlying error
        source: io::Error,
    },

    /// Configuration file not found
    ConfigNotFound {
        /// Expected path
        path: PathBuf,
    },

    /// Configuration parse error
    ConfigParseError {
        /// Path to the file, if any
        path: Option<PathBuf>,
        /// Parser message
        message: String,
    },

    /// Invalid configuration value
    InvalidConfigValue {
        /// Dotted key, e.g. `orchestrator.max_concurrent`
        key: String,
        /// Offending value, if known
        value: Option<String>,
        /// What was expected
        expected: String,
    },

    /// Other error with optional suggestion
    Other {
        /// Message
        message: String,
        /// Suggestion
        suggestion: Option<String>,
    },
}

impl StartupError {
    /// Config file not found
    pub fn config_not_found(path: impl AsRef<Path>) -> Self {
        StartupError::ConfigNotFound {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Config file could not be parsed
    pub fn config_parse_error(path: Option<&Path>, message: &str) -> Self {
        StartupError::ConfigParseError {
            path: path.map(|p| p.to_path_buf()),
            message: message.to_string(),
        }
    }

    /// Permission denied
    pub fn permission_denied(path: impl AsRef<Path>, operation: &str) -> Self {
        StartupError::PermissionDenied {
            path: path.as_ref().to_path_buf(),
            operation: operation.to_string(),
        }
    }

    /// I/O error with context
    pub fn io_error(operation: &str, path: Option<&Path>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            if let Some(path) = path {
                return Self::permission_denied(path, operation);
            }
        }
        StartupError::IoError {
            operation: operation.to_string(),
            path: path.map(|p| p.to_path_buf()),
            source,
        }
    }

    /// Machine-readable code
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StartupError::BackendUnreachable { .. } => SLC1001,
            StartupError::PermissionDenied { .. } => SLC2001,
            StartupError::IoError { .. } => SLC2002,
            StartupError::ConfigNotFound { .. } => SLC3001,
            StartupError::ConfigParseError { .. } => SLC3002,
            StartupError::InvalidConfigValue { .. } => SLC3003,
            StartupError::Other { .. } => SLC9001,
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_startup_error(self))
    }
}

impl std::error::Error for StartupError {}

/// Format a startup error with actionable suggestions
pub fn format_startup_error(error: &StartupError) -> String {
    let code = error.error_code();
    match error {
        StartupError::BackendUnreachable { url, message } => {
            let mut msg = format!("[{}] Error: Cache store at '{}' is unreachable", code, url);
            msg.push_str(&format!("\n\nDetails: {}", message));
            msg.push_str("\n\nTo fix this:");
            msg.push_str("\n  1. Check the server is running: redis-cli -u <url> ping");
            msg.push_str("\n  2. Or unset cache.redis_url to use the in-process cache");
            msg.push_str("\n\nRun 'sluice doctor' for full diagnostics.");
            msg
        }

        StartupError::PermissionDenied { path, operation } => {
            let mut msg = format!(
                "[{}] Error: Permission denied {} '{}'",
                code,
                operation,
                path.display()
            );
            msg.push_str("\n\nTo fix this:");
            msg.push_str(&format!("\n  1. Check permissions: ls -la {}", path.display()));
            msg.push_str("\n  2. Or write to a different location with --output");
            msg
        }

        StartupError::IoError {
            operation,
            path,
            source,
        } => {
            let mut msg = format!("[{}] Error: I/O error during {}", code, operation);
            if let Some(p) = path {
                msg.push_str(&format!(" on '{}'", p.display()));
            }
            msg.push_str(&format!("\n\nDetails: {}", source));
            if source.kind() == io::ErrorKind::NotFound {
                msg.push_str("\n\nTo fix this:");
                msg.push_str("\n  1. Verify the path exists");
            }
            msg
        }

        StartupError::ConfigNotFound { path } => {
            let mut msg = format!(
                "[{}] Error: Configuration file not found: '{}'",
                code,
                path.display()
            );
            msg.push_str("\n\nTo fix this:");
            msg.push_str("\n  1. Run 'sluice init' to create a new configuration");
            msg.push_str("\n  2. Or run without --config to use built-in defaults");
            msg
        }

        StartupError::ConfigParseError { path, message } => {
            let mut msg = format!("[{}] Error: Failed to parse configuration file", code);
            if let Some(p) = path {
                msg.push_str(&format!(": '{}'", p.display()));
            }
            msg.push_str(&format!("\n\nDetails: {}", message));
            msg.push_str("\n\nTo fix this:");
            msg.push_str("\n  1. Check the TOML syntax in your configuration file");
            msg.push_str("\n  2. Validate with: sluice config --test --config sluice.toml");
            msg.push_str("\n  3. Or regenerate: sluice init --force");
            msg
        }

        StartupError::InvalidConfigValue {
            key,
            value,
            expected,
        } => {
            let mut msg = format!(
                "[{}] Error: Invalid value for configuration key '{}'",
                code, key
            );
            if let Some(v) = value {
                msg.push_str(&format!(": got '{}'", v));
            }
            msg.push_str(&format!(", expected {}", expected));
            if key.contains("threshold") || key.contains("confidence") {
                msg.push_str("\n\nThresholds are fractions between 0.0 and 1.0");
            } else if key.contains("level") {
                msg.push_str("\n\nValid levels: trace, debug, info, warn, error");
            }
            msg
        }

        StartupError::Other {
            message,
            suggestion,
        } => {
            let mut msg = format!("[{}] Error: {}", code, message);
            if let Some(s) = suggestion {
                msg.push_str(&format!("\n\n{}", s));
            }
            msg
        }
    }
}
