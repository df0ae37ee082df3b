//! Sluice doctor: configuration and collaborator diagnostics
//!
//! Runs a series of checks against the effective configuration: whether it
//! loads and validates, whether the cache store is reachable, whether LLM
//! credentials are present and whether the embedding provider can be built.

use std::env;
use std::path::Path;

use sluice_ai::semantic::{provider_from_config, EmbeddingProvider};
use sluice_core::cache::{CacheStore, HealthStatus};
use sluice_core::config::{Config, EmbeddingProviderKind, LlmConfig};

/// Result of a single diagnostic check
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Ok => write!(f, "OK"),
            CheckStatus::Warning => write!(f, "WARN"),
            CheckStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Run all diagnostic checks and return results
pub fn run_diagnostics(config_path: Option<&Path>, overrides: &[String]) -> Vec<CheckResult> {
    let mut results = vec![check_build()];

    let (config_check, config) = check_config(config_path, overrides);
    results.push(config_check);

    // Remaining checks still run against defaults so the report is complete
    let config = config.unwrap_or_default();
    results.push(check_cache_store(&config));
    results.push(check_llm_credentials(&config.llm));
    results.push(check_embedding_provider(&config));

    results
}

/// Print diagnostics report to stdout
#[allow(clippy::print_stdout)]
pub fn print_report(results: &[CheckResult]) {
    println!("\nSluice Doctor - Diagnostics\n");
    println!("{}", "=".repeat(60));

    let mut ok_count = 0;
    let mut warn_count = 0;
    let mut err_count = 0;

    for result in results {
        match result.status {
            CheckStatus::Ok => ok_count += 1,
            CheckStatus::Warning => warn_count += 1,
            CheckStatus::Error => err_count += 1,
        }
        println!("[{}] {}", result.status, result.name);
        println!("   {}\n", result.message);
    }

    println!("{}", "=".repeat(60));
    println!(
        "Summary: {} passed, {} warnings, {} errors\n",
        ok_count, warn_count, err_count
    );

    if err_count > 0 {
        println!("Some checks failed. Address the errors above before serving requests.");
    } else if warn_count > 0 {
        println!("Sluice will run, but some features are degraded.");
    } else {
        println!("All checks passed.");
    }
}

/// Returns true if all checks passed (no errors)
pub fn all_passed(results: &[CheckResult]) -> bool {
    results
        .iter()
        .all(|r| !matches!(r.status, CheckStatus::Error))
}

fn check_build() -> CheckResult {
    CheckResult {
        name: "Build Info".to_string(),
        status: CheckStatus::Ok,
        message: format!(
            "sluice {} on {} ({})",
            env!("CARGO_PKG_VERSION"),
            env::consts::OS,
            env::consts::ARCH
        ),
    }
}

fn check_config(path: Option<&Path>, overrides: &[String]) -> (CheckResult, Option<Config>) {
    let name = "Configuration".to_string();

    let (loaded, label) = match path {
        Some(path) if !path.exists() => {
            return (
                CheckResult {
                    name,
                    status: CheckStatus::Error,
                    message: format!("Config file not found: {}", path.display()),
                },
                None,
            )
        }
        Some(path) => (Config::from_file(path), path.display().to_string()),
        None if Path::new("sluice.toml").exists() => {
            (Config::from_file("sluice.toml"), "sluice.toml".to_string())
        }
        None => (Ok(Config::default()), "built-in defaults".to_string()),
    };

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            return (
                CheckResult {
                    name,
                    status: CheckStatus::Error,
                    message: format!("{}: {}", label, e),
                },
                None,
            )
        }
    };

    for item in overrides {
        let applied = match item.split_once('=') {
            Some((key, value)) => config.apply_override(key, value),
            None => Err(sluice_core::SluiceError::Configuration(format!(
                "Invalid override '{}': expected key=value",
                item
            ))),
        };
        if let Err(e) = applied {
            return (
                CheckResult {
                    name,
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
                None,
            );
        }
    }

    match config.validate() {
        Ok(()) => (
            CheckResult {
                name,
                status: CheckStatus::Ok,
                message: format!("{} is valid", label),
            },
            Some(config),
        ),
        Err(e) => (
            CheckResult {
                name,
                status: CheckStatus::Error,
                message: format!("{}: {}", label, e),
            },
            None,
        ),
    }
}

fn check_cache_store(config: &Config) -> CheckResult {
    let name = "Cache Store".to_string();
    let store = CacheStore::new(config.cache.clone());
    let health = store.health_check();
    let detail = health.message.unwrap_or_default();

    match health.status {
        HealthStatus::Healthy => CheckResult {
            name,
            status: CheckStatus::Ok,
            message: format!(
                "{} backend answering in {:.2}ms",
                health.backend,
                health.latency_ms.unwrap_or_default()
            ),
        },
        HealthStatus::Degraded => CheckResult {
            name,
            status: CheckStatus::Warning,
            message: format!(
                "{} ({})",
                detail,
                config.cache.redis_url.as_deref().unwrap_or("no url")
            ),
        },
        HealthStatus::Disabled => CheckResult {
            name,
            status: CheckStatus::Warning,
            message: detail,
        },
        HealthStatus::Unhealthy => CheckResult {
            name,
            status: CheckStatus::Error,
            message: detail,
        },
    }
}

fn check_llm_credentials(llm: &LlmConfig) -> CheckResult {
    let name = "LLM Credentials".to_string();
    if llm.api_key.is_some() {
        CheckResult {
            name,
            status: CheckStatus::Ok,
            message: format!("api_key set for model {}", llm.model),
        }
    } else if env::var("OPENAI_API_KEY").is_ok() {
        CheckResult {
            name,
            status: CheckStatus::Ok,
            message: format!("OPENAI_API_KEY set for model {}", llm.model),
        }
    } else {
        CheckResult {
            name,
            status: CheckStatus::Warning,
            message: "No llm.api_key or OPENAI_API_KEY; generation needs a custom completion"
                .to_string(),
        }
    }
}

fn check_embedding_provider(config: &Config) -> CheckResult {
    let name = "Embedding Provider".to_string();
    let kind = match config.semantic.embedding_provider {
        EmbeddingProviderKind::Keyword => "keyword",
        EmbeddingProviderKind::OpenAi => "openai",
    };

    match provider_from_config(&config.semantic) {
        Ok(provider) => CheckResult {
            name,
            status: CheckStatus::Ok,
            message: format!("{} ({} dimensions)", kind, provider.dimension()),
        },
        Err(e) => CheckResult {
            name,
            status: CheckStatus::Error,
            message: format!("{}: {}", kind, e),
        },
    }
}
