//! Sluice - cached, self-correcting NL→SQL response pipeline
//!
//! This is the diagnostic command-line entry point.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use sluice::ai::semantic::QueryNormalizer;
use sluice::config::Config;
use sluice::schema::{SchemaDefinition, SchemaSnapshot};
use sluice::sql::plan::QueryPatternDetector;
use sluice::sql::validate::{SqlPostProcessor, SqlValidator};
use sluice::startup_errors::{format_startup_error, StartupError};
use sluice::telemetry;
use tracing::debug;

mod doctor;

/// Sluice - cached, self-correcting NL→SQL response pipeline
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "SLUICE_LOG_LEVEL",
        global = true
    )]
    log_level: Option<String>,

    /// Runtime config overrides in key=value format (can be specified multiple times)
    #[arg(long = "set", value_name = "KEY=VALUE", action = ArgAction::Append, global = true)]
    config_overrides: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a commented default configuration
    Init {
        /// Output path for the configuration file
        #[arg(short = 'o', long = "output", default_value = "sluice.toml")]
        output: PathBuf,

        /// Overwrite existing configuration file
        #[arg(short = 'f', long = "force", action = ArgAction::SetTrue)]
        force: bool,

        /// Generate minimal configuration (no comments)
        #[arg(long = "minimal", action = ArgAction::SetTrue)]
        minimal: bool,
    },

    /// Load, validate and print the effective configuration
    Config {
        /// Dump effective configuration as TOML
        #[arg(long = "dump", action = ArgAction::SetTrue)]
        dump: bool,

        /// Only report whether the configuration is valid
        #[arg(long = "test", action = ArgAction::SetTrue)]
        test: bool,
    },

    /// Validate a SQL statement against a schema file
    Validate {
        /// Schema JSON file
        #[arg(short = 's', long = "schema", value_name = "FILE")]
        schema: PathBuf,

        /// SQL to check
        sql: String,
    },

    /// Detect the structural pattern of a question
    Detect {
        /// Natural-language question
        question: String,
    },

    /// Print the version hash of a schema file
    SchemaHash {
        /// Schema JSON file
        schema: PathBuf,
    },

    /// Run preflight checks for configuration and collaborators
    Doctor,
}

impl Cli {
    /// Apply CLI argument overrides to the configuration
    fn apply_to_config(&self, config: &mut Config) -> Result<(), StartupError> {
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }

        for override_str in &self.config_overrides {
            let Some((key, value)) = override_str.split_once('=') else {
                return Err(StartupError::InvalidConfigValue {
                    key: override_str.clone(),
                    value: None,
                    expected: "key=value format".to_string(),
                });
            };
            config
                .apply_override(key, value)
                .map_err(|e| StartupError::InvalidConfigValue {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                    expected: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile(PathBuf),
    Defaults,
}

impl ConfigSource {
    fn label(&self) -> String {
        match self {
            ConfigSource::Explicit(path) | ConfigSource::DefaultFile(path) => {
                path.display().to_string()
            }
            ConfigSource::Defaults => "built-in defaults".to_string(),
        }
    }
}

fn load_config(cli: &Cli) -> Result<(Config, ConfigSource), StartupError> {
    let (mut config, source) = if let Some(path) = &cli.config {
        if !path.exists() {
            return Err(StartupError::config_not_found(path));
        }
        let config = Config::from_file(path)
            .map_err(|e| StartupError::config_parse_error(Some(path), &e.to_string()))?;
        (config, ConfigSource::Explicit(path.clone()))
    } else {
        let default_path = PathBuf::from("sluice.toml");
        if default_path.exists() {
            let config = Config::from_file(&default_path).map_err(|e| {
                StartupError::config_parse_error(Some(&default_path), &e.to_string())
            })?;
            (config, ConfigSource::DefaultFile(default_path))
        } else {
            (Config::default(), ConfigSource::Defaults)
        }
    };

    cli.apply_to_config(&mut config)?;
    config
        .validate()
        .map_err(|e| StartupError::InvalidConfigValue {
            key: "configuration".to_string(),
            value: None,
            expected: e.to_string(),
        })?;

    Ok((config, source))
}

fn load_schema(path: &Path) -> Result<SchemaDefinition, StartupError> {
    let text =
        fs::read_to_string(path).map_err(|e| StartupError::io_error("reading schema", Some(path), e))?;
    SchemaDefinition::from_json(&text).map_err(|e| StartupError::Other {
        message: format!("Failed to parse schema '{}': {}", path.display(), e),
        suggestion: Some(
            "Expected a JSON object of table name to {\"columns\": [{\"name\", \"type\"}]}"
                .to_string(),
        ),
    })
}

fn generate_config_toml(minimal: bool) -> Result<String, StartupError> {
    if minimal {
        return Config::default().to_toml().map_err(|e| StartupError::Other {
            message: format!("Failed to serialize configuration: {}", e),
            suggestion: None,
        });
    }

    Ok(r##"# Sluice Configuration
# Generated by `sluice init`

# ============================================================================
# Cache Store
# ============================================================================
[cache]
enabled = true
# Namespace prefix for every key
prefix = "nl2sql"
# Remote Redis-compatible store. Leave unset to use the in-process cache.
# redis_url = "redis://127.0.0.1:6379"
# Drop schema-scoped entries written under an older schema version
check_schema_version = true
# Per-level TTLs in seconds
system_ttl_secs = 7200
schema_ttl_secs = 3600
examples_ttl_secs = 3600
prompt_ttl_secs = 1800
sql_ttl_secs = 600
semantic_ttl_secs = 1800

# ============================================================================
# Semantic Cache
# ============================================================================
[semantic]
enabled = true
# Minimum cosine similarity for a paraphrase to reuse an answer
similarity_threshold = 0.85
top_k = 5
max_index_entries = 5000
# Score multiplier when the candidate has the same intent
intent_boost = 1.1
# "keyword" (local) or "openai"
embedding_provider = "keyword"
embedding_dim = 256

# ============================================================================
# Query Plan Cache
# ============================================================================
[plan_cache]
enabled = true
max_plans = 500
ttl_secs = 86400
# Minimum pattern-detection confidence for a plan lookup
min_confidence = 0.7

# ============================================================================
# Validation
# ============================================================================
[validation]
# LIMIT appended to unbounded SELECTs
default_limit = 100
enforce_limit = true

# ============================================================================
# Execution Feedback
# ============================================================================
[feedback]
max_retries = 3
timeout_secs = 15

# ============================================================================
# Orchestrator
# ============================================================================
[orchestrator]
# Concurrent LLM calls
max_concurrent = 5
llm_timeout_secs = 30
# Answers below this confidence are not cached
cache_min_confidence = 0.7
# Answers below this confidence are not executed
execute_min_confidence = 0.5
history_window = 6
# "postgres", "mysql" or "sqlite"
dialect = "postgres"

# ============================================================================
# LLM
# ============================================================================
[llm]
endpoint = "https://api.openai.com/v1/chat/completions"
model = "gpt-4o-mini"
# api_key = "sk-..."  # falls back to OPENAI_API_KEY
temperature = 0.1

# ============================================================================
# Logging
# ============================================================================
[logging]
# Log level: trace, debug, info, warn, error
level = "info"
# "pretty" or "json"
format = "pretty"
"##
    .to_string())
}

fn cmd_init(output: &Path, force: bool, minimal: bool) -> ExitCode {
    if output.exists() && !force {
        let err = StartupError::Other {
            message: format!("Configuration file '{}' already exists", output.display()),
            suggestion: Some("Use --force to overwrite the existing configuration.".to_string()),
        };
        eprintln!("{}", format_startup_error(&err));
        return ExitCode::FAILURE;
    }

    let content = match generate_config_toml(minimal) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("{}", format_startup_error(&err));
            return ExitCode::FAILURE;
        }
    };

    let written = fs::File::create(output).and_then(|mut file| file.write_all(content.as_bytes()));
    if let Err(e) = written {
        let err = StartupError::io_error("writing configuration file", Some(output), e);
        eprintln!("{}", format_startup_error(&err));
        return ExitCode::FAILURE;
    }

    println!("Created configuration file: {}", output.display());
    println!();
    println!("Check it with:");
    println!("  sluice --config {} config --test", output.display());
    println!("  sluice --config {} doctor", output.display());

    ExitCode::SUCCESS
}

fn cmd_config(config: &Config, source: &ConfigSource, dump: bool, test: bool) -> ExitCode {
    if dump {
        return match config.to_toml() {
            Ok(output) => {
                print!("{output}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                let err = StartupError::Other {
                    message: format!("Failed to serialize configuration: {}", e),
                    suggestion: Some("Try removing invalid values from the config.".to_string()),
                };
                eprintln!("{}", format_startup_error(&err));
                ExitCode::FAILURE
            }
        };
    }

    println!("Configuration OK ({})", source.label());
    if test {
        return ExitCode::SUCCESS;
    }
    println!(
        "  Cache: {} (backend: {})",
        if config.cache.enabled { "enabled" } else { "disabled" },
        config.cache.redis_url.as_deref().unwrap_or("memory")
    );
    println!(
        "  Semantic: {} (threshold {:.2})",
        if config.semantic.enabled { "enabled" } else { "disabled" },
        config.semantic.similarity_threshold
    );
    println!(
        "  Plan cache: {} (max {} plans)",
        if config.plan_cache.enabled { "enabled" } else { "disabled" },
        config.plan_cache.max_plans
    );
    println!("  Dialect: {}", config.orchestrator.dialect);
    println!("  Max concurrent LLM calls: {}", config.orchestrator.max_concurrent);
    println!("  Feedback retries: {}", config.feedback.max_retries);
    println!("  Model: {}", config.llm.model);
    println!("  Log level: {}", config.logging.level);
    ExitCode::SUCCESS
}

fn cmd_validate(config: &Config, schema_path: &Path, sql: &str) -> ExitCode {
    let schema = match load_schema(schema_path) {
        Ok(schema) => schema,
        Err(err) => {
            eprintln!("{}", format_startup_error(&err));
            return ExitCode::FAILURE;
        }
    };

    let validator = SqlValidator::from_schema(&schema)
        .with_similarity_threshold(config.validation.similarity_threshold);
    let result = validator.validate(sql);
    debug!(valid = result.is_valid, errors = result.errors.len(), "validated");

    for issue in result.errors.iter().chain(result.warnings.iter()) {
        println!(
            "[{:?}] {}: {}",
            issue.severity,
            issue.kind.as_str(),
            issue.message
        );
        if !issue.suggestion.is_empty() {
            println!("    {}", issue.suggestion);
        }
    }

    if !result.is_valid {
        println!();
        println!("{}", validator.generate_error_feedback(&result));
        return ExitCode::FAILURE;
    }

    let processed = SqlPostProcessor::from_config(&config.validation).process(sql);
    println!("{}", processed);
    ExitCode::SUCCESS
}

fn cmd_detect(config: &Config, question: &str) -> ExitCode {
    let detector = QueryPatternDetector::new(config.plan_cache.detect_floor);
    let detected = detector.detect(question);

    println!("Pattern: {}", detected.pattern.as_str());
    println!("Confidence: {:.2}", detected.confidence);
    for (name, value) in &detected.extracted_params {
        println!("  {} = {}", name, value);
    }
    println!("Normalized: {}", QueryNormalizer::normalize(question));
    println!("Intent: {}", QueryNormalizer::intent(question));
    ExitCode::SUCCESS
}

fn cmd_schema_hash(schema_path: &Path) -> ExitCode {
    match load_schema(schema_path) {
        Ok(schema) => {
            let snapshot = SchemaSnapshot::new(schema);
            println!("{}", snapshot.version_hash());
            println!("tables: {}", snapshot.table_count());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", format_startup_error(&err));
            ExitCode::FAILURE
        }
    }
}

fn cmd_doctor(cli: &Cli) -> ExitCode {
    let results = doctor::run_diagnostics(cli.config.as_deref(), &cli.config_overrides);
    doctor::print_report(&results);

    if doctor::all_passed(&results) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> ExitCode {
    // Parse CLI arguments using clap (handles --help and --version automatically)
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init {
            output,
            force,
            minimal,
        } => return cmd_init(output, *force, *minimal),
        Commands::Doctor => return cmd_doctor(&cli),
        _ => {}
    }

    let (config, source) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("{}", format_startup_error(&err));
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init_logging(&config.logging) {
        eprintln!("Warning: {}", e);
    }
    debug!(source = %source.label(), "configuration loaded");

    match &cli.command {
        Commands::Config { dump, test } => cmd_config(&config, &source, *dump, *test),
        Commands::Validate { schema, sql } => cmd_validate(&config, schema, sql),
        Commands::Detect { question } => cmd_detect(&config, question),
        Commands::SchemaHash { schema } => cmd_schema_hash(schema),
        Commands::Init { .. } | Commands::Doctor => ExitCode::SUCCESS,
    }
}
