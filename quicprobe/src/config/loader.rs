//! Configuration loading and parsing.
//!
//! This module handles loading configuration from files, environment variables,
//! and command-line arguments, with proper precedence handling.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use std::path::{Path, PathBuf};

use super::ProbeConfig;

/// Command-line interface of the probe.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Script files to run, in order
    pub scripts: Vec<PathBuf>,

    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "quicprobe.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit JSON logs (overrides config file)
    #[arg(long)]
    pub json: bool,

    /// Seed of the endpoint's random source (overrides config file)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Load and parse probe configuration.
///
/// Precedence, lowest first:
/// 1. Default values
/// 2. Configuration file
/// 3. Environment variables (QUICPROBE_ prefix)
/// 4. Command-line arguments
///
/// # Errors
///
/// Returns an error if the configuration file cannot be parsed or
/// validation fails.
pub fn load_config(cli: &CliArgs) -> Result<ProbeConfig> {
    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;
    Ok(config)
}

/// Load configuration from a TOML file.
///
/// A missing file yields the defaults.
pub fn load_config_file(path: &str) -> Result<ProbeConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(ProbeConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Apply environment variable overrides.
///
/// Environment variables are prefixed with `QUICPROBE_` and use `__` as a separator.
///
/// Examples:
/// - `QUICPROBE_ENDPOINT__SEED=7`
/// - `QUICPROBE_TRANSPORT__INITIAL_MAX_DATA=4096`
/// - `QUICPROBE_LOGGING__LEVEL=debug`
pub fn apply_env_overrides(config: &mut ProbeConfig) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(config::Environment::with_prefix("QUICPROBE").separator("__"))
        .build()
        .context("Failed to load environment variables")?;

    if let Some(seed) = env_unsigned(&env_config, "endpoint.seed")? {
        config.endpoint.seed = seed;
    }
    if let Some(len) = env_unsigned(&env_config, "endpoint.local_cid_len")? {
        config.endpoint.local_cid_len = len;
    }
    if let Some(size) = env_unsigned(&env_config, "endpoint.max_datagram_size")? {
        config.endpoint.max_datagram_size = size;
    }
    if let Some(max_data) = env_unsigned(&env_config, "transport.initial_max_data")? {
        config.transport.initial_max_data = Some(max_data);
    }
    if let Ok(level) = env_config.get_string("logging.level") {
        if let Ok(parsed_level) = level.parse() {
            config.logging.level = parsed_level;
        }
    }
    if let Ok(json) = env_config.get_bool("logging.json_format") {
        config.logging.json_format = json;
    }

    Ok(())
}

/// Integer override that must fit `T`; negative values are rejected.
fn env_unsigned<T: TryFrom<i64>>(env_config: &ConfigLoader, key: &str) -> Result<Option<T>> {
    match env_config.get_int(key) {
        Ok(value) => T::try_from(value)
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got {}", key, value)),
        Err(_) => Ok(None),
    }
}

/// Apply command-line argument overrides.
pub fn apply_cli_overrides(config: &mut ProbeConfig, cli: &CliArgs) {
    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }
    if cli.json {
        config.logging.json_format = true;
    }
    if let Some(seed) = cli.seed {
        config.endpoint.seed = seed;
    }
}

/// The default configuration in TOML format.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&ProbeConfig::default()).context("Failed to serialize default config")
}
