//! # Telemetry
//!
//! Structured logging for the probe. The core crate logs through
//! `tracing`; this installs the subscriber that renders it, either as
//! human-readable lines or as JSON for machine parsing.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single
//! run can be made more verbose without touching the config file:
//!
//! ```text
//! RUST_LOG=quicprobe_quic=trace quicprobe scripts/handshake.toml
//! ```

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the level filter: `RUST_LOG` if set, else the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(config.level.to_string())?),
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber was already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    if config.json_format {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_line_number(config.include_file_line)
            .with_file(config.include_file_line);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(config.enable_colors)
            .with_line_number(config.include_file_line)
            .with_file(config.include_file_line);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::debug!(level = %config.level, json = config.json_format, "Logging initialized");
    Ok(())
}
