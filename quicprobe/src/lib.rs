//! quicprobe: scripted conformance runs against the quicprobe-quic endpoint.
//!
//! The binary is in main.rs; the library exposes configuration, logging
//! setup and the script runner so they can be tested and reused.

pub mod config;
pub mod script;
pub mod telemetry;

use anyhow::Context;
use config::ProbeConfig;
pub use script::RunReport;
use script::{Runner, Script};
use std::path::Path;

/// Load and run one script file against a fresh endpoint.
pub fn run_script_file(config: &ProbeConfig, path: &Path) -> anyhow::Result<RunReport> {
    let script = Script::load(path)?;
    run_script(config, &script).with_context(|| format!("script {} failed", path.display()))
}

/// Run a parsed script against a fresh endpoint.
pub fn run_script(config: &ProbeConfig, script: &Script) -> anyhow::Result<RunReport> {
    let mut runner = Runner::new(config.endpoint_config(), config.endpoint.seed, &script.peer)?;
    Ok(runner.run(script)?)
}
