use anyhow::Context;
use clap::Parser;
use quicprobe::config::{self, CliArgs};
use quicprobe::{run_script_file, telemetry};
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> anyhow::Result<ExitCode> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        println!("{}", config::loader::default_config_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config(&cli)?;
    if cli.validate {
        println!("✓ Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::init_logging(&config.logging).context("failed to initialize logging")?;
    if cli.scripts.is_empty() {
        anyhow::bail!("no script given; pass one or more script files");
    }

    let mut failures = 0usize;
    for path in &cli.scripts {
        match run_script_file(&config, path) {
            Ok(report) => info!(
                script = %report.name,
                steps = report.steps,
                events = report.events,
                frames = report.frames_received,
                error_codes = ?report.error_codes,
                "script passed"
            ),
            Err(e) => {
                failures += 1;
                error!(script = %path.display(), error = %format!("{e:#}"), "script failed");
            }
        }
    }

    info!(scripts = cli.scripts.len(), failures, "run complete");
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
