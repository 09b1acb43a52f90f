use std::process::ExitCode;

use anyhow::{Context, Result};
use fundmetrics::prelude::*;
use tracing::{error, info};

fn main() -> ExitCode {
    let guard = match fundmetrics::telemetry::init_tracing("fundmetrics") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fundmetrics: failed to initialise logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Run aborted during setup");
            eprintln!("fundmetrics: {e:#}");
            ExitCode::FAILURE
        }
    };

    // Flushes buffered log lines.
    drop(guard);
    code
}

fn run() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;
    info!(
        source = %config.source_db().display(),
        destination = %config.destination_db().display(),
        modes = ?config.modes(),
        "Starting fundmetrics"
    );

    let summaries = run_from_config(config).context("Engine setup failed")?;
    for s in &summaries {
        info!(
            mode = %s.mode,
            attempted = s.attempted,
            written = s.written,
            skipped = s.skipped_empty,
            failed = s.failed,
            rows = s.rows,
            "Mode summary"
        );
    }
    Ok(())
}
