use std::{env, fs, path::PathBuf};

use time::macros::format_description;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{format::FmtSpan, time::UtcTime},
};

use crate::error::{EngineResult, IoError};

/// Installs the global JSON subscriber.
///
/// Logs go to stdout inside a container (`CONTAINER` set or `/.dockerenv` present) and to a
/// timestamped file under the platform state directory otherwise. The returned guard must be
/// held until exit so buffered lines are flushed.
pub fn init_tracing(app_name: &str) -> EngineResult<Option<WorkerGuard>> {
    let in_container = env::var("CONTAINER").is_ok() || PathBuf::from("/.dockerenv").exists();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if in_container {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_span_events(FmtSpan::NONE)
            .with_current_span(true)
            .with_timer(UtcTime::rfc_3339())
            .init();

        info!("Logging to stdout (container mode)");
        return Ok(None);
    }

    let log_dir = log_dir(app_name);
    fs::create_dir_all(&log_dir).map_err(|e| {
        IoError::FileSystem(format!(
            "Failed to create log directory {}: {e}",
            log_dir.display()
        ))
    })?;

    let timestamp = time::OffsetDateTime::now_utc()
        .format(&format_description!(
            "[year][month][day]-[hour][minute][second]"
        ))
        .map_err(|e| IoError::WriteFailed(format!("Failed to format log timestamp: {e}")))?;
    let file_name = format!("{app_name}-{timestamp}.log");
    let file_path = log_dir.join(&file_name);

    let file_appender = tracing_appender::rolling::never(&log_dir, &file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .with_span_events(FmtSpan::NONE)
        .with_current_span(true)
        .with_timer(UtcTime::rfc_3339())
        .init();

    info!(log_file = %file_path.display(), "Logging to file (local mode)");
    Ok(Some(guard))
}

fn log_dir(app_name: &str) -> PathBuf {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .unwrap_or_else(env::temp_dir)
        .join(app_name)
        .join("logs")
}
