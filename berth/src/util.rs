use std::path::Path;

use berth_shared::errors::{BerthError, BerthResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Log file name prefix inside the logs directory.
pub const LOG_FILE_NAME: &str = "berth.log";

/// Initialize file logging under `logs_dir` with daily rotation.
///
/// Filter comes from `RUST_LOG`, defaulting to `info`. Keep the returned
/// guard alive for as long as logs should be flushed.
pub fn init_logging(logs_dir: impl AsRef<Path>) -> BerthResult<WorkerGuard> {
    let logs_dir = logs_dir.as_ref();
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        BerthError::Config(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| BerthError::Config(format!("Invalid log filter: {}", e)))?;

    register_to_tracing(non_blocking, env_filter);
    Ok(guard)
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}
