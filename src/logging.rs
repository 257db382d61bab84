use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Everything allowed by `TEAMSYNC_LOG` (default `teamsync=info`) goes to a
/// daily log file under `log_dir`; stderr only shows warnings unless
/// `verbose` is set. Keep the returned guard alive until exit so buffered
/// lines are flushed.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "teamsync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter =
    EnvFilter::try_from_env("TEAMSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("teamsync=info"));
  let stderr_level = if verbose {
    LevelFilter::DEBUG
  } else {
    LevelFilter::WARN
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_level),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

  Ok(guard)
}
