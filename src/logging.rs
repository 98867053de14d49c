//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Logs go to a daily file when a
/// directory is configured and to stderr otherwise, leaving stdout for
/// reports. The returned guard must be held until exit to flush the file.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => EnvFilter::try_new(&config.level)
      .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?,
  };
  let registry = tracing_subscriber::registry().with(filter);

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, "pagesync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      registry
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      registry
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(None)
    }
  }
}
