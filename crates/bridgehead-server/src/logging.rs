//! Process-wide logging setup.
//!
//! Terminal output plus an optional log file, each with its own filter.
//! `RUST_LOG` overrides the configured terminal filter.

use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{FatalError, config::LoggingConfig};

/// Install the global subscriber described by `config`.
///
/// `now_secs` dates the log file name. Returns the log file path when one
/// is configured. A subscriber that is already installed (tests, embedding
/// programs) is left in place.
pub fn init(config: &LoggingConfig, now_secs: i64) -> Result<Option<PathBuf>, FatalError> {
    let print_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.print_level));

    let path = log_file_path(config, now_secs);
    let file_layer = match &path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| FatalError::LogFile(format!("{}: {e}", dir.display())))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| FatalError::LogFile(format!("{}: {e}", path.display())))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new(&config.file_level)),
            )
        },
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(print_filter))
        .with(file_layer)
        .try_init();
    if let Err(e) = installed {
        debug!(error = %e, "global subscriber already installed");
    }

    Ok(path)
}

/// Log file for `config` at `now_secs`, `None` when file logging is off.
pub fn log_file_path(config: &LoggingConfig, now_secs: i64) -> Option<PathBuf> {
    if config.file_name_format.is_empty() {
        return None;
    }
    let date = DateTime::<Utc>::from_timestamp(now_secs, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let name = config.file_name_format.replace("{date}", &date);
    Some(PathBuf::from(&config.directory).join(name))
}
