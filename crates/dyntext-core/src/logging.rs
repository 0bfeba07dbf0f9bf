//! Log output for plugin builds.
//!
//! Hosts rarely give a plugin a console, so the subscriber can write to a
//! file instead of stderr.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_subscriber::EnvFilter;

use crate::settings::LogSettings;

/// Errors that can occur while setting up logging.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },

    #[error("failed to open log file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides `settings.level` when set. Returns `Ok(false)` if
/// another subscriber was already installed; that one is left in place.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] for an invalid level directive and
/// [`LoggingError::File`] if the log file cannot be opened.
pub fn init(settings: &LogSettings) -> Result<bool, LoggingError> {
    let filter = filter_for(&settings.level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match &settings.file {
        Some(path) => {
            let file = open_log_file(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .is_ok()
        }
        None => builder.with_writer(std::io::stderr).try_init().is_ok(),
    };
    Ok(installed)
}

fn filter_for(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::Filter {
        directive: level.to_string(),
        reason: e.to_string(),
    })
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let to_error = |source| LoggingError::File {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_error)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_log_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("dyntext.log");

        let file = open_log_file(&path);

        assert!(file.is_ok());
        assert!(path.is_file());
    }

    #[test]
    fn test_init_twice_keeps_first_subscriber() {
        let settings = LogSettings::default();

        init(&settings).unwrap();
        let second = init(&settings).unwrap();

        assert!(!second);
    }
}
