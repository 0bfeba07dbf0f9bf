//! Engine settings (`dyntext.toml`).
//!
//! Every field has a default, so a missing file or an empty one is a valid
//! configuration.
//!
//! # Example
//!
//! ```toml
//! config_dir = "Data/dyntext"
//! library_dir = "Data/dyntext/lib"
//! key_prefix = "$"
//! refresh = "reissue"
//! dedupe_inflight = true
//!
//! [log]
//! level = "debug"
//! file = "logs/dyntext.log"
//! ```
//!
//! Relative paths are resolved against the directory containing the settings
//! file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::bridge::RefreshPolicy;

/// Environment variable naming the settings file.
pub const SETTINGS_ENV: &str = "DYNTEXT_SETTINGS";

/// Settings file used when [`SETTINGS_ENV`] is unset.
pub const DEFAULT_SETTINGS_FILE: &str = "dyntext.toml";

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("failed to read settings {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid settings TOML.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Write log lines to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the JSON entry files.
    pub config_dir: PathBuf,
    /// Directory searched first for relative library names.
    pub library_dir: Option<PathBuf>,
    /// Prefix a host key must carry to be looked up; stripped before lookup.
    pub key_prefix: String,
    pub refresh: RefreshPolicy,
    /// Share one script call between concurrent lookups of the same key.
    pub dedupe_inflight: bool,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("dyntext"),
            library_dir: None,
            key_prefix: "$".to_string(),
            refresh: RefreshPolicy::default(),
            dedupe_inflight: true,
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Parses settings from TOML text. Paths are left as written.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] on invalid TOML or mistyped fields.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads settings from `path`, falling back to defaults if the file does
    /// not exist. Relative paths are made relative to the file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Io`] if the file exists but cannot be read and
    /// [`SettingsError::Parse`] if it is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let settings = match fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(settings.relative_to(base))
    }

    /// Loads settings from the file named by `DYNTEXT_SETTINGS`, or from
    /// `dyntext.toml` in the current directory.
    ///
    /// # Errors
    ///
    /// As [`Settings::load`].
    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load(settings_path(std::env::var_os(SETTINGS_ENV)))
    }

    /// Resolves relative paths against `base`.
    #[must_use]
    pub fn relative_to(mut self, base: &Path) -> Self {
        self.config_dir = join(base, self.config_dir);
        self.library_dir = self.library_dir.map(|dir| join(base, dir));
        self.log.file = self.log.file.map(|file| join(base, file));
        self
    }
}

fn settings_path(env_value: Option<std::ffi::OsString>) -> PathBuf {
    env_value
        .filter(|value| !value.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE), PathBuf::from)
}

fn join(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}
