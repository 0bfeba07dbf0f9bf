//! JSON entry files.
//!
//! A configuration directory holds any number of `*.json` files. Each file is
//! either a single entry object or an array of entry objects:
//!
//! ```json
//! [
//!   { "keys": ["GREETING"], "library": "greetings.dll", "nativeSymbol": "greet" },
//!   { "keys": ["LORE_A", "LORE_B"], "scriptOwner": "LoreQuest", "scriptCallable": "GetLore" }
//! ]
//! ```
//!
//! Files are read in file-name order so that "last entry wins" for a
//! duplicated key is deterministic. A file that cannot be read or parsed, and
//! an array item that is not a well-formed entry, is reported and skipped;
//! nothing here aborts the load of the remaining files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::provider::EntityId;

/// Errors found while reading entry files.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// The directory or a file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The root value is neither an object nor an array.
    #[error("{}: expected an entry object or an array of entries, found {found}", path.display())]
    UnexpectedRoot { path: PathBuf, found: &'static str },

    /// An array item is not an object.
    #[error("{} [{index}]: expected an entry object, found {found}", path.display())]
    NotAnObject {
        path: PathBuf,
        index: usize,
        found: &'static str,
    },

    /// An entry object has fields of the wrong type.
    #[error("{} [{index}]: {source}", path.display())]
    Entry {
        path: PathBuf,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl ManifestError {
    /// File the problem was found in.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. }
            | Self::Parse { path, .. }
            | Self::UnexpectedRoot { path, .. }
            | Self::NotAnObject { path, .. }
            | Self::Entry { path, .. } => path,
        }
    }
}

/// Script owner as written in an entry: a numeric id, a `0x` hex id or an
/// editor id to look up in the entity database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OwnerRef {
    Id(u32),
    Name(String),
}

impl OwnerRef {
    /// Returns the id when the owner is given numerically.
    ///
    /// `Some(Err(..))` means the value looks like a hex id but is not one.
    #[must_use]
    pub fn numeric_id(&self) -> Option<Result<EntityId, String>> {
        match self {
            Self::Id(id) => Some(Ok(EntityId(*id))),
            Self::Name(name) => {
                let hex = name
                    .strip_prefix("0x")
                    .or_else(|| name.strip_prefix("0X"))?;
                Some(
                    u32::from_str_radix(hex, 16)
                        .map(EntityId)
                        .map_err(|e| format!("invalid hex owner id '{name}': {e}")),
                )
            }
        }
    }
}

/// One configuration entry.
///
/// Field names are camelCase. The older `strings`/`dll`/`papyrus`/`function`
/// names are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryConfig {
    /// Lookup keys this entry provides text for.
    #[serde(default, alias = "strings")]
    pub keys: Vec<String>,

    /// Library exporting the native resolver.
    #[serde(default, alias = "dll", skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    /// Exported symbol of the native resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_symbol: Option<String>,

    /// Expected SHA-256 of the library file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default, alias = "papyrus", skip_serializing_if = "Option::is_none")]
    pub script_owner: Option<OwnerRef>,

    #[serde(default, alias = "function", skip_serializing_if = "Option::is_none")]
    pub script_callable: Option<String>,
}

/// Entries read from one file.
#[derive(Debug)]
pub struct EntrySource {
    pub path: PathBuf,
    pub entries: Vec<EntryConfig>,
    /// Items of this file that were skipped.
    pub skipped: Vec<ManifestError>,
}

impl EntrySource {
    /// Parses the contents of one entry file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Parse`] if `text` is not JSON and
    /// [`ManifestError::UnexpectedRoot`] if it is neither an object nor an
    /// array. Bad array items are collected in `skipped` instead.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Result<Self, ManifestError> {
        let path = path.into();
        let root: JsonValue = serde_json::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.clone(),
            source,
        })?;

        let mut source = Self {
            path,
            entries: Vec::new(),
            skipped: Vec::new(),
        };
        match root {
            JsonValue::Object(_) => source.push_item(0, root),
            JsonValue::Array(items) => {
                for (index, item) in items.into_iter().enumerate() {
                    source.push_item(index, item);
                }
            }
            other => {
                return Err(ManifestError::UnexpectedRoot {
                    path: source.path,
                    found: json_kind(&other),
                });
            }
        }
        Ok(source)
    }

    /// Reads and parses one entry file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Io`] if the file cannot be read, otherwise as
    /// [`EntrySource::parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    fn push_item(&mut self, index: usize, item: JsonValue) {
        if !item.is_object() {
            let problem = ManifestError::NotAnObject {
                path: self.path.clone(),
                index,
                found: json_kind(&item),
            };
            warn!(error = %problem, "Skipping entry");
            self.skipped.push(problem);
            return;
        }
        match serde_json::from_value::<EntryConfig>(item) {
            Ok(entry) => self.entries.push(entry),
            Err(source) => {
                let problem = ManifestError::Entry {
                    path: self.path.clone(),
                    index,
                    source,
                };
                warn!(error = %problem, "Skipping entry");
                self.skipped.push(problem);
            }
        }
    }
}

/// Everything read from a configuration directory.
#[derive(Debug, Default)]
pub struct ConfigSet {
    /// Parsed files, in file-name order.
    pub sources: Vec<EntrySource>,
    /// Files that could not be read or parsed at all.
    pub problems: Vec<ManifestError>,
}

impl ConfigSet {
    /// Reads every `*.json` file directly inside `dir`.
    ///
    /// A missing directory yields an empty set.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Io`] if `dir` exists but cannot be listed.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref();
        let listing = match std::fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "Configuration directory not found");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ManifestError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut files: Vec<PathBuf> = listing
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_json(path))
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut set = Self::default();
        for path in files {
            match EntrySource::load(&path) {
                Ok(source) => {
                    debug!(
                        file = %path.display(),
                        entries = source.entries.len(),
                        skipped = source.skipped.len(),
                        "Read entry file"
                    );
                    set.sources.push(source);
                }
                Err(problem) => {
                    warn!(error = %problem, "Skipping entry file");
                    set.problems.push(problem);
                }
            }
        }
        Ok(set)
    }

    /// Total number of parsed entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.sources.iter().map(|s| s.entries.len()).sum()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
