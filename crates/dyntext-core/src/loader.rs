//! Dynamic library loading for native resolvers.
//!
//! Libraries are loaded at most once per [`LibraryCache`] and are never
//! unloaded: function pointers resolved from them may be held by live
//! providers for as long as the process runs. The cache mutex is held for the
//! whole load, so loads are strictly sequential. That is fine because they
//! only happen while a configuration reload is running.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use abi_stable::library::RawLibrary;
use dyntext_abi::NativeResolverFn;
use tracing::{debug, error, info};

/// Errors that can occur when loading a resolver library or one of its
/// symbols.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    /// The library could not be found or the OS loader rejected it.
    #[error("failed to load library '{name}': {reason}")]
    LibraryLoad { name: String, reason: String },

    /// The library loaded but does not export the requested symbol.
    #[error("symbol '{symbol}' not found in library '{library}': {reason}")]
    SymbolMissing {
        library: String,
        symbol: String,
        reason: String,
    },

    /// The library file does not match the configured checksum.
    #[error("checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Empty library or symbol name.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The cache mutex was poisoned by a panicking loader.
    #[error("library cache lock poisoned")]
    LockPoisoned,
}

struct LoadedLibrary {
    name: String,
    path: PathBuf,
    raw: RawLibrary,
}

/// Shared handle to a loaded library.
///
/// Every provider resolved from the same library name holds a clone of the
/// same handle. Resolved function pointers are valid as long as any handle is
/// alive.
#[derive(Clone)]
pub struct LibraryHandle {
    inner: Arc<LoadedLibrary>,
}

impl LibraryHandle {
    /// Name the library was requested under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Path handed to the OS loader.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Resolves an exported resolver function.
    ///
    /// The export is assumed to have the [`NativeResolverFn`] signature; the
    /// loader cannot check that.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::SymbolMissing`] if the library does not export
    /// `symbol`, or [`LoadError::InvalidName`] for an empty name.
    pub fn resolve(&self, symbol: &str) -> Result<NativeResolverFn, LoadError> {
        if symbol.is_empty() {
            return Err(LoadError::InvalidName("empty symbol name".to_string()));
        }

        // SAFETY: resolver exports are declared with `NativeResolverFn`; the
        // pointer is copied out and stays valid while `self` keeps the
        // library loaded.
        let entry = unsafe { self.inner.raw.get::<NativeResolverFn>(symbol.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|e| LoadError::SymbolMissing {
                library: self.inner.name.clone(),
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        debug!(library = %self.inner.name, symbol = %symbol, "Resolved native resolver");
        Ok(entry)
    }

    /// Returns `true` if both handles refer to the same loaded library.
    #[must_use]
    pub fn same_library(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

/// Load-once cache of resolver libraries keyed by library name.
#[derive(Default)]
pub struct LibraryCache {
    libraries: Mutex<HashMap<String, LibraryHandle>>,
    search_dir: Option<PathBuf>,
}

impl LibraryCache {
    /// Creates an empty cache that hands names straight to the OS loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache that looks for relative names in `dir` first.
    #[must_use]
    pub fn with_search_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            libraries: Mutex::new(HashMap::new()),
            search_dir: Some(dir.into()),
        }
    }

    /// Returns the cached handle for `name`, loading the library on first
    /// use.
    ///
    /// A failed load is not cached; the next call with the same name tries
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::LibraryLoad`] if the library cannot be loaded and
    /// [`LoadError::ChecksumMismatch`] if `checksum` is given and does not
    /// match the file's SHA-256 digest.
    pub fn get_or_load(&self, name: &str, checksum: Option<&str>) -> Result<LibraryHandle, LoadError> {
        if name.is_empty() {
            return Err(LoadError::InvalidName("empty library name".to_string()));
        }

        let mut libraries = self.libraries.lock().map_err(|_| LoadError::LockPoisoned)?;
        if let Some(handle) = libraries.get(name) {
            return Ok(handle.clone());
        }

        let path = self.locate(name);
        if let Some(expected) = checksum {
            verify_checksum(name, &path, expected)?;
        }

        let raw = RawLibrary::load_at(&path).map_err(|e| {
            error!(library = %name, path = %path.display(), error = %e, "Failed to load library");
            LoadError::LibraryLoad {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;

        let handle = LibraryHandle {
            inner: Arc::new(LoadedLibrary {
                name: name.to_string(),
                path,
                raw,
            }),
        };
        libraries.insert(name.to_string(), handle.clone());

        info!(library = %name, path = %handle.path().display(), "Loaded library");
        Ok(handle)
    }

    /// Returns `true` if `name` has been loaded successfully.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.libraries
            .lock()
            .is_ok_and(|libraries| libraries.contains_key(name))
    }

    /// Number of loaded libraries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.libraries.lock().map_or(0, |libraries| libraries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, name: &str) -> PathBuf {
        let requested = Path::new(name);
        if requested.is_relative()
            && let Some(dir) = &self.search_dir
        {
            let candidate = dir.join(requested);
            if candidate.is_file() {
                return candidate;
            }
        }
        requested.to_path_buf()
    }
}

fn verify_checksum(name: &str, path: &Path, expected: &str) -> Result<(), LoadError> {
    let bytes = std::fs::read(path).map_err(|e| LoadError::LibraryLoad {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let digest = sha256::digest(&bytes[..]);
    if !digest.eq_ignore_ascii_case(expected) {
        return Err(LoadError::ChecksumMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: digest,
        });
    }
    debug!(library = %name, checksum = %digest, "Checksum verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    const SYSTEM_LIBRARY: &str = "libc.so.6";

    #[test]
    fn test_load_error_display_messages() {
        let library_load = LoadError::LibraryLoad {
            name: "x".to_string(),
            reason: "boom".to_string(),
        };
        let symbol_missing = LoadError::SymbolMissing {
            library: "x".to_string(),
            symbol: "Hello".to_string(),
            reason: "absent".to_string(),
        };

        assert_eq!(library_load.to_string(), "failed to load library 'x': boom");
        assert_eq!(
            symbol_missing.to_string(),
            "symbol 'Hello' not found in library 'x': absent"
        );
        assert_eq!(
            LoadError::InvalidName("empty".to_string()).to_string(),
            "invalid name: empty"
        );
    }

    #[test]
    fn test_load_nonexistent_library_returns_library_load_error() {
        let cache = LibraryCache::new();

        let result = cache.get_or_load("/nonexistent/path/to/libmissing.so", None);

        let Err(err) = result else {
            panic!("expected loading a nonexistent library to fail");
        };
        assert!(matches!(err, LoadError::LibraryLoad { .. }));
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache = LibraryCache::new();

        assert!(cache.get_or_load("/nonexistent/libx.so", None).is_err());
        assert!(cache.get_or_load("/nonexistent/libx.so", None).is_err());

        assert!(cache.is_empty());
        assert!(!cache.is_loaded("/nonexistent/libx.so"));
    }

    #[test]
    fn test_empty_library_name_is_rejected() {
        let cache = LibraryCache::new();

        let result = cache.get_or_load("", None);

        assert!(matches!(result, Err(LoadError::InvalidName(_))));
    }

    #[test]
    fn test_checksum_mismatch_is_reported_before_loading() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("libfake.so");
        std::fs::write(&path, b"not a real library").expect("write fake library");
        let cache = LibraryCache::new();

        let result = cache.get_or_load(path.to_str().expect("utf-8 path"), Some("deadbeef"));

        let Err(LoadError::ChecksumMismatch { expected, actual, .. }) = result else {
            panic!("expected a checksum mismatch");
        };
        assert_eq!(expected, "deadbeef");
        assert_eq!(actual, sha256::digest(&b"not a real library"[..]));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_search_dir_is_preferred_for_relative_names() {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("libresolver.so"), b"").expect("write file");
        let cache = LibraryCache::with_search_dir(dir.path());

        assert_eq!(cache.locate("libresolver.so"), dir.path().join("libresolver.so"));
        assert_eq!(cache.locate("libother.so"), PathBuf::from("libother.so"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_get_or_load_returns_cached_handle_on_second_call() {
        let cache = LibraryCache::new();

        let first = cache.get_or_load(SYSTEM_LIBRARY, None).expect("load libc");
        let second = cache.get_or_load(SYSTEM_LIBRARY, None).expect("cached libc");

        assert!(first.same_library(&second));
        assert_eq!(cache.len(), 1);
        assert_eq!(first.name(), SYSTEM_LIBRARY);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_missing_symbol_returns_symbol_missing() {
        let cache = LibraryCache::new();
        let handle = cache.get_or_load(SYSTEM_LIBRARY, None).expect("load libc");

        let result = handle.resolve("dyntext_definitely_not_exported");

        assert!(matches!(result, Err(LoadError::SymbolMissing { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_existing_symbol_succeeds() {
        let cache = LibraryCache::new();
        let handle = cache.get_or_load(SYSTEM_LIBRARY, None).expect("load libc");

        // Only resolved, never called: the signature does not match.
        assert!(handle.resolve("strlen").is_ok());
    }

    #[test]
    fn test_load_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoadError>();
        assert_send_sync::<LibraryHandle>();
        assert_send_sync::<LibraryCache>();
    }
}
