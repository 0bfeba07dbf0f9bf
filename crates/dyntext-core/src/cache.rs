//! Cache of script resolution results.
//!
//! Entries are keyed by lookup key only and are never invalidated: once a
//! script resolver has answered for a key, that answer is served for as long
//! as the cache lives, including after the registry has been rebuilt and
//! even if the key is no longer registered. A stale value is therefore served
//! indefinitely. Callers that need fresh values must use a native resolver.

use std::{collections::HashMap, sync::RwLock};

use tracing::{debug, warn};

/// Concurrent map from lookup key to the last script-resolved text.
///
/// Locked independently from the provider registry.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<String, String>>,
}

impl ResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached text for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self.entries.read() {
            Ok(entries) => entries.get(key).cloned(),
            Err(_) => {
                warn!(key = %key, "Result cache lock poisoned; treating as miss");
                None
            }
        }
    }

    /// Stores `value` for `key`, replacing any previous value.
    ///
    /// Returns `false` if the lock is poisoned and nothing was stored.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        match self.entries.write() {
            Ok(mut entries) => {
                debug!(key = %key, "Cached script result");
                entries.insert(key, value.into());
                true
            }
            Err(_) => {
                warn!(key = %key, "Result cache lock poisoned; dropping result");
                false
            }
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .is_ok_and(|entries| entries.contains_key(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
