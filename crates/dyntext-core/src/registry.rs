//! Registry mapping lookup keys to providers.
//!
//! # Thread Safety
//!
//! The registry is read on the host's render path and rewritten only during a
//! configuration reload, so it sits behind a reader-writer lock:
//!
//! - [`ProviderRegistry::lookup`] takes the shared lock and returns a clone
//!   of the provider, so a reload racing with a lookup cannot invalidate what
//!   the caller holds.
//! - [`ProviderRegistry::replace_all`] builds nothing under the lock; the new
//!   mapping is staged in a [`ProviderSet`] first and swapped in under the
//!   exclusive lock. Readers see either the old or the new snapshot, never a
//!   mix.

use std::{collections::HashMap, sync::RwLock};

use tracing::{debug, info, warn};

use crate::provider::Provider;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A writer panicked while holding the registry lock.
    #[error("provider registry lock poisoned")]
    LockPoisoned,
}

/// Staging area for a registry rebuild.
///
/// Keys are unique; registering a key twice keeps the later provider.
#[derive(Debug, Default)]
pub struct ProviderSet {
    providers: HashMap<String, Provider>,
}

impl ProviderSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the provider for `key`.
    ///
    /// Returns the provider it replaced, if any.
    pub fn register(&mut self, key: impl Into<String>, provider: Provider) -> Option<Provider> {
        let key = key.into();
        let previous = self.providers.insert(key.clone(), provider);
        if previous.is_some() {
            debug!(key = %key, "Provider overridden by a later entry");
        }
        previous
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Provider> {
        self.providers.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl FromIterator<(String, Provider)> for ProviderSet {
    fn from_iter<I: IntoIterator<Item = (String, Provider)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (key, provider) in iter {
            set.register(key, provider);
        }
        set
    }
}

/// Concurrently readable mapping from lookup key to [`Provider`].
///
/// Keys are case-sensitive. The registry starts empty and is rebuilt in full
/// on every configuration reload.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Provider>>,
}

impl ProviderRegistry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole mapping with `set`.
    ///
    /// Returns the number of registered keys.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockPoisoned`] if the lock is poisoned.
    pub fn replace_all(&self, set: ProviderSet) -> Result<usize, RegistryError> {
        let count = set.providers.len();
        let previous = {
            let mut providers = self
                .providers
                .write()
                .map_err(|_| RegistryError::LockPoisoned)?;
            std::mem::replace(&mut *providers, set.providers)
        };

        info!(
            registered = count,
            discarded = previous.len(),
            "Provider registry replaced"
        );
        Ok(count)
    }

    /// Inserts or overwrites a single provider.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockPoisoned`] if the lock is poisoned.
    pub fn register(
        &self,
        key: impl Into<String>,
        provider: Provider,
    ) -> Result<Option<Provider>, RegistryError> {
        let key = key.into();
        let mut providers = self
            .providers
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?;
        debug!(key = %key, "Registered provider");
        Ok(providers.insert(key, provider))
    }

    /// Removes every provider.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockPoisoned`] if the lock is poisoned.
    pub fn clear(&self) -> Result<(), RegistryError> {
        self.providers
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?
            .clear();
        Ok(())
    }

    /// Returns a copy of the provider registered for `key`.
    ///
    /// A poisoned lock is treated as "no provider": the host keeps its
    /// original text.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Provider> {
        match self.providers.read() {
            Ok(providers) => providers.get(key).cloned(),
            Err(_) => {
                warn!(key = %key, "Provider registry lock poisoned; skipping lookup");
                None
            }
        }
    }

    /// Returns the registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match self.providers.read() {
            Ok(providers) => providers.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }

    /// Returns the number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().map_or(0, |providers| providers.len())
    }

    /// Returns `true` if no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
