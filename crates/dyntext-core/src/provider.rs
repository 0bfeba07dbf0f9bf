//! Resolver descriptors bound to lookup keys.

use std::fmt;

use dyntext_abi::NativeResolverFn;

use crate::loader::LibraryHandle;

/// Host-internal numeric identifier of an entity (as resolved by the host's
/// entity database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Address of a callable in the embedded script VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    /// Entity owning the script.
    pub owner: EntityId,
    /// Name the owner was configured under, when it came from an editor id.
    /// Script VMs that dispatch static calls by class name use this.
    pub owner_name: Option<String>,
    /// Function to call on the owner.
    pub callable: String,
}

impl ScriptTarget {
    #[must_use]
    pub fn new(owner: EntityId, callable: impl Into<String>) -> Self {
        Self {
            owner,
            owner_name: None,
            callable: callable.into(),
        }
    }

    #[must_use]
    pub fn with_owner_name(mut self, name: impl Into<String>) -> Self {
        self.owner_name = Some(name.into());
        self
    }
}

/// Error returned when a provider would have no resolver at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider has neither a native resolver nor a script target")]
    Empty,
}

/// One resolution strategy for a lookup key.
///
/// A provider always has a native resolver, a script target, or both; the
/// constructors make the empty case unrepresentable. When both are present
/// the native resolver wins.
#[derive(Clone)]
pub struct Provider {
    library: Option<LibraryHandle>,
    native: Option<NativeResolverFn>,
    script: Option<ScriptTarget>,
}

impl Provider {
    /// Provider backed by a function exported from a loaded library.
    #[must_use]
    pub fn native(library: LibraryHandle, entry: NativeResolverFn) -> Self {
        Self {
            library: Some(library),
            native: Some(entry),
            script: None,
        }
    }

    /// Provider backed by an in-process function (statically linked
    /// resolvers and tests).
    #[must_use]
    pub fn from_fn(entry: NativeResolverFn) -> Self {
        Self {
            library: None,
            native: Some(entry),
            script: None,
        }
    }

    /// Provider backed only by a script callable.
    #[must_use]
    pub fn script(target: ScriptTarget) -> Self {
        Self {
            library: None,
            native: None,
            script: Some(target),
        }
    }

    /// Builds a provider from optional parts.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Empty`] if neither `native` nor `script` is
    /// set.
    pub fn new(
        library: Option<LibraryHandle>,
        native: Option<NativeResolverFn>,
        script: Option<ScriptTarget>,
    ) -> Result<Self, ProviderError> {
        if native.is_none() && script.is_none() {
            return Err(ProviderError::Empty);
        }
        Ok(Self {
            library: if native.is_some() { library } else { None },
            native,
            script,
        })
    }

    /// Adds a script fallback to this provider.
    #[must_use]
    pub fn with_script(mut self, target: ScriptTarget) -> Self {
        self.script = Some(target);
        self
    }

    #[must_use]
    pub fn native_entry(&self) -> Option<NativeResolverFn> {
        self.native
    }

    #[must_use]
    pub fn script_target(&self) -> Option<&ScriptTarget> {
        self.script.as_ref()
    }

    #[must_use]
    pub fn library(&self) -> Option<&LibraryHandle> {
        self.library.as_ref()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("library", &self.library.as_ref().map(LibraryHandle::name))
            .field("native", &self.native.is_some())
            .field("script", &self.script)
            .finish()
    }
}
