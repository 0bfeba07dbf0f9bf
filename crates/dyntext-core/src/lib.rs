//! Core of the dyntext text-lookup engine.
//!
//! This crate owns everything between a lookup key and the text that replaces
//! the host's own: where resolvers come from and how they are called.
//!
//! # Key Components
//!
//! - **Library loading**: [`LibraryCache`] loads each resolver library once
//!   and resolves exported [`NativeResolverFn`](dyntext_abi::NativeResolverFn)
//!   symbols from it.
//! - **Providers**: a [`Provider`] binds a key to a native resolver, a script
//!   callable, or both.
//! - **Registry**: [`ProviderRegistry`] is the key-to-provider mapping read on
//!   every intercepted lookup and rebuilt wholesale by [`reload`].
//! - **Resolution**: [`ResolutionBridge`] calls native resolvers directly and
//!   runs script calls in the background, serving their results from the
//!   [`ResultCache`] on later lookups.
//! - **Configuration**: JSON entry files ([`ConfigSet`]) and the engine's own
//!   [`Settings`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dyntext_core::{ConfigSet, LibraryCache, NoEntities, ProviderRegistry, reload};
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! let libraries = LibraryCache::with_search_dir("Data/dyntext/lib");
//! let config = ConfigSet::load_dir("Data/dyntext")?;
//! let report = reload(&registry, &libraries, &NoEntities, config)?;
//! println!("{} keys registered", report.registered);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Thread Safety
//!
//! The registry and the result cache are independent reader-writer locks;
//! the library cache is a mutex held for the whole of a load. None of them
//! is held while a resolver runs.

mod bridge;
mod cache;
mod ingest;
mod loader;
pub mod logging;
mod manifest;
mod provider;
mod registry;
mod script;
mod settings;

pub use bridge::{
    PendingResolution, RefreshPolicy, RefreshSink, Resolution, ResolutionBridge, ResolveContext,
    ScriptOutcome,
};
pub use cache::ResultCache;
pub use ingest::{
    Diagnostic, EntityLookup, EntryError, NoEntities, ReloadReport, build_provider, build_set,
    reload,
};
pub use loader::{LibraryCache, LibraryHandle, LoadError};
pub use manifest::{ConfigSet, EntryConfig, EntrySource, ManifestError, OwnerRef};
pub use provider::{EntityId, Provider, ProviderError, ScriptTarget};
pub use registry::{ProviderRegistry, ProviderSet, RegistryError};
pub use script::{ScriptCall, ScriptError, ScriptValue, ScriptVm};
pub use settings::{DEFAULT_SETTINGS_FILE, LogSettings, SETTINGS_ENV, Settings, SettingsError};
