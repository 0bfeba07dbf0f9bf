//! Plugin lifecycle: owning the registry, caches and bridge, reloading
//! configuration and installing the interception.
//!
//! # Usage
//!
//! ```ignore
//! use dyntext_runtime::Engine;
//!
//! // At plugin load.
//! let engine = Engine::builder()
//!     .with_settings(dyntext_core::Settings::load_default()?)
//!     .with_script_vm(vm)
//!     .with_entity_lookup(entities)
//!     .build()?;
//! let interceptor = engine.interceptor(host);
//!
//! // When the host signals that its data is loaded.
//! engine.on_data_loaded(&interceptor)?;
//! ```

use std::{fmt, sync::Arc};

use dyntext_abi::EntityRef;
use dyntext_core::{
    ConfigSet, EntityLookup, LibraryCache, ManifestError, NoEntities, ProviderRegistry,
    RegistryError, ReloadReport, Resolution, ResolutionBridge, ResolveContext, ResultCache,
    ScriptVm, Settings,
    logging::{self, LoggingError},
};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, instrument, warn};

use crate::{
    host::{HostRefresh, TranslatorHost},
    intercept::{HookError, InstallOutcome, Interceptor},
};

/// Errors that can occur while building or driving an [`Engine`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The background runtime could not be started.
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The configuration directory could not be listed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Hook(#[from] HookError),

    /// The `[log]` settings could not be applied.
    #[error(transparent)]
    Logging(#[from] LoggingError),
}

/// Fluent builder for [`Engine`].
///
/// # Default Configuration
///
/// - Settings: [`Settings::default`]
/// - Runtime: the current tokio runtime if there is one, otherwise a small
///   runtime owned by the engine
/// - Script VM: none (script providers never produce text)
/// - Entity lookup: [`NoEntities`]
/// - Logging: left to the caller
pub struct EngineBuilder {
    settings: Settings,
    install_logging: bool,
    runtime: Option<Handle>,
    script_vm: Option<Arc<dyn ScriptVm>>,
    entities: Arc<dyn EntityLookup>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("settings", &self.settings)
            .field("runtime", &self.runtime.is_some())
            .field("script_vm", &self.script_vm.is_some())
            .field("install_logging", &self.install_logging)
            .finish_non_exhaustive()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            install_logging: false,
            runtime: None,
            script_vm: None,
            entities: Arc::new(NoEntities),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Installs the global subscriber from the settings' `[log]` section when
    /// the engine is built. Plugins without their own subscriber want this.
    #[must_use]
    pub fn with_logging(mut self, install: bool) -> Self {
        self.install_logging = install;
        self
    }

    /// Runs script tasks on `handle` instead of the default runtime.
    #[must_use]
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    #[must_use]
    pub fn with_script_vm(mut self, vm: Arc<dyn ScriptVm>) -> Self {
        self.script_vm = Some(vm);
        self
    }

    #[must_use]
    pub fn with_entity_lookup(mut self, entities: Arc<dyn EntityLookup>) -> Self {
        self.entities = entities;
        self
    }

    /// Builds the engine. Nothing is loaded until [`Engine::reload`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Runtime`] if a runtime had to be created and
    /// could not be, and [`EngineError::Logging`] if logging was requested
    /// and the `[log]` settings are invalid.
    pub fn build(self) -> Result<Engine, EngineError> {
        if self.install_logging && !logging::init(&self.settings.log)? {
            debug!("A tracing subscriber is already installed; keeping it");
        }

        let (handle, owned_runtime) = match self.runtime.or_else(|| Handle::try_current().ok()) {
            Some(handle) => (handle, None),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("dyntext-worker")
                    .enable_all()
                    .build()
                    .map_err(EngineError::Runtime)?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let mut bridge = ResolutionBridge::new(Arc::new(ResultCache::new()), handle)
            .with_refresh_policy(self.settings.refresh)
            .with_dedupe_inflight(self.settings.dedupe_inflight);
        if let Some(vm) = self.script_vm {
            bridge = bridge.with_script_vm(vm);
        }

        let libraries = match &self.settings.library_dir {
            Some(dir) => LibraryCache::with_search_dir(dir),
            None => LibraryCache::new(),
        };

        Ok(Engine {
            registry: Arc::new(ProviderRegistry::new()),
            libraries: Arc::new(libraries),
            bridge: Arc::new(bridge),
            entities: self.entities,
            settings: self.settings,
            owned_runtime,
        })
    }
}

/// The running engine.
///
/// The result cache lives as long as the engine; reloading replaces the
/// registry but keeps every cached script result.
pub struct Engine {
    settings: Settings,
    registry: Arc<ProviderRegistry>,
    libraries: Arc<LibraryCache>,
    bridge: Arc<ResolutionBridge>,
    entities: Arc<dyn EntityLookup>,
    owned_runtime: Option<Runtime>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("providers", &self.registry.len())
            .field("libraries", &self.libraries.len())
            .field("owns_runtime", &self.owned_runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn libraries(&self) -> &Arc<LibraryCache> {
        &self.libraries
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<ResolutionBridge> {
        &self.bridge
    }

    /// Rebuilds the registry from the configuration directory.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory cannot be listed or the
    /// registry lock is poisoned; bad entries are reported in the
    /// [`ReloadReport`].
    #[instrument(skip(self), fields(config_dir = %self.settings.config_dir.display()))]
    pub fn reload(&self) -> Result<ReloadReport, EngineError> {
        let config = ConfigSet::load_dir(&self.settings.config_dir)?;
        let report = dyntext_core::reload(
            &self.registry,
            &self.libraries,
            self.entities.as_ref(),
            config,
        )?;
        Ok(report)
    }

    /// Creates the interceptor for `host` and routes refresh requests for
    /// newly cached script results to it.
    pub fn interceptor<H: TranslatorHost>(&self, host: Arc<H>) -> Interceptor<H> {
        self.bridge
            .set_refresh_sink(Arc::new(HostRefresh::new(Arc::clone(&host))));
        Interceptor::new(host, Arc::clone(&self.registry), Arc::clone(&self.bridge))
            .with_key_prefix(self.settings.key_prefix.clone())
    }

    /// Host signal that its data is loaded: reload, then install.
    ///
    /// An unavailable translator is logged and left for a later call.
    ///
    /// # Errors
    ///
    /// Returns reload errors and interception errors other than
    /// [`HookError::NotReady`].
    pub fn on_data_loaded<H: TranslatorHost>(
        &self,
        interceptor: &Interceptor<H>,
    ) -> Result<ReloadReport, EngineError> {
        let report = self.reload()?;
        match interceptor.install() {
            Ok(InstallOutcome::Installed { .. } | InstallOutcome::AlreadyInstalled { .. }) => {}
            Err(HookError::NotReady) => {
                warn!("Host translator not ready; interception not installed yet");
            }
            Err(e) => return Err(e.into()),
        }
        info!(registered = report.registered, "Data loaded");
        Ok(report)
    }

    /// Resolves `key` outside of any host call. Returns `None` if no
    /// provider is registered for it.
    #[must_use]
    pub fn resolve(&self, key: &str, subject: EntityRef, owner: EntityRef) -> Option<Resolution> {
        let provider = self.registry.lookup(key)?;
        Some(
            self.bridge
                .resolve(&provider, key, ResolveContext::new(subject, owner)),
        )
    }

    /// Waits for every running script task to finish.
    pub async fn drain(&self) {
        self.bridge.drain().await;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        ffi::c_void,
        ptr::NonNull,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use dyntext_abi::TranslateInfo;
    use dyntext_core::{EntityId, ScriptCall, ScriptError, ScriptValue};

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_engine_is_send_sync() {
        assert_send_sync::<Engine>();
    }

    struct LoreVm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScriptVm for LoreVm {
        async fn call(&self, call: ScriptCall) -> Result<ScriptValue, ScriptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(call.callable, "GetLore");
            Ok(ScriptValue::String("Ancient Ruin".to_string()))
        }
    }

    /// Host whose translator never appears; records refresh requests.
    #[derive(Default)]
    struct AbsentHost {
        reissued: Mutex<Vec<String>>,
    }

    impl TranslatorHost for AbsentHost {
        type Info = TranslateInfo;

        const TRANSLATE_SLOT: usize = 2;

        fn active_translator(&self) -> Option<NonNull<c_void>> {
            None
        }

        fn default_table(&self) -> Option<NonNull<usize>> {
            None
        }

        unsafe fn lookup_key(&self, _info: *mut TranslateInfo) -> Option<String> {
            None
        }

        unsafe fn set_result(&self, _info: *mut TranslateInfo, _text: &str) -> bool {
            false
        }

        fn lookup_context(&self) -> ResolveContext {
            ResolveContext::default()
        }

        fn reissue_lookup(&self, key: &str) {
            self.reissued.lock().unwrap().push(key.to_string());
        }
    }

    fn write_entries(dir: &std::path::Path, name: &str, text: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), text).unwrap();
    }

    fn settings_for(dir: &std::path::Path) -> Settings {
        Settings {
            config_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_reload_registers_entries_from_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_entries(
            dir.path(),
            "lore.json",
            r#"{ "keys": ["LORE_A"], "scriptOwner": "LoreQuest", "scriptCallable": "GetLore" }"#,
        );
        let entities: HashMap<String, EntityId> =
            HashMap::from([("LoreQuest".to_string(), EntityId(0x42))]);
        let engine = Engine::builder()
            .with_settings(settings_for(dir.path()))
            .with_entity_lookup(Arc::new(entities))
            .build()
            .unwrap();

        let report = engine.reload().unwrap();

        assert_eq!(report.registered, 1);
        assert!(report.is_clean());
        assert!(engine.registry().lookup("LORE_A").is_some());
    }

    #[tokio::test]
    async fn test_on_data_loaded_tolerates_missing_translator() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder()
            .with_settings(settings_for(&dir.path().join("absent")))
            .build()
            .unwrap();
        let interceptor = engine.interceptor(Arc::new(AbsentHost::default()));

        let report = engine.on_data_loaded(&interceptor).unwrap();

        assert_eq!(report.registered, 0);
        assert!(!interceptor.is_installed());
    }

    #[tokio::test]
    async fn test_script_result_survives_reload_and_refreshes_host() {
        let dir = tempfile::tempdir().unwrap();
        write_entries(
            dir.path(),
            "lore.json",
            r#"{ "keys": ["LORE_A"], "scriptOwner": 66, "scriptCallable": "GetLore" }"#,
        );
        let vm = Arc::new(LoreVm {
            calls: AtomicUsize::new(0),
        });
        let engine = Engine::builder()
            .with_settings(settings_for(dir.path()))
            .with_script_vm(vm.clone())
            .build()
            .unwrap();
        let host = Arc::new(AbsentHost::default());
        let _interceptor = engine.interceptor(Arc::clone(&host));
        engine.reload().unwrap();

        let first = engine.resolve("LORE_A", EntityRef::NONE, EntityRef::NONE);
        engine.drain().await;
        engine.reload().unwrap();
        let second = engine.resolve("LORE_A", EntityRef::NONE, EntityRef::NONE);

        assert_eq!(first, Some(Resolution::NoOverride));
        assert_eq!(second, Some(Resolution::Text("Ancient Ruin".to_string())));
        assert_eq!(vm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*host.reissued.lock().unwrap(), vec!["LORE_A".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_unknown_key_is_none() {
        let engine = Engine::builder().build().unwrap();

        assert!(engine.resolve("MISSING", EntityRef::NONE, EntityRef::NONE).is_none());
    }

    #[test]
    fn test_build_outside_runtime_creates_and_drops_own_runtime() {
        let engine = Engine::builder().build().unwrap();

        assert!(engine.owned_runtime.is_some());
        drop(engine);
    }

    #[tokio::test]
    async fn test_build_with_logging_applies_log_settings() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("logs").join("dyntext.log");
        let mut settings = settings_for(dir.path());
        settings.log.file = Some(log_file.clone());

        let result = Engine::builder()
            .with_settings(settings)
            .with_logging(true)
            .build();

        assert!(result.is_ok(), "{result:?}");
        assert!(log_file.is_file());
    }

    #[tokio::test]
    async fn test_build_without_logging_leaves_log_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("dyntext.log");
        let mut settings = settings_for(dir.path());
        settings.log.file = Some(log_file.clone());

        Engine::builder().with_settings(settings).build().unwrap();

        assert!(!log_file.exists());
    }

    #[test]
    fn test_builder_debug_does_not_expose_vm() {
        let builder = EngineBuilder::new();

        let debug = format!("{builder:?}");

        assert!(debug.contains("EngineBuilder"));
        assert!(debug.contains("script_vm: false"));
    }
}
