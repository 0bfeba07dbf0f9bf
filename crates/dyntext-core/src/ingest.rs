//! Turning configuration entries into registered providers.
//!
//! A reload always runs to completion. Each entry is validated on its own;
//! an entry whose native half fails to load degrades to its script half (and
//! the reverse), and only an entry with nothing left is dropped. Every
//! problem is recorded as a [`Diagnostic`] in the [`ReloadReport`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};

use crate::{
    loader::{LibraryCache, LoadError},
    manifest::{ConfigSet, EntryConfig, ManifestError, OwnerRef},
    provider::{EntityId, Provider, ScriptTarget},
    registry::{ProviderRegistry, ProviderSet, RegistryError},
};

/// Read access to the host's entity database.
///
/// Used only while ingesting configuration, to resolve script owners given by
/// editor id.
pub trait EntityLookup: Send + Sync {
    fn find_by_editor_id(&self, editor_id: &str) -> Option<EntityId>;
}

/// Entity database that knows no editor ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEntities;

impl EntityLookup for NoEntities {
    fn find_by_editor_id(&self, _editor_id: &str) -> Option<EntityId> {
        None
    }
}

impl EntityLookup for HashMap<String, EntityId> {
    fn find_by_editor_id(&self, editor_id: &str) -> Option<EntityId> {
        self.get(editor_id).copied()
    }
}

/// Problems with a single entry.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EntryError {
    /// The entry is malformed and was rejected before anything was loaded.
    #[error("invalid entry: {0}")]
    Validation(String),

    /// The entry's library could not be loaded.
    #[error(transparent)]
    Load(LoadError),

    /// The entry's library does not export its symbol.
    #[error(transparent)]
    Symbol(LoadError),

    /// The script owner's editor id is not in the entity database.
    #[error("script owner '{0}' not found")]
    UnresolvedOwner(String),

    /// The file or array item holding the entry could not be read.
    #[error(transparent)]
    Manifest(ManifestError),
}

/// One recorded ingestion problem.
#[derive(Debug)]
pub struct Diagnostic {
    /// File the entry came from.
    pub source: PathBuf,
    /// Keys of the affected entry (empty for file-level problems).
    pub keys: Vec<String>,
    pub error: EntryError,
    /// `true` if the entry registered nothing because of this problem.
    pub dropped: bool,
}

/// Summary of a reload.
#[derive(Debug, Default)]
pub struct ReloadReport {
    /// Files that were parsed.
    pub files: usize,
    /// Entries read across all files.
    pub entries: usize,
    /// Keys in the registry after the reload.
    pub registered: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl ReloadReport {
    /// `true` if nothing was skipped or degraded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Number of entries that registered nothing.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.dropped).count()
    }

    fn record(&mut self, source: &Path, keys: &[String], error: EntryError, dropped: bool) {
        if dropped {
            warn!(file = %source.display(), keys = ?keys, error = %error, "Entry dropped");
        } else {
            warn!(file = %source.display(), keys = ?keys, error = %error, "Entry degraded");
        }
        self.diagnostics.push(Diagnostic {
            source: source.to_path_buf(),
            keys: keys.to_vec(),
            error,
            dropped,
        });
    }
}

/// Builds the provider for one entry.
///
/// On success returns the provider together with the problems it was
/// degraded by. Fails with every problem found if nothing usable is left.
///
/// # Errors
///
/// Returns [`EntryError::Validation`] for malformed entries (checked before
/// any library is loaded), or the load, symbol and owner errors that left the
/// entry without any resolver.
pub fn build_provider(
    entry: &EntryConfig,
    libraries: &LibraryCache,
    entities: &dyn EntityLookup,
) -> Result<(Provider, Vec<EntryError>), Vec<EntryError>> {
    let (native_spec, script_spec) = validate(entry).map_err(|e| vec![e])?;

    let mut problems = Vec::new();

    let mut library = None;
    let mut native = None;
    if let Some((name, symbol)) = native_spec {
        match libraries.get_or_load(name, entry.checksum.as_deref()) {
            Ok(handle) => match handle.resolve(symbol) {
                Ok(entry_fn) => {
                    native = Some(entry_fn);
                    library = Some(handle);
                }
                Err(e) => problems.push(EntryError::Symbol(e)),
            },
            Err(e) => problems.push(EntryError::Load(e)),
        }
    }

    let mut script = None;
    if let Some((owner, callable)) = script_spec {
        match resolve_owner(owner, callable, entities) {
            Ok(target) => script = Some(target),
            Err(e) => problems.push(e),
        }
    }

    match Provider::new(library, native, script) {
        Ok(provider) => Ok((provider, problems)),
        Err(_) => Err(problems),
    }
}

type NativeSpec<'a> = Option<(&'a str, &'a str)>;
type ScriptSpec<'a> = Option<(&'a OwnerRef, &'a str)>;

fn validate<'a>(entry: &'a EntryConfig) -> Result<(NativeSpec<'a>, ScriptSpec<'a>), EntryError> {
    let present = |s: Option<&'a str>| s.filter(|s| !s.is_empty());

    if entry.keys.iter().all(String::is_empty) {
        return Err(EntryError::Validation("entry lists no keys".to_string()));
    }

    let native = match (present(entry.library.as_deref()), present(entry.native_symbol.as_deref())) {
        (Some(library), Some(symbol)) => Some((library, symbol)),
        (None, None) => None,
        (Some(library), None) => {
            return Err(EntryError::Validation(format!(
                "library '{library}' given without nativeSymbol"
            )));
        }
        (None, Some(symbol)) => {
            return Err(EntryError::Validation(format!(
                "nativeSymbol '{symbol}' given without library"
            )));
        }
    };

    if native.is_none() && present(entry.checksum.as_deref()).is_some() {
        return Err(EntryError::Validation(
            "checksum given without library".to_string(),
        ));
    }

    let script = match (entry.script_owner.as_ref(), present(entry.script_callable.as_deref())) {
        (Some(owner), Some(callable)) => Some((owner, callable)),
        (None, None) => None,
        (Some(_), None) => {
            return Err(EntryError::Validation(
                "scriptOwner given without scriptCallable".to_string(),
            ));
        }
        (None, Some(callable)) => {
            return Err(EntryError::Validation(format!(
                "scriptCallable '{callable}' given without scriptOwner"
            )));
        }
    };

    if native.is_none() && script.is_none() {
        return Err(EntryError::Validation(
            "entry names neither a native library nor a script callable".to_string(),
        ));
    }

    Ok((native, script))
}

fn resolve_owner(
    owner: &OwnerRef,
    callable: &str,
    entities: &dyn EntityLookup,
) -> Result<ScriptTarget, EntryError> {
    match (owner.numeric_id(), owner) {
        (Some(Ok(id)), _) => Ok(ScriptTarget::new(id, callable)),
        (Some(Err(message)), _) => Err(EntryError::Validation(message)),
        (None, OwnerRef::Name(name)) => {
            let id = entities
                .find_by_editor_id(name)
                .ok_or_else(|| EntryError::UnresolvedOwner(name.clone()))?;
            Ok(ScriptTarget::new(id, callable).with_owner_name(name.as_str()))
        }
        (None, OwnerRef::Id(id)) => Ok(ScriptTarget::new(EntityId(*id), callable)),
    }
}

/// Builds the provider set for `config` without touching any registry.
pub fn build_set(
    config: ConfigSet,
    libraries: &LibraryCache,
    entities: &dyn EntityLookup,
) -> (ProviderSet, ReloadReport) {
    let mut set = ProviderSet::new();
    let mut report = ReloadReport {
        files: config.sources.len(),
        entries: config.entry_count(),
        ..ReloadReport::default()
    };

    for problem in config.problems {
        let source = problem.path().to_path_buf();
        report.record(&source, &[], EntryError::Manifest(problem), true);
    }

    for source in config.sources {
        for problem in source.skipped {
            report.record(&source.path, &[], EntryError::Manifest(problem), true);
        }

        for entry in &source.entries {
            let keys: Vec<String> = entry
                .keys
                .iter()
                .filter(|key| !key.is_empty())
                .cloned()
                .collect();
            if keys.len() < entry.keys.len() {
                warn!(file = %source.path.display(), "Ignoring empty lookup key");
            }

            match build_provider(entry, libraries, entities) {
                Ok((provider, problems)) => {
                    for problem in problems {
                        report.record(&source.path, &keys, problem, false);
                    }
                    for key in &keys {
                        set.register(key.clone(), provider.clone());
                    }
                    debug!(file = %source.path.display(), keys = ?keys, "Entry registered");
                }
                Err(problems) => {
                    for problem in problems {
                        report.record(&source.path, &keys, problem, true);
                    }
                }
            }
        }
    }

    (set, report)
}

/// Rebuilds `registry` from `config`.
///
/// Loads libraries through `libraries`, resolves script owners through
/// `entities` and swaps the complete result into the registry at once.
///
/// # Errors
///
/// Returns [`RegistryError::LockPoisoned`] if the registry cannot be
/// replaced. Entry problems are never errors; they are in the report.
#[instrument(skip_all, fields(files = config.sources.len()))]
pub fn reload(
    registry: &ProviderRegistry,
    libraries: &LibraryCache,
    entities: &dyn EntityLookup,
    config: ConfigSet,
) -> Result<ReloadReport, RegistryError> {
    let (set, mut report) = build_set(config, libraries, entities);
    report.registered = registry.replace_all(set)?;

    info!(
        files = report.files,
        entries = report.entries,
        registered = report.registered,
        dropped = report.dropped(),
        diagnostics = report.diagnostics.len(),
        "Configuration reloaded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::manifest::EntrySource;

    fn config(text: &str) -> ConfigSet {
        ConfigSet {
            sources: vec![EntrySource::parse("entries.json", text).unwrap()],
            problems: Vec::new(),
        }
    }

    fn entities() -> HashMap<String, EntityId> {
        HashMap::from([("LoreQuest".to_string(), EntityId(0x42))])
    }

    #[test]
    fn test_entry_without_any_resolver_is_rejected() {
        let registry = ProviderRegistry::new();

        let report = reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            config(r#"{ "keys": ["GREETING"] }"#),
        )
        .unwrap();

        assert_eq!(report.registered, 0);
        assert!(registry.is_empty());
        assert_eq!(report.dropped(), 1);
        assert!(matches!(report.diagnostics[0].error, EntryError::Validation(_)));
        assert_eq!(report.diagnostics[0].source, Path::new("entries.json"));
    }

    #[test]
    fn test_failed_library_load_registers_nothing() {
        let registry = ProviderRegistry::new();
        let libraries = LibraryCache::new();

        let report = reload(
            &registry,
            &libraries,
            &NoEntities,
            config(r#"{ "keys": ["GREETING"], "library": "does-not-exist.dll", "nativeSymbol": "greet" }"#),
        )
        .unwrap();

        assert!(registry.lookup("GREETING").is_none());
        assert!(matches!(report.diagnostics[0].error, EntryError::Load(_)));
        assert!(report.diagnostics[0].dropped);
        assert!(!libraries.is_loaded("does-not-exist.dll"));
    }

    #[test]
    fn test_failed_library_load_degrades_to_script() {
        let registry = ProviderRegistry::new();

        let report = reload(
            &registry,
            &LibraryCache::new(),
            &entities(),
            config(
                r#"{ "keys": ["LORE_A"], "library": "missing.dll", "nativeSymbol": "lore",
                     "scriptOwner": "LoreQuest", "scriptCallable": "GetLore" }"#,
            ),
        )
        .unwrap();

        let provider = registry.lookup("LORE_A").expect("degraded provider registered");
        assert!(provider.native_entry().is_none());
        let target = provider.script_target().unwrap();
        assert_eq!(target.owner, EntityId(0x42));
        assert_eq!(target.owner_name.as_deref(), Some("LoreQuest"));
        assert_eq!(report.dropped(), 0);
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_unresolved_owner_drops_script_only_entry() {
        let registry = ProviderRegistry::new();

        let report = reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            config(r#"{ "keys": ["LORE_A"], "scriptOwner": "LoreQuest", "scriptCallable": "GetLore" }"#),
        )
        .unwrap();

        assert!(registry.is_empty());
        let Some(diagnostic) = report.diagnostics.first() else {
            panic!("expected a diagnostic");
        };
        assert!(matches!(&diagnostic.error, EntryError::UnresolvedOwner(name) if name == "LoreQuest"));
        assert_eq!(diagnostic.keys, vec!["LORE_A".to_string()]);
    }

    #[test]
    fn test_numeric_and_hex_owners_skip_entity_lookup() {
        let registry = ProviderRegistry::new();

        reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            config(
                r#"[
                    { "keys": ["A"], "scriptOwner": 66, "scriptCallable": "F" },
                    { "keys": ["B"], "scriptOwner": "0x00000043", "scriptCallable": "G" }
                ]"#,
            ),
        )
        .unwrap();

        assert_eq!(registry.lookup("A").unwrap().script_target().unwrap().owner, EntityId(66));
        let b = registry.lookup("B").unwrap();
        assert_eq!(b.script_target().unwrap().owner, EntityId(0x43));
        assert!(b.script_target().unwrap().owner_name.is_none());
    }

    #[test]
    fn test_duplicate_key_last_entry_wins() {
        let registry = ProviderRegistry::new();

        reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            config(
                r#"[
                    { "keys": ["LORE_A"], "scriptOwner": 1, "scriptCallable": "First" },
                    { "keys": ["LORE_A"], "scriptOwner": 2, "scriptCallable": "Second" }
                ]"#,
            ),
        )
        .unwrap();

        let target = registry.lookup("LORE_A").unwrap().script_target().cloned().unwrap();
        assert_eq!(target.callable, "Second");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_key_across_files_follows_file_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-base.json"),
            r#"{ "keys": ["K"], "scriptOwner": 1, "scriptCallable": "Base" }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-patch.json"),
            r#"{ "keys": ["K"], "scriptOwner": 1, "scriptCallable": "Patch" }"#,
        )
        .unwrap();
        let registry = ProviderRegistry::new();

        reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            ConfigSet::load_dir(dir.path()).unwrap(),
        )
        .unwrap();

        assert_eq!(registry.lookup("K").unwrap().script_target().unwrap().callable, "Patch");
    }

    #[test]
    fn test_missing_identifying_data_is_a_validation_failure() {
        let cases = [
            r#"{ "keys": ["K"], "library": "x.dll" }"#,
            r#"{ "keys": ["K"], "nativeSymbol": "f" }"#,
            r#"{ "keys": ["K"], "scriptOwner": 1 }"#,
            r#"{ "keys": ["K"], "scriptCallable": "F" }"#,
            r#"{ "keys": ["K"], "scriptOwner": 1, "scriptCallable": "F", "checksum": "ab" }"#,
            r#"{ "keys": [], "scriptOwner": 1, "scriptCallable": "F" }"#,
            r#"{ "keys": ["K"], "scriptOwner": "0xnothex", "scriptCallable": "F" }"#,
        ];

        for case in cases {
            let Err(problems) = build_provider(
                &EntrySource::parse("x.json", case).unwrap().entries[0],
                &LibraryCache::new(),
                &NoEntities,
            ) else {
                panic!("expected rejection for {case}");
            };
            assert!(
                matches!(problems[..], [EntryError::Validation(_)]),
                "unexpected problems for {case}: {problems:?}"
            );
        }
    }

    #[test]
    fn test_empty_keys_are_skipped() {
        let registry = ProviderRegistry::new();

        reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            config(r#"{ "keys": ["", "LORE_A"], "scriptOwner": 1, "scriptCallable": "F" }"#),
        )
        .unwrap();

        assert_eq!(registry.keys(), vec!["LORE_A".to_string()]);
    }

    #[test]
    fn test_reload_replaces_previous_registry() {
        let registry = ProviderRegistry::new();
        let libraries = LibraryCache::new();
        reload(
            &registry,
            &libraries,
            &NoEntities,
            config(r#"{ "keys": ["OLD"], "scriptOwner": 1, "scriptCallable": "F" }"#),
        )
        .unwrap();

        reload(
            &registry,
            &libraries,
            &NoEntities,
            config(r#"{ "keys": ["NEW"], "scriptOwner": 1, "scriptCallable": "F" }"#),
        )
        .unwrap();

        assert!(registry.lookup("OLD").is_none());
        assert!(registry.lookup("NEW").is_some());
    }

    #[test]
    fn test_manifest_problems_become_diagnostics() {
        let mut set = config(r#"[{ "keys": ["A"], "scriptOwner": 1, "scriptCallable": "F" }, 7]"#);
        set.problems.push(EntrySource::parse("broken.json", "{").unwrap_err());
        let registry = ProviderRegistry::new();

        let report = reload(&registry, &LibraryCache::new(), &NoEntities, set).unwrap();

        assert_eq!(report.registered, 1);
        assert_eq!(report.diagnostics.len(), 2);
        assert!(report
            .diagnostics
            .iter()
            .all(|d| matches!(d.error, EntryError::Manifest(_)) && d.dropped));
    }

    #[test]
    fn test_owner_ref_name_resolves_through_lookup() {
        let entry = EntryConfig {
            keys: vec!["K".to_string()],
            script_owner: Some(OwnerRef::Name("LoreQuest".to_string())),
            script_callable: Some("GetLore".to_string()),
            ..EntryConfig::default()
        };

        let (provider, problems) = build_provider(&entry, &LibraryCache::new(), &entities()).unwrap();

        assert!(problems.is_empty());
        assert_eq!(provider.script_target().unwrap().owner, EntityId(0x42));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_entries_sharing_a_library_share_one_handle() {
        let registry = ProviderRegistry::new();
        let libraries = LibraryCache::new();

        let report = reload(
            &registry,
            &libraries,
            &NoEntities,
            config(
                r#"[
                    { "keys": ["A"], "library": "libc.so.6", "nativeSymbol": "strlen" },
                    { "keys": ["B"], "library": "libc.so.6", "nativeSymbol": "strlen" }
                ]"#,
            ),
        )
        .unwrap();

        assert!(report.is_clean());
        assert_eq!(libraries.len(), 1);
        let a = registry.lookup("A").unwrap();
        let b = registry.lookup("B").unwrap();
        assert!(a.library().unwrap().same_library(b.library().unwrap()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_symbol_degrades_to_script() {
        let registry = ProviderRegistry::new();

        let report = reload(
            &registry,
            &LibraryCache::new(),
            &NoEntities,
            config(
                r#"{ "keys": ["K"], "library": "libc.so.6", "nativeSymbol": "no_such_symbol_here",
                     "scriptOwner": 5, "scriptCallable": "F" }"#,
            ),
        )
        .unwrap();

        let provider = registry.lookup("K").unwrap();
        assert!(provider.native_entry().is_none());
        assert!(provider.library().is_none());
        assert!(matches!(report.diagnostics[0].error, EntryError::Symbol(_)));
    }
}
