//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};
use dyntext_core::{EntityId, EntityLookup, Provider, Settings};
use tracing::debug;

pub mod check;
pub mod keys;
pub mod resolve;

/// Loads settings from `path` (or the default location) and applies a
/// `--config-dir` override.
pub(crate) fn load_settings(path: Option<&Path>, config_dir: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::load_default().context("failed to load settings")?,
    };
    if let Some(dir) = config_dir {
        settings.config_dir = dir.to_path_buf();
    }
    debug!(
        config_dir = %settings.config_dir.display(),
        library_dir = ?settings.library_dir,
        "Loaded settings"
    );
    Ok(settings)
}

/// Entity database stand-in outside the host: every editor id is accepted
/// with a placeholder id.
pub(crate) struct OfflineEntities;

impl EntityLookup for OfflineEntities {
    fn find_by_editor_id(&self, _editor_id: &str) -> Option<EntityId> {
        Some(EntityId(0))
    }
}

/// One-line description of what resolves a provider.
pub(crate) fn describe_provider(provider: &Provider) -> String {
    let native = provider.library().map(|library| format!("native {}", library.name()));
    let script = provider.script_target().map(|target| match &target.owner_name {
        Some(name) => format!("script {name}.{}", target.callable),
        None => format!("script {}.{}", target.owner, target.callable),
    });
    match (native, script) {
        (Some(native), Some(script)) => format!("{native}, {script}"),
        (Some(native), None) => native,
        (None, Some(script)) => script,
        (None, None) => "native (in-process)".to_string(),
    }
}
