//! List registered keys.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use dyntext_runtime::Engine;
use tracing::debug;

use super::{OfflineEntities, describe_provider, load_settings};

#[derive(Args)]
pub struct KeysArgs {
    /// Directory of entry files (overrides the settings file)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Output format: "table" or "json"
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

pub fn run(args: &KeysArgs, settings_path: Option<&Path>) -> Result<()> {
    let settings = load_settings(settings_path, args.config_dir.as_deref())?;
    let engine = Engine::builder()
        .with_settings(settings)
        .with_entity_lookup(Arc::new(OfflineEntities))
        .build()
        .context("failed to start engine")?;
    let report = engine.reload().context("failed to load configuration")?;
    debug!(registered = report.registered, "Configuration loaded");

    let registry = engine.registry();
    let rows: Vec<(String, String)> = registry
        .keys()
        .into_iter()
        .filter_map(|key| {
            let provider = registry.lookup(&key)?;
            Some((key, describe_provider(&provider)))
        })
        .collect();

    if args.format == "json" {
        let json: serde_json::Map<String, serde_json::Value> = rows
            .into_iter()
            .map(|(key, resolver)| (key, serde_json::Value::String(resolver)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else if rows.is_empty() {
        println!("No keys registered");
    } else {
        println!("{:<32} {}", style("KEY").bold(), style("RESOLVER").bold());
        println!("{}", "-".repeat(72));
        for (key, resolver) in &rows {
            println!("{key:<32} {resolver}");
        }
        println!("\n{} {} key(s) registered", style("✓").green(), rows.len());
    }
    Ok(())
}
