//! Resolve one key outside the host.
//!
//! Only native resolvers produce text here; there is no script VM outside
//! the host.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use console::style;
use dyntext_abi::EntityRef;
use dyntext_core::Resolution;
use dyntext_runtime::Engine;
use tracing::debug;

use super::load_settings;

#[derive(Args)]
pub struct ResolveArgs {
    /// Lookup key, without the host's key prefix
    pub key: String,

    /// Subject entity handle passed to the resolver (decimal or 0x-hex)
    #[arg(long, default_value = "0", value_parser = parse_handle)]
    pub subject: usize,

    /// Owner entity handle passed to the resolver (decimal or 0x-hex)
    #[arg(long, default_value = "0", value_parser = parse_handle)]
    pub owner: usize,

    /// Directory of entry files (overrides the settings file)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}

fn parse_handle(value: &str) -> Result<usize, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid entity handle '{value}': {e}"))
}

pub fn run(args: &ResolveArgs, settings_path: Option<&Path>) -> Result<()> {
    let settings = load_settings(settings_path, args.config_dir.as_deref())?;
    let engine = Engine::builder()
        .with_settings(settings)
        .build()
        .context("failed to start engine")?;
    engine.reload().context("failed to load configuration")?;
    debug!(key = %args.key, subject = args.subject, owner = args.owner, "Resolving key");

    let resolution = engine
        .resolve(
            &args.key,
            EntityRef::from_addr(args.subject),
            EntityRef::from_addr(args.owner),
        )
        .with_context(|| format!("no provider registered for '{}'", args.key))?;

    match resolution {
        Resolution::Text(text) => println!("{text}"),
        Resolution::NoOverride => {
            println!(
                "{} no override (empty result, or a script resolver that needs the host)",
                style("-").dim()
            );
        }
        Resolution::Fault(reason) => bail!("resolver for '{}' failed: {reason}", args.key),
    }
    Ok(())
}
