//! Command-line companion for dyntext configurations.
//!
//! Usage:
//! ```bash
//! dyntext check                      # Validate every entry file
//! dyntext keys                       # List registered keys and their resolvers
//! dyntext resolve GREETING           # Call the native resolver for a key
//! dyntext --settings path/dyntext.toml check --strict
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "dyntext", author, version, about)]
struct Cli {
    /// Settings file (defaults to $DYNTEXT_SETTINGS, then ./dyntext.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load every entry file and report problems
    Check(commands::check::CheckArgs),

    /// List registered keys and their resolvers
    Keys(commands::keys::KeysArgs),

    /// Resolve a key through its native resolver
    Resolve(commands::resolve::ResolveArgs),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Check(_) => f.debug_tuple("Check").finish(),
            Self::Keys(_) => f.debug_tuple("Keys").finish(),
            Self::Resolve(_) => f.debug_tuple("Resolve").finish(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("warn".parse().context("failed to parse log directive")?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings.as_deref();

    match &cli.command {
        Command::Check(args) => commands::check::run(args, settings),
        Command::Keys(args) => commands::keys::run(args, settings),
        Command::Resolve(args) => commands::resolve::run(args, settings),
    }
}
