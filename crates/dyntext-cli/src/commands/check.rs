//! Validate a configuration directory without a host.
//!
//! Libraries are really loaded and their symbols resolved, so a passing
//! check means every native resolver would be found at runtime. Script
//! owners given by editor id cannot be verified outside the host and are
//! accepted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use console::style;
use dyntext_core::{ConfigSet, LibraryCache, ReloadReport, build_set};
use tracing::debug;

use super::{OfflineEntities, load_settings};

#[derive(Args)]
pub struct CheckArgs {
    /// Directory of entry files (overrides the settings file)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Also fail when an entry was only degraded
    #[arg(long)]
    pub strict: bool,

    /// Output format: "table" or "json"
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

pub fn run(args: &CheckArgs, settings_path: Option<&Path>) -> Result<()> {
    let settings = load_settings(settings_path, args.config_dir.as_deref())?;
    let libraries = match &settings.library_dir {
        Some(dir) => LibraryCache::with_search_dir(dir),
        None => LibraryCache::new(),
    };

    let config = ConfigSet::load_dir(&settings.config_dir).with_context(|| {
        format!("failed to read {}", settings.config_dir.display())
    })?;
    let (set, report) = build_set(config, &libraries, &OfflineEntities);
    debug!(
        files = report.files,
        entries = report.entries,
        registered = set.len(),
        problems = report.diagnostics.len(),
        "Configuration checked"
    );

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report_to_json(&report, set.len()))?);
    } else {
        print_report(&settings.config_dir, &report, set.len());
    }

    if report.dropped() > 0 {
        bail!("{} entries registered nothing", report.dropped());
    }
    if args.strict && !report.is_clean() {
        bail!("{} problems found", report.diagnostics.len());
    }
    Ok(())
}

fn print_report(dir: &Path, report: &ReloadReport, registered: usize) {
    println!(
        "{} {} file(s), {} entr(y/ies) in {}",
        style("•").cyan(),
        report.files,
        report.entries,
        dir.display()
    );

    for diagnostic in &report.diagnostics {
        let marker = if diagnostic.dropped {
            style("✗").red()
        } else {
            style("!").yellow()
        };
        let keys = if diagnostic.keys.is_empty() {
            String::new()
        } else {
            format!(" [{}]", diagnostic.keys.join(", "))
        };
        println!(
            "{marker} {}{keys}: {}",
            diagnostic.source.display(),
            diagnostic.error
        );
    }

    println!("\n{} {registered} key(s) registered", style("✓").green());
}

fn report_to_json(report: &ReloadReport, registered: usize) -> serde_json::Value {
    let diagnostics: Vec<serde_json::Value> = report
        .diagnostics
        .iter()
        .map(|d| {
            serde_json::json!({
                "source": d.source.display().to_string(),
                "keys": d.keys,
                "error": d.error.to_string(),
                "dropped": d.dropped,
            })
        })
        .collect();
    serde_json::json!({
        "files": report.files,
        "entries": report.entries,
        "registered": registered,
        "diagnostics": diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(dir: &Path, strict: bool) -> CheckArgs {
        CheckArgs {
            config_dir: Some(dir.to_path_buf()),
            strict,
            format: "json".to_string(),
        }
    }

    #[test]
    fn test_check_passes_for_valid_script_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lore.json"),
            r#"{ "keys": ["LORE_A"], "scriptOwner": "LoreQuest", "scriptCallable": "GetLore" }"#,
        )
        .unwrap();
        let settings = dir.path().join("dyntext.toml");

        let result = run(&args(dir.path(), true), Some(settings.as_path()));

        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_check_fails_when_an_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{ "keys": ["GREETING"], "library": "missing-resolver.dll", "nativeSymbol": "greet" }"#,
        )
        .unwrap();
        let settings = dir.path().join("dyntext.toml");

        let result = run(&args(dir.path(), false), Some(settings.as_path()));

        let Err(err) = result else {
            panic!("expected check failure");
        };
        assert!(err.to_string().contains("1 entries registered nothing"));
    }

    #[test]
    fn test_report_to_json_shape() {
        let report = ReloadReport {
            files: 2,
            entries: 3,
            ..ReloadReport::default()
        };

        let json = report_to_json(&report, 4);

        assert_eq!(json["files"], 2);
        assert_eq!(json["entries"], 3);
        assert_eq!(json["registered"], 4);
        assert!(json["diagnostics"].as_array().unwrap().is_empty());
    }
}
