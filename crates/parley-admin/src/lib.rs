//! Command definitions and dispatch for `parley-admin`.
//!
//! Every command prints a JSON report on stdout. A health check that finds
//! the store unhealthy, or a maintenance run with failed steps, still
//! prints its report but exits non-zero.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_settings::{ParleySettings, load_settings_from_path, settings_path};
use parley_store::{HealthStatus, Store};
use serde_json::{Value, json, to_value};
use tracing::debug;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "parley-admin", version, about = "Operate a Parley chat store")]
pub struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Store file, overriding the settings.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Log format: `compact` or `json`.
    #[arg(long, global = true, default_value = "compact")]
    pub log_format: String,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Operations on the store.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create, seed and verify the schema.
    Init,
    /// Run diagnostics.
    Health,
    /// Print usage statistics.
    Stats,
    /// Write a point-in-time backup.
    Backup {
        /// Write a plain copy instead of gzip.
        #[arg(long)]
        no_compress: bool,
    },
    /// Replace the store with a backup.
    Restore {
        /// Backup file (`.db` or `.db.gz`).
        path: PathBuf,
    },
    /// Run every maintenance step once.
    Maintain,
    /// Reclaim free space.
    Optimize {
        /// Rebuild the whole file. Blocks writers.
        #[arg(long)]
        aggressive: bool,
    },
    /// Show or raise the schema version.
    Version {
        /// New version; must not be lower than the current one.
        #[arg(long)]
        set: Option<u32>,
    },
    /// Write the schema as SQL.
    ExportSchema {
        /// Output file.
        path: PathBuf,
    },
    /// List backups, newest first.
    ListBackups,
}

/// Result of a command.
#[derive(Debug)]
pub struct Output {
    /// JSON report.
    pub report: Value,
    /// Whether the process should exit successfully.
    pub success: bool,
}

impl Output {
    fn ok(report: Value) -> Self {
        Self { report, success: true }
    }
}

/// Resolve settings from the file and command line overrides.
pub fn resolve_settings(cli: &Cli) -> Result<ParleySettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings =
        load_settings_from_path(&path).with_context(|| format!("failed to load settings from {}", path.display()))?;
    if let Some(db_path) = &cli.db_path {
        settings.storage.db_path = db_path.display().to_string();
    }
    Ok(settings)
}

/// Execute the parsed command.
pub fn run(cli: &Cli) -> Result<Output> {
    let settings = resolve_settings(cli)?;
    let store = Store::open(&settings).context("failed to open store")?;
    debug!(command = ?cli.command, path = %store.path().display(), "running admin command");

    let output = match &cli.command {
        Command::Init => Output::ok(to_value(store.initialize().context("schema initialization failed")?)?),
        Command::Health => {
            let report = store.check_health();
            let success = report.status != HealthStatus::Unhealthy;
            Output {
                report: to_value(report)?,
                success,
            }
        }
        Command::Stats => Output::ok(to_value(store.snapshot().context("failed to collect statistics")?)?),
        Command::Backup { no_compress } => Output::ok(to_value(store.backup(!no_compress).context("backup failed")?)?),
        Command::Restore { path } => {
            store
                .restore(path)
                .with_context(|| format!("failed to restore from {}", path.display()))?;
            Output::ok(json!({ "restored": path.display().to_string(), "version": store.get_version()? }))
        }
        Command::Maintain => {
            let run = store.run_maintenance().context("maintenance aborted")?;
            let success = run.failures() == 0;
            Output {
                report: to_value(run)?,
                success,
            }
        }
        Command::Optimize { aggressive } => {
            store.optimize(*aggressive).context("optimize failed")?;
            Output::ok(json!({ "optimized": true, "aggressive": aggressive }))
        }
        Command::Version { set } => {
            if let Some(version) = set {
                store.set_version(*version).context("failed to set schema version")?;
            }
            Output::ok(json!({ "version": store.get_version().context("failed to read schema version")? }))
        }
        Command::ExportSchema { path } => {
            let statements = store
                .export_schema(path)
                .with_context(|| format!("failed to export schema to {}", path.display()))?;
            Output::ok(json!({ "path": path.display().to_string(), "statements": statements }))
        }
        Command::ListBackups => Output::ok(to_value(store.list_backups().context("failed to list backups")?)?),
    };
    Ok(output)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["parley-admin", "backup", "--no-compress", "--db-path", "/tmp/x.db"]).unwrap();
        assert!(matches!(cli.command, Command::Backup { no_compress: true }));
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn version_set_requires_a_number() {
        assert!(Cli::try_parse_from(["parley-admin", "version", "--set", "two"]).is_err());
        let cli = Cli::try_parse_from(["parley-admin", "version", "--set", "2"]).unwrap();
        assert!(matches!(cli.command, Command::Version { set: Some(2) }));
    }
}
