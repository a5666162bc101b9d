//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for `sitedeploy`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sitedeploy",
    version,
    about = "Deploy statically generated sites from git pushes.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, global = true, value_name = "PATH", default_value = "sitedeploy.toml", env = "SITEDEPLOY_CONFIG")]
    pub config: PathBuf,

    /// Log level or filter directive; overrides `[logging] level`.
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Read change notifications from stdin (one JSON object per line) and
    /// deploy until stdin closes.
    ///
    /// A push: `{"branch": "main", "commit": "abc123"}`, optionally with an
    /// RFC 3339 `"timestamp"`. A deletion: `{"branch": "old", "deleted": true}`.
    Run {
        /// Local git repository the generator builds from.
        #[arg(long, value_name = "DIR")]
        repo: PathBuf,

        /// Output directory; receives `artifacts/` and the synced `site/`.
        #[arg(long, value_name = "DIR", default_value = "deploy-out")]
        out: PathBuf,

        /// Seconds between retention and garbage collection passes.
        #[arg(long, value_name = "SECS", default_value_t = 300)]
        gc_interval: u64,
    },

    /// Parse and validate the config, then print it as JSON.
    CheckConfig,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
