//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use cairn_core::{load_config, load_config_or_default, Config};
use cairn_tasks::{ArtifactCache, AttributeRegistry, CacheOptions};

use commands::{BuildCommand, CacheCommand, InitCommand, ListCommand};

/// Cairn - dependency-driven build orchestrator
#[derive(Debug, Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Configuration file, searched upwards from the working directory by default
    #[arg(long, global = true, env = "CAIRN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a cairn.toml in the working directory
    Init(InitCommand),

    /// Build tasks and their dependencies
    Build(BuildCommand),

    /// List tasks, or the graph of a task
    List(ListCommand),

    /// Artifact cache maintenance
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)
                .with_context(|| format!("cannot change to {}", dir.display()))?;
        }

        match self.command {
            Commands::Init(ref cmd) => cmd.execute(&self),
            Commands::Build(ref cmd) => cmd.execute(&self),
            Commands::List(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
        }
    }

    /// Load the configuration and the directory tasks run in
    pub fn load_config(&self) -> anyhow::Result<(Config, PathBuf)> {
        let cwd = std::env::current_dir()?;

        let (config, path) = match &self.config {
            Some(path) => (load_config(path)?, Some(path.clone())),
            None => load_config_or_default(&cwd)?,
        };

        let base_dir = path
            .as_deref()
            .and_then(|p| p.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or(cwd);
        debug!(config = ?path, base_dir = %base_dir.display(), "loaded configuration");
        Ok((config, base_dir))
    }

    /// Open the artifact cache described by `config`
    pub fn open_cache(&self, config: &Config) -> anyhow::Result<ArtifactCache> {
        let options = CacheOptions::from(&config.cache);
        let root = options.root.clone();
        ArtifactCache::open(options, Arc::new(AttributeRegistry::with_defaults()))
            .with_context(|| format!("cannot open cache at {}", root.display()))
    }

    /// Whether human-readable progress should be printed
    pub fn is_text(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build() {
        let cli = Cli::try_parse_from([
            "cairn",
            "-v",
            "build",
            "app",
            "lib:arch=arm",
            "-j",
            "4",
            "--network",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Build(cmd) => {
                assert_eq!(cmd.tasks, vec!["app".to_string(), "lib:arch=arm".to_string()]);
                assert_eq!(cmd.jobs, Some(4));
                assert!(cmd.network);
                assert!(!cmd.force_upload);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_load_config_base_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("cairn.toml");
        std::fs::write(&path, "[tasks.hello]\ncommand = \"true\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "cairn".to_string(),
            "--config".to_string(),
            path.display().to_string(),
            "list".to_string(),
        ])
        .unwrap();
        let (config, base_dir) = cli.load_config().unwrap();
        assert!(config.tasks.contains_key("hello"));
        assert_eq!(base_dir, temp.path());
    }
}
