//! Cache management command

use clap::{Args, Subcommand};
use console::style;
use tracing::info;

use cairn_tasks::cache::format_size;

use crate::cli::{output, Cli, OutputFormat};

/// Artifact cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// Evict least recently used artifacts until the cache fits its budget
    Evict(CacheEvictCommand),
    /// Remove all artifacts
    Clean(CacheCleanCommand),
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Evict artifacts over the size budget
#[derive(Debug, Args)]
pub struct CacheEvictCommand;

/// Remove all artifacts
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        match &self.action {
            CacheAction::Status(cmd) => cmd.execute(cli),
            CacheAction::Evict(cmd) => cmd.execute(cli),
            CacheAction::Clean(cmd) => cmd.execute(cli),
        }
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, _) = cli.load_config()?;
        let cache = cli.open_cache(&config)?;
        let stats = cache.status();

        if cli.format == OutputFormat::Json {
            let entries: Vec<serde_json::Value> = cache
                .entries()
                .into_iter()
                .map(|(identity, entry)| {
                    serde_json::json!({
                        "identity": identity.as_str(),
                        "kind": entry.kind,
                        "size": entry.size,
                        "last_used": entry.last_used.to_rfc3339(),
                    })
                })
                .collect();
            let result = serde_json::json!({
                "root": cache.root().display().to_string(),
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "max_size": stats.max_size,
                "artifacts": entries,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", output::header("Artifact Cache Status"));
            println!();
            println!("  Location: {}", output::path_style().apply_to(cache.root().display()));
            println!("  Entries:  {}", stats.entries);
            println!("  Size:     {}", style(stats.formatted_size()).yellow());
            if stats.max_size > 0 {
                println!("  Budget:   {}", format_size(stats.max_size));
            } else {
                println!("  Budget:   {}", style("unlimited").dim());
            }

            if cli.verbose && stats.entries > 0 {
                println!();
                for (identity, entry) in cache.entries() {
                    println!(
                        "  {} {} {} {}",
                        output::identity_style().apply_to(identity.short()),
                        entry.kind,
                        style(format_size(entry.size)).dim(),
                        style(entry.last_used.format("%Y-%m-%d %H:%M")).dim()
                    );
                }
            }
        }

        Ok(())
    }
}

impl CacheEvictCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, _) = cli.load_config()?;
        let cache = cli.open_cache(&config)?;
        info!(max_size = cache.max_size(), "evicting artifacts");

        if cache.max_size() == 0 && cli.is_text() {
            output::warning("No size budget configured, nothing to evict");
        }

        let stats = cache.evict()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "evicted": stats.evicted,
                "freed": stats.freed,
                "remaining": stats.remaining,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            output::success(&format!(
                "Evicted {}, freed {} ({} remaining)",
                output::plural(stats.evicted, "artifact"),
                format_size(stats.freed),
                format_size(stats.remaining)
            ));
        }

        Ok(())
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, _) = cli.load_config()?;
        let root = config.cache.resolved_root();

        if !root.exists() {
            if !cli.quiet {
                output::success("Cache directory does not exist.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!("Remove all artifacts at {}?", root.display()))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let cache = cli.open_cache(&config)?;
        let removed = cache.clean()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({ "removed": removed });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            output::success(&format!("Removed {}", output::plural(removed, "artifact")));
        }

        Ok(())
    }
}
