//! Build command, builds tasks and their dependencies

use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::info;

use cairn_core::Config;
use cairn_tasks::{BuildSession, TaskEvent, TaskReporter, TaskReporterRegistry};

use crate::cli::{output, Cli, OutputFormat};

/// Build tasks and their dependencies
#[derive(Debug, Args)]
pub struct BuildCommand {
    /// Tasks to build, e.g. `app` or `compiler:arch=aarch64`
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Prefer network executors
    #[arg(long)]
    pub network: bool,

    /// Maximum concurrent tasks
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Never download artifacts from remote storage
    #[arg(long)]
    pub no_download: bool,

    /// Never upload artifacts to remote storage
    #[arg(long)]
    pub no_upload: bool,

    /// Upload the requested artifacts even if remote storage has them
    #[arg(long)]
    pub force_upload: bool,

    /// Show the execution plan without running anything
    #[arg(long)]
    pub dry_run: bool,
}

impl BuildCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    /// Apply command line overrides to the configuration
    fn apply(&self, config: &mut Config) {
        if self.no_download {
            config.cache.download = false;
        }
        if self.no_upload {
            config.cache.upload = false;
        }
        if let Some(jobs) = self.jobs {
            config.scheduler.concurrency = jobs;
        }
        if self.network {
            config.scheduler.network = true;
        }
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let (mut config, base_dir) = cli.load_config()?;
        self.apply(&mut config);
        info!(tasks = ?self.tasks, network = config.scheduler.network, "executing build command");

        let mut reporters = TaskReporterRegistry::new();
        if cli.is_text() {
            reporters.register(ConsoleReporter::new(cli.verbose));
        }
        let reporter: Arc<dyn TaskReporter> = Arc::new(reporters);

        let session = BuildSession::from_config(&config, &base_dir, reporter)?
            .with_force_upload(self.force_upload);

        if self.dry_run {
            let mut graph = session.graph(&self.tasks)?;
            session.plan(&mut graph).await;

            if cli.format == OutputFormat::Json {
                let plan: Vec<serde_json::Value> = graph
                    .flatten_leaf_first()
                    .iter()
                    .map(|node| {
                        serde_json::json!({
                            "task": node.qualified_name(),
                            "identity": node.identity().as_str(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else if !cli.quiet {
                println!();
                output::info(&format!("{} to run", output::plural(graph.len(), "task")));
                print!("{}", graph.execution_plan());
                println!("{}", style("[DRY RUN - no tasks will be executed]").yellow().bold());
            }
            return Ok(());
        }

        let summary = session.build(&self.tasks).await?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "built": summary.built,
                "downloaded": summary.downloaded,
                "cached": summary.cached,
                "pruned": summary.pruned,
                "duration_ms": summary.duration.as_millis(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Ok(())
    }
}

/// Console reporter with live output
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { task, identity } => {
                let short = identity.get(..12).unwrap_or(identity);
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(task).bold(),
                    if self.verbose {
                        style(format!("({})", short)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            TaskEvent::Output {
                task,
                line,
                is_stderr,
            } => {
                if self.verbose {
                    if *is_stderr {
                        println!("    {} {}", style(format!("[{}]", task)).red().dim(), line);
                    } else {
                        println!("    {} {}", style(format!("[{}]", task)).dim(), line);
                    }
                }
            }
            TaskEvent::Downloaded { task } => {
                println!(
                    "  {} {} {}",
                    style("↓").cyan(),
                    style(task).bold(),
                    style("(downloaded)").cyan()
                );
            }
            TaskEvent::Completed {
                task,
                duration,
                cached,
            } => {
                if *cached {
                    println!(
                        "  {} {} {} {}",
                        style("✓").green(),
                        style(task).green(),
                        style("(cached)").cyan(),
                        style(output::seconds(*duration)).dim()
                    );
                } else {
                    println!(
                        "  {} {} {}",
                        style("✓").green(),
                        style(task).green(),
                        style(output::seconds(*duration)).dim()
                    );
                }
            }
            TaskEvent::Failed {
                task,
                stage,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(task).red(),
                    style(format!("{} failed after {}", stage, output::seconds(*duration))).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::Pruned { task, reason } => {
                if self.verbose {
                    println!(
                        "  {} {} {}",
                        style("○").yellow(),
                        style(task).yellow(),
                        style(format!("({})", reason)).dim()
                    );
                }
            }
            TaskEvent::AllCompleted {
                total,
                built,
                downloaded,
                pruned,
                failed,
                duration,
            } => {
                println!();
                println!(
                    "  {} {}: {} built, {} downloaded, {} up to date, {} failed ({})",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    output::plural(*total, "task"),
                    built,
                    downloaded,
                    pruned,
                    failed,
                    output::seconds(*duration)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let command = BuildCommand {
            tasks: vec!["app".to_string()],
            network: true,
            jobs: Some(2),
            no_download: true,
            no_upload: false,
            force_upload: false,
            dry_run: false,
        };
        let mut config = Config::default();
        command.apply(&mut config);

        assert!(!config.cache.download);
        assert!(config.cache.upload);
        assert_eq!(config.scheduler.concurrency, 2);
        assert!(config.scheduler.network);
    }
}
