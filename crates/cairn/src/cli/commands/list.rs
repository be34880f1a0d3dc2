//! List command

use std::sync::Arc;

use clap::Args;
use console::style;
use serde::Serialize;
use tracing::info;

use cairn_tasks::reporter::TracingReporter;
use cairn_tasks::{BuildSession, TaskDefinition};

use crate::cli::{output, Cli, OutputFormat};

/// List declared tasks, or the dependency graph of one task
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Show the graph of this task instead of all tasks
    pub task: Option<String>,

    /// Include tasks whose artifacts are already available
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct TaskInfo {
    name: String,
    cacheable: bool,
    requires: Vec<String>,
    parameters: Vec<ParameterInfo>,
}

#[derive(Debug, Serialize)]
struct ParameterInfo {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    help: Option<String>,
}

impl From<&TaskDefinition> for TaskInfo {
    fn from(definition: &TaskDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            cacheable: definition.cacheable,
            requires: definition.requires.clone(),
            parameters: definition
                .parameters
                .iter()
                .map(|(name, spec)| ParameterInfo {
                    name: name.clone(),
                    default: spec.default.clone(),
                    values: spec.values.clone(),
                    help: spec.help.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct NodeInfo {
    task: String,
    identity: String,
    available: bool,
    dependencies: Vec<String>,
}

impl ListCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, base_dir) = cli.load_config()?;
        info!(task = ?self.task, all = self.all, "executing list command");
        let session = BuildSession::from_config(&config, &base_dir, Arc::new(TracingReporter))?;

        match &self.task {
            None => self.list_tasks(cli, &session),
            Some(task) => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(self.list_graph(cli, &session, task))
            }
        }
    }

    fn list_tasks(&self, cli: &Cli, session: &BuildSession) -> anyhow::Result<()> {
        let tasks: Vec<TaskInfo> = session
            .tasks()
            .definitions()
            .map(|definition| TaskInfo::from(definition.as_ref()))
            .collect();

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            return Ok(());
        }

        if tasks.is_empty() {
            output::warning("No tasks declared");
            return Ok(());
        }

        println!("{}", output::header("Tasks"));
        for task in &tasks {
            let mut line = format!("  {}", style(&task.name).bold());
            if !task.cacheable {
                line.push_str(&format!(" {}", style("(not cached)").dim()));
            }
            println!("{}", line);

            for parameter in &task.parameters {
                let mut details = Vec::new();
                if let Some(default) = &parameter.default {
                    details.push(format!("default {}", default));
                }
                if let Some(values) = &parameter.values {
                    details.push(format!("one of {}", values.join("|")));
                }
                let help = parameter.help.as_deref().unwrap_or_default();
                println!(
                    "    {} {} {}",
                    style(format!(":{}", parameter.name)).cyan(),
                    help,
                    style(details.join(", ")).dim()
                );
            }
            if cli.verbose && !task.requires.is_empty() {
                println!("    {} {}", style("requires").dim(), task.requires.join(", "));
            }
        }
        Ok(())
    }

    async fn list_graph(
        &self,
        cli: &Cli,
        session: &BuildSession,
        task: &str,
    ) -> anyhow::Result<()> {
        let mut graph = session.graph(&[task])?;
        if !self.all {
            session.plan(&mut graph).await;
        }

        let cache = session.cache();
        let nodes: Vec<NodeInfo> = graph
            .flatten_leaf_first()
            .iter()
            .map(|node| NodeInfo {
                task: node.qualified_name().to_string(),
                identity: node.identity().as_str().to_string(),
                available: cache.is_available_locally(node),
                dependencies: node
                    .dependencies()
                    .iter()
                    .filter(|dep| graph.contains(dep.id()))
                    .map(|dep| dep.qualified_name().to_string())
                    .collect(),
            })
            .collect();

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            return Ok(());
        }

        if nodes.is_empty() {
            output::success(&format!("{} is up to date", task));
            return Ok(());
        }

        println!("{}", output::header(task));
        for node in &nodes {
            let marker = if node.available {
                style("✓").green()
            } else {
                style("○").dim()
            };
            let short = node.identity.get(..12).unwrap_or(&node.identity);
            println!(
                "  {} {} {}",
                marker,
                node.task,
                output::identity_style().apply_to(short)
            );
            if cli.verbose && !node.dependencies.is_empty() {
                println!("      {} {}", style("after").dim(), node.dependencies.join(", "));
            }
        }
        Ok(())
    }
}
