//! Task scheduler, async executor using tokio

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use cairn_core::SchedulerConfig;

use crate::cache::ArtifactCache;
use crate::error::{BuildError, ExecutionError, Stage};
use crate::executor::{ExecutionOutcome, ExecutorRegistry, ExecutorResources};
use crate::graph::{Graph, NodeId};
use crate::reporter::{TaskEvent, TaskReporter};

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent tasks
    pub concurrency: usize,
    /// Whether network executors may be used
    pub network: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            network: false,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            network: config.network,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Outcome counts of a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    /// Tasks that ran
    pub built: usize,
    /// Artifacts fetched from remote storage
    pub downloaded: usize,
    /// Nodes already in the local cache when they were reached
    pub cached: usize,
    /// Nodes removed during planning
    pub pruned: usize,
    pub duration: Duration,
}

impl BuildSummary {
    pub fn total(&self) -> usize {
        self.built + self.downloaded + self.cached + self.pruned
    }
}

/// Task scheduler, drives a graph's working set to empty
pub struct TaskScheduler {
    options: SchedulerOptions,
    cache: Arc<ArtifactCache>,
    executors: Arc<ExecutorRegistry>,
    reporter: Arc<dyn TaskReporter>,
}

impl TaskScheduler {
    /// Create a new scheduler
    pub fn new(
        options: SchedulerOptions,
        cache: Arc<ArtifactCache>,
        executors: Arc<ExecutorRegistry>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            options,
            cache,
            executors,
            reporter,
        }
    }

    /// Execute every node of the working set.
    ///
    /// Ready nodes are submitted as soon as their dependencies complete. The
    /// first failure stops submission and is returned. Tasks still in flight
    /// are aborted, which kills their child processes, and nodes depending
    /// on the failed one never start.
    #[instrument(skip_all, fields(nodes = graph.len(), concurrency = self.options.concurrency))]
    pub async fn run(&self, graph: &mut Graph) -> Result<BuildSummary, BuildError> {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let _lease = self
            .cache
            .active()
            .acquire(graph.all_nodes().map(|node| node.identity().clone()));

        let resources = ExecutorResources {
            cache: self.cache.clone(),
            reporter: self.reporter.clone(),
            parameters: Arc::new(self.executors.network_parameters()),
        };

        let mut summary = BuildSummary::default();
        let mut in_progress: BTreeSet<NodeId> = BTreeSet::new();
        let mut started: HashMap<NodeId, Instant> = HashMap::new();
        let mut running: JoinSet<(NodeId, Result<ExecutionOutcome, ExecutionError>)> =
            JoinSet::new();

        while !graph.is_empty() {
            for node in graph.leaves() {
                if !in_progress.insert(node.id()) {
                    continue;
                }

                let factory = self.executors.select(&self.cache, &node, self.options.network);
                let executor = factory.create(&resources);
                let semaphore = semaphore.clone();
                debug!(task = %node.qualified_name(), executor = factory.name(), "submitting");
                started.insert(node.id(), Instant::now());

                running.spawn(async move {
                    let id = node.id();
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            let error = ExecutionError::new(
                                node.qualified_name(),
                                Stage::Build,
                                Duration::ZERO,
                                e,
                            );
                            return (id, Err(error));
                        }
                    };
                    (id, executor.run(node).await)
                });
            }

            let Some(joined) = running.join_next().await else {
                let stalled = graph.nodes().map(|n| n.qualified_name().to_string()).collect();
                return Err(BuildError::Stalled(stalled));
            };

            let (id, result) = match joined {
                Ok(completed) => completed,
                Err(e) => {
                    running.abort_all();
                    while running.join_next().await.is_some() {}
                    return Err(BuildError::Worker(e.to_string()));
                }
            };

            in_progress.remove(&id);
            let task = graph
                .get(id)
                .map(|node| node.qualified_name().to_string())
                .unwrap_or_default();
            let duration = started.remove(&id).map(|t| t.elapsed()).unwrap_or_default();

            match result {
                Ok(outcome) => {
                    match outcome {
                        ExecutionOutcome::Built => summary.built += 1,
                        ExecutionOutcome::Downloaded => summary.downloaded += 1,
                        ExecutionOutcome::Cached => summary.cached += 1,
                    }
                    self.reporter.report(&TaskEvent::Completed {
                        task,
                        duration,
                        cached: outcome != ExecutionOutcome::Built,
                    });
                    graph.remove(id);
                }
                Err(error) => {
                    running.abort_all();
                    while running.join_next().await.is_some() {}

                    self.reporter.report(&TaskEvent::Failed {
                        task: error.task.clone(),
                        stage: error.stage,
                        duration: error.duration,
                        error: error.message.clone(),
                    });
                    return Err(error.into());
                }
            }
        }

        summary.duration = start.elapsed();
        info!(
            built = summary.built,
            downloaded = summary.downloaded,
            cached = summary.cached,
            "graph complete"
        );
        Ok(summary)
    }
}
