//! Build progress reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::Stage;

/// Events emitted while building a graph
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task is starting execution
    Started {
        task: String,
        identity: String,
    },
    /// A task produced output
    Output {
        task: String,
        line: String,
        is_stderr: bool,
    },
    /// A task's artifact was fetched from remote storage instead of built
    Downloaded {
        task: String,
    },
    /// A task completed successfully
    Completed {
        task: String,
        duration: Duration,
        cached: bool,
    },
    /// A task failed
    Failed {
        task: String,
        stage: Stage,
        duration: Duration,
        error: String,
    },
    /// A task was removed from the graph before execution
    Pruned {
        task: String,
        reason: String,
    },
    /// The build finished
    AllCompleted {
        total: usize,
        built: usize,
        downloaded: usize,
        pruned: usize,
        failed: usize,
        duration: Duration,
    },
}

impl TaskEvent {
    /// Qualified name of the task the event is about
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::Started { task, .. }
            | Self::Output { task, .. }
            | Self::Downloaded { task }
            | Self::Completed { task, .. }
            | Self::Failed { task, .. }
            | Self::Pruned { task, .. } => Some(task),
            Self::AllCompleted { .. } => None,
        }
    }
}

/// Trait for reporting build progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { task, identity } => {
                tracing::info!(task = %task, identity = %identity, "starting");
            }
            TaskEvent::Output {
                task,
                line,
                is_stderr,
            } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", task, line);
                } else {
                    tracing::debug!("[{}] {}", task, line);
                }
            }
            TaskEvent::Downloaded { task } => {
                tracing::info!("{} downloaded", task);
            }
            TaskEvent::Completed {
                task,
                duration,
                cached,
            } => {
                if *cached {
                    tracing::info!("{} completed (cached) in {:.1}s", task, duration.as_secs_f64());
                } else {
                    tracing::info!("{} completed in {:.1}s", task, duration.as_secs_f64());
                }
            }
            TaskEvent::Failed {
                task,
                stage,
                duration,
                error,
            } => {
                tracing::error!(
                    "{} of {} failed after {:.1}s: {}",
                    stage,
                    task,
                    duration.as_secs_f64(),
                    error
                );
            }
            TaskEvent::Pruned { task, reason } => {
                tracing::info!("{} pruned: {}", task, reason);
            }
            TaskEvent::AllCompleted {
                total,
                built,
                downloaded,
                pruned,
                failed,
                duration,
            } => {
                tracing::info!(
                    "Build complete: {} tasks, {} built, {} downloaded, {} pruned, {} failed ({:.1}s)",
                    total,
                    built,
                    downloaded,
                    pruned,
                    failed,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Qualified names of started tasks, in start order
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TaskEvent::Started { task, .. } => Some(task),
                _ => None,
            })
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registry of task reporters
#[derive(Clone)]
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}
