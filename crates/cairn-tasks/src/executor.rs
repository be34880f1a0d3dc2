//! Executors and executor selection
//!
//! The scheduler asks the [`ExecutorRegistry`] for a factory per ready node.
//! Factories are tried in registration order; the local factory is the
//! fallback when none of them is eligible.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::attributes::Environment;
use crate::cache::ArtifactCache;
use crate::context::{DependencyArtifact, ExecutionContext};
use crate::error::{ExecutionError, Stage};
use crate::graph::GraphNode;
use crate::reporter::{TaskEvent, TaskReporter};

/// How a node was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The task ran and its artifact was committed
    Built,
    /// The artifact was fetched from remote storage
    Downloaded,
    /// The artifact was already in the local cache
    Cached,
}

/// Runs a single node to completion
#[async_trait]
pub trait Executor: Send + Sync {
    /// Complete the node: its artifact is committed, and uploaded when
    /// configured, or the returned error names the failing stage.
    async fn run(&self, node: Arc<GraphNode>) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Shared services handed to executor factories
#[derive(Clone)]
pub struct ExecutorResources {
    pub cache: Arc<ArtifactCache>,
    pub reporter: Arc<dyn TaskReporter>,
    /// Merged parameters of all network extensions
    pub parameters: Arc<BTreeMap<String, String>>,
}

/// Creates executors for the nodes it is eligible for
pub trait ExecutorFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether executors run tasks on a remote system
    fn is_network(&self) -> bool {
        false
    }

    /// Whether this factory can handle `node`
    fn is_eligible(&self, _cache: &ArtifactCache, _node: &GraphNode) -> bool {
        true
    }

    fn create(&self, resources: &ExecutorResources) -> Arc<dyn Executor>;
}

/// Contributes parameters to network executors
pub trait NetworkExtension: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn parameters(&self) -> BTreeMap<String, String>;
}

/// Ordered executor factories and network extensions
#[derive(Debug)]
pub struct ExecutorRegistry {
    factories: Vec<Arc<dyn ExecutorFactory>>,
    extensions: Vec<Arc<dyn NetworkExtension>>,
    local: Arc<dyn ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            extensions: Vec::new(),
            local: Arc::new(LocalExecutorFactory),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn ExecutorFactory>) {
        self.factories.push(factory);
    }

    pub fn register_extension(&mut self, extension: Arc<dyn NetworkExtension>) {
        self.extensions.push(extension);
    }

    /// Pick the factory for `node`.
    ///
    /// Network factories only handle cacheable nodes in network mode; local
    /// factories only handle nodes outside network mode.
    pub fn select(
        &self,
        cache: &ArtifactCache,
        node: &GraphNode,
        network: bool,
    ) -> Arc<dyn ExecutorFactory> {
        for factory in &self.factories {
            if factory.is_network() && !node.is_cacheable() {
                continue;
            }
            if factory.is_network() != network {
                continue;
            }
            if factory.is_eligible(cache, node) {
                debug!(
                    task = %node.qualified_name(),
                    executor = factory.name(),
                    "selected executor"
                );
                return factory.clone();
            }
        }
        self.local.clone()
    }

    /// Parameters of all extensions; later extensions win on conflicts
    pub fn network_parameters(&self) -> BTreeMap<String, String> {
        let mut parameters = BTreeMap::new();
        for extension in &self.extensions {
            for (key, value) in extension.parameters() {
                if let Some(previous) = parameters.insert(key.clone(), value) {
                    debug!(
                        extension = extension.name(),
                        key = %key,
                        previous = %previous,
                        "overriding network parameter"
                    );
                }
            }
        }
        parameters
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for [`LocalExecutor`]
#[derive(Debug, Default)]
pub struct LocalExecutorFactory;

impl ExecutorFactory for LocalExecutorFactory {
    fn name(&self) -> &str {
        "local"
    }

    fn create(&self, resources: &ExecutorResources) -> Arc<dyn Executor> {
        Arc::new(LocalExecutor {
            cache: resources.cache.clone(),
            reporter: resources.reporter.clone(),
        })
    }
}

/// Runs tasks in-process, preferring cached and remotely stored artifacts
pub struct LocalExecutor {
    cache: Arc<ArtifactCache>,
    reporter: Arc<dyn TaskReporter>,
}

impl LocalExecutor {
    pub fn new(cache: Arc<ArtifactCache>, reporter: Arc<dyn TaskReporter>) -> Self {
        Self { cache, reporter }
    }

    /// Try to satisfy the node from remote storage.
    ///
    /// Planning may have dropped the dependencies of a remotely available
    /// node, so once storage claims to have the artifact, a failed transfer
    /// only falls back to building when every dependency is still cached.
    async fn fetch(&self, node: &GraphNode) -> Result<bool, (Stage, String)> {
        if !node.is_cacheable() || !self.cache.download_enabled() {
            return Ok(false);
        }
        if !self.cache.is_available_remotely(node).await {
            return Ok(false);
        }

        match self.cache.download(node, false).await {
            Ok(true) if self.cache.is_available_locally(node) => {}
            Ok(_) if self.dependencies_available(node) => {
                warn!(
                    task = %node.qualified_name(),
                    "artifact not delivered by storage, building instead"
                );
                return Ok(false);
            }
            Ok(_) => {
                return Err((
                    Stage::Download,
                    "artifact not delivered by remote storage".to_string(),
                ))
            }
            Err(e) => return Err((Stage::Download, e.to_string())),
        }

        self.cache
            .unpack_locked(node)
            .await
            .map_err(|e| (Stage::Unpack, e.to_string()))?;
        Ok(true)
    }

    fn dependencies_available(&self, node: &GraphNode) -> bool {
        node.dependencies()
            .iter()
            .filter(|dependency| dependency.is_cacheable())
            .all(|dependency| self.cache.is_available_locally(dependency))
    }

    /// Run the task and commit its artifact
    async fn build(&self, node: &Arc<GraphNode>) -> Result<(), (Stage, String)> {
        let mut dependencies = Vec::new();
        for dependency in node.dependencies() {
            if !dependency.is_cacheable() {
                continue;
            }
            self.cache
                .unpack(dependency)
                .await
                .map_err(|e| (Stage::Unpack, e.to_string()))?;
            let attributes = self
                .cache
                .artifact_attributes(dependency)
                .map_err(|e| (Stage::Build, e.to_string()))?;
            dependencies.push(DependencyArtifact {
                task: dependency.qualified_name().to_string(),
                path: self.cache.get_path(dependency),
                attributes,
            });
        }

        let mut staged = self
            .cache
            .stage(node.clone())
            .map_err(|e| (Stage::Build, e.to_string()))?;

        let mut env = Environment::from_process();
        let mut ctx = ExecutionContext::new(
            node.instance().clone(),
            staged.path(),
            dependencies,
            env.scope(),
            self.cache.attributes().clone(),
            self.reporter.clone(),
        );

        if let Err(e) = node.instance().action().run(&mut ctx).await {
            drop(ctx);
            self.cache.discard(staged);
            return Err((Stage::Build, format!("{:#}", e)));
        }

        staged.set_attributes(ctx.into_attributes());
        self.cache
            .commit(staged)
            .map_err(|e| (Stage::Build, e.to_string()))
    }

    async fn upload(&self, node: &GraphNode) -> Result<(), (Stage, String)> {
        if !node.is_cacheable() || !self.cache.upload_enabled() || !self.cache.has_storage() {
            return Ok(());
        }
        match self.cache.upload(node, false).await {
            Ok(true) => Ok(()),
            Ok(false) => Err((Stage::Upload, "rejected by remote storage".to_string())),
            Err(e) => Err((Stage::Upload, e.to_string())),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    #[instrument(
        skip_all,
        fields(task = %node.qualified_name(), identity = %node.identity().short())
    )]
    async fn run(&self, node: Arc<GraphNode>) -> Result<ExecutionOutcome, ExecutionError> {
        let start = Instant::now();
        let task = node.qualified_name().to_string();
        let fail = |(stage, message): (Stage, String)| {
            ExecutionError::new(&task, stage, start.elapsed(), message)
        };

        // Concurrent requests for the same identity wait for the first one
        let lock = self.cache.lock(node.identity());
        let _guard = lock.lock().await;

        if self.cache.is_available_locally(&node) {
            self.cache
                .touch(&node)
                .map_err(|e| fail((Stage::Build, e.to_string())))?;
            debug!("available in local cache");
            return Ok(ExecutionOutcome::Cached);
        }

        if self.fetch(&node).await.map_err(fail)? {
            self.reporter.report(&TaskEvent::Downloaded { task: task.clone() });
            return Ok(ExecutionOutcome::Downloaded);
        }

        self.reporter.report(&TaskEvent::Started {
            task: task.clone(),
            identity: node.identity().to_string(),
        });
        self.build(&node).await.map_err(fail)?;
        self.upload(&node).await.map_err(fail)?;

        info!(duration = ?start.elapsed(), "built");
        Ok(ExecutionOutcome::Built)
    }
}
