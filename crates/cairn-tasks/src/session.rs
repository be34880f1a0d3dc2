//! Build sessions: registries, cache and scheduler wired together

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};

use cairn_core::Config;

use crate::attributes::AttributeRegistry;
use crate::cache::{ArtifactCache, CacheOptions};
use crate::error::{BuildError, ExecutionError, GraphError, Stage};
use crate::executor::ExecutorRegistry;
use crate::graph::{Graph, GraphBuilder};
use crate::influence::InfluenceRegistry;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::scheduler::{BuildSummary, SchedulerOptions, TaskScheduler};
use crate::shell::definitions_from_config;
use crate::storage::DirectoryStorage;
use crate::task::TaskRegistry;

/// Everything needed to build tasks
pub struct BuildSession {
    tasks: TaskRegistry,
    influence: InfluenceRegistry,
    cache: Arc<ArtifactCache>,
    executors: Arc<ExecutorRegistry>,
    reporter: Arc<dyn TaskReporter>,
    options: SchedulerOptions,
    force_upload: bool,
}

impl BuildSession {
    pub fn new(
        tasks: TaskRegistry,
        influence: InfluenceRegistry,
        cache: Arc<ArtifactCache>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            tasks,
            influence,
            cache,
            executors: Arc::new(ExecutorRegistry::new()),
            reporter,
            options: SchedulerOptions::default(),
            force_upload: false,
        }
    }

    /// Session for the tasks declared in `config`, loaded from `base_dir`
    pub fn from_config(
        config: &Config,
        base_dir: &Path,
        reporter: Arc<dyn TaskReporter>,
    ) -> Result<Self, BuildError> {
        let attributes = Arc::new(AttributeRegistry::with_defaults());
        let mut cache = ArtifactCache::open(CacheOptions::from(&config.cache), attributes)?;
        if let Some(directory) = &config.storage.directory {
            let path = base_dir.join(&directory.path);
            debug!(path = %path.display(), "using directory storage");
            cache = cache.with_storage(Arc::new(DirectoryStorage::new(path)));
        }

        let mut tasks = TaskRegistry::new();
        for definition in definitions_from_config(config, base_dir)? {
            tasks.register(definition)?;
        }

        Ok(Self::new(tasks, InfluenceRegistry::with_defaults(), Arc::new(cache), reporter)
            .with_options(SchedulerOptions::from(&config.scheduler)))
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    /// Upload root artifacts after the build even if they already exist remotely
    pub fn with_force_upload(mut self, force: bool) -> Self {
        self.force_upload = force;
        self
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Resolve root tasks into a graph
    pub fn graph<S: AsRef<str>>(&self, roots: &[S]) -> Result<Graph, GraphError> {
        GraphBuilder::new(&self.tasks, &self.influence).build(roots)
    }

    /// Shrink the working set to what actually needs doing.
    ///
    /// Locally cached nodes are removed with every dependency nothing else
    /// needs. Nodes available remotely stay, to be downloaded, but stop
    /// waiting on their dependencies. Returns the number of removed nodes.
    #[instrument(skip_all, fields(nodes = graph.len()))]
    pub async fn plan(&self, graph: &mut Graph) -> usize {
        let cache = self.cache.clone();
        let pruned = graph.prune(|node| cache.is_available_locally(node));
        for node in &pruned {
            let reason = if self.cache.is_available_locally(node) {
                "available in local cache"
            } else {
                "not needed by remaining tasks"
            };
            self.report_pruned(node.qualified_name(), reason);
        }
        let mut removed = pruned.len();

        if self.cache.download_enabled() && self.cache.has_storage() {
            for node in graph.flatten_root_first() {
                if !graph.contains(node.id()) || node.dependencies().is_empty() {
                    continue;
                }
                if !self.cache.is_available_remotely(&node).await {
                    continue;
                }
                let detached = graph.detach(node.id());
                for dependency in &detached {
                    self.report_pruned(
                        dependency.qualified_name(),
                        "not needed, dependent is available remotely",
                    );
                }
                removed += detached.len();
            }
        }

        info!(removed, remaining = graph.len(), "planned build");
        removed
    }

    fn report_pruned(&self, task: &str, reason: &str) {
        self.reporter.report(&TaskEvent::Pruned {
            task: task.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Plan and run a graph until its working set is empty
    pub async fn execute(&self, graph: &mut Graph) -> Result<BuildSummary, BuildError> {
        let start = Instant::now();
        let total = graph.len();
        let pruned = self.plan(graph).await;

        let scheduler = TaskScheduler::new(
            self.options.clone(),
            self.cache.clone(),
            self.executors.clone(),
            self.reporter.clone(),
        );
        let result = scheduler.run(graph).await;

        let (built, downloaded, failed) = match &result {
            Ok(summary) => (summary.built, summary.downloaded, 0),
            Err(_) => (0, 0, 1),
        };
        self.reporter.report(&TaskEvent::AllCompleted {
            total,
            built,
            downloaded,
            pruned,
            failed,
            duration: start.elapsed(),
        });

        let mut summary = result?;
        summary.pruned = pruned;
        summary.duration = start.elapsed();
        Ok(summary)
    }

    /// Build the requested tasks
    pub async fn build<S: AsRef<str>>(&self, roots: &[S]) -> Result<BuildSummary, BuildError> {
        let mut graph = self.graph(roots)?;
        let summary = self.execute(&mut graph).await?;

        if self.force_upload {
            for root in graph.roots() {
                let start = Instant::now();
                match self.cache.upload(root, true).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(ExecutionError::new(
                            root.qualified_name(),
                            Stage::Upload,
                            start.elapsed(),
                            "rejected by remote storage",
                        )
                        .into());
                    }
                    Err(e) => {
                        let elapsed = start.elapsed();
                        let task = root.qualified_name();
                        let error = ExecutionError::new(task, Stage::Upload, elapsed, e);
                        return Err(error.into());
                    }
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::open_cache;
    use crate::context::ExecutionContext;
    use crate::error::StorageError;
    use crate::reporter::CollectingReporter;
    use crate::storage::{ArtifactRef, StorageProvider};
    use crate::task::{TaskAction, TaskDefinition};
    use async_trait::async_trait;
    use crate::task::TaskInstance;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records its execution and writes a fixed amount of output
    #[derive(Debug)]
    struct RecordingAction {
        log: Log,
        bytes: usize,
    }

    #[async_trait]
    impl TaskAction for RecordingAction {
        fn fingerprint(&self) -> String {
            "record".to_string()
        }

        async fn run(&self, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
            for dependency in ctx.dependencies() {
                anyhow::ensure!(
                    dependency.path.exists(),
                    "missing artifact of {}",
                    dependency.task
                );
            }
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ctx.instance().qualified_name().to_string());
            std::fs::write(ctx.output_dir().join("data"), vec![1u8; self.bytes])?;
            Ok(())
        }
    }

    fn recording(log: &Log, bytes: usize) -> Arc<RecordingAction> {
        Arc::new(RecordingAction {
            log: log.clone(),
            bytes,
        })
    }

    #[derive(Debug)]
    struct FailingAction;

    #[async_trait]
    impl TaskAction for FailingAction {
        fn fingerprint(&self) -> String {
            "fail".to_string()
        }

        async fn run(&self, _ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("exit status 1")
        }
    }

    /// Remote storage held in memory
    #[derive(Debug, Default)]
    struct MemoryStorage {
        archives: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStorage {
        fn key(artifact: &ArtifactRef) -> String {
            format!("{}/{}", artifact.kind, artifact.identity)
        }

        fn len(&self) -> usize {
            self.archives.lock().unwrap_or_else(PoisonError::into_inner).len()
        }
    }

    #[async_trait]
    impl StorageProvider for MemoryStorage {
        fn name(&self) -> &str {
            "memory"
        }

        async fn download(
            &self,
            artifact: &ArtifactRef,
            _force: bool,
        ) -> Result<bool, StorageError> {
            let data = self
                .archives
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&Self::key(artifact))
                .cloned();
            match data {
                Some(data) => {
                    std::fs::write(&artifact.archive, data)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn upload(&self, artifact: &ArtifactRef, _force: bool) -> Result<bool, StorageError> {
            let data = std::fs::read(&artifact.archive)?;
            self.archives
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(Self::key(artifact), data);
            Ok(true)
        }

        async fn location(&self, artifact: &ArtifactRef) -> Result<Option<String>, StorageError> {
            let archives = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(archives
                .contains_key(&Self::key(artifact))
                .then(|| format!("memory://{}", Self::key(artifact))))
        }
    }

    /// Storage that lists every artifact but cannot transfer any
    #[derive(Debug)]
    struct UnreachableStorage;

    #[async_trait]
    impl StorageProvider for UnreachableStorage {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn download(
            &self,
            _artifact: &ArtifactRef,
            _force: bool,
        ) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable {
                provider: "unreachable".to_string(),
                message: "connection reset".to_string(),
            })
        }

        async fn upload(
            &self,
            _artifact: &ArtifactRef,
            _force: bool,
        ) -> Result<bool, StorageError> {
            Ok(true)
        }

        async fn location(&self, artifact: &ArtifactRef) -> Result<Option<String>, StorageError> {
            Ok(Some(format!("unreachable://{}", artifact.identity)))
        }
    }

    /// Counts unpack runs, holding each one long enough to overlap
    #[derive(Debug)]
    struct SlowUnpack {
        unpacks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskAction for SlowUnpack {
        fn fingerprint(&self) -> String {
            "sdk".to_string()
        }

        async fn run(&self, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
            std::fs::write(ctx.output_dir().join("sdk.tar"), "sdk")?;
            Ok(())
        }

        fn is_unpackable(&self) -> bool {
            true
        }

        async fn unpack(&self, _task: &TaskInstance, artifact: &Path) -> anyhow::Result<()> {
            self.unpacks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::fs::write(artifact.join("sdk"), "extracted")?;
            Ok(())
        }
    }

    /// a requires b, b requires c
    fn chain(log: &Log) -> TaskRegistry {
        let action = || recording(log, 8);
        let mut tasks = TaskRegistry::new();
        tasks.register(TaskDefinition::new("a", action()).with_requires("b")).unwrap();
        tasks.register(TaskDefinition::new("b", action()).with_requires("c")).unwrap();
        tasks.register(TaskDefinition::new("c", action())).unwrap();
        tasks
    }

    fn session(
        tasks: TaskRegistry,
        cache: ArtifactCache,
        reporter: Arc<CollectingReporter>,
    ) -> BuildSession {
        BuildSession::new(tasks, InfluenceRegistry::with_defaults(), Arc::new(cache), reporter)
    }

    fn recorded(log: &Log) -> Vec<String> {
        log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[tokio::test]
    async fn test_chain_builds_dependencies_first() {
        let temp = TempDir::new().unwrap();
        let log = Log::default();
        let reporter = Arc::new(CollectingReporter::default());
        let session = session(chain(&log), open_cache(temp.path(), 0), reporter.clone());

        let mut graph = session.graph(&["a"]).unwrap();
        let summary = session.execute(&mut graph).await.unwrap();

        assert_eq!(recorded(&log), vec!["c", "b", "a"]);
        assert!(graph.is_empty());
        assert_eq!(summary.built, 3);
        assert_eq!(summary.pruned, 0);
        for name in ["a", "b", "c"] {
            assert!(session.cache().is_available_locally(graph.find(name).unwrap()));
        }
        assert!(matches!(
            reporter.events().last(),
            Some(TaskEvent::AllCompleted { total: 3, built: 3, failed: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_cached_dependency_prunes_its_subtree() {
        let temp = TempDir::new().unwrap();
        let log = Log::default();
        let reporter = Arc::new(CollectingReporter::default());
        let session = session(chain(&log), open_cache(temp.path(), 0), reporter.clone());

        let mut graph = session.graph(&["a"]).unwrap();
        let b = graph.find("b").unwrap().clone();
        let staged = session.cache().stage(b.clone()).unwrap();
        std::fs::write(staged.path().join("data"), "cached").unwrap();
        session.cache().commit(staged).unwrap();

        let summary = session.execute(&mut graph).await.unwrap();
        assert_eq!(recorded(&log), vec!["a"]);
        assert_eq!(summary.built, 1);
        assert_eq!(summary.pruned, 2);
        assert!(!session.cache().is_available_locally(graph.find("c").unwrap()));

        let pruned: Vec<String> = reporter
            .events()
            .into_iter()
            .filter_map(|event| match event {
                TaskEvent::Pruned { task, .. } => Some(task),
                _ => None,
            })
            .collect();
        assert_eq!(pruned, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_stops_dependents() {
        let temp = TempDir::new().unwrap();
        let log = Log::default();
        let reporter = Arc::new(CollectingReporter::default());
        let mut tasks = TaskRegistry::new();
        tasks
            .register(TaskDefinition::new("app", recording(&log, 1)).with_requires("lib"))
            .unwrap();
        tasks
            .register(TaskDefinition::new("lib", Arc::new(FailingAction)).with_requires("base"))
            .unwrap();
        tasks
            .register(TaskDefinition::new("base", recording(&log, 1)))
            .unwrap();
        let session = session(tasks, open_cache(temp.path(), 0), reporter.clone());

        let err = session.build(&["app"]).await.unwrap_err();
        match err {
            BuildError::Execution(error) => {
                assert_eq!(error.task, "lib");
                assert_eq!(error.stage, Stage::Build);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(recorded(&log), vec!["base"]);
        assert!(!reporter.started().contains(&"app".to_string()));
        assert!(reporter.events().iter().any(|event| matches!(
            event,
            TaskEvent::Failed { task, stage: Stage::Build, .. } if task == "lib"
        )));
    }

    #[tokio::test]
    async fn test_third_commit_evicts_least_recently_used() {
        let temp = TempDir::new().unwrap();
        let log = Log::default();
        let mut tasks = TaskRegistry::new();
        for name in ["x", "y", "z"] {
            tasks
                .register(TaskDefinition::new(name, recording(&log, 100)))
                .unwrap();
        }
        let reporter = Arc::new(CollectingReporter::default());
        let session = session(tasks, open_cache(temp.path(), 250), reporter);

        session.build(&["x"]).await.unwrap();
        session.build(&["y"]).await.unwrap();
        assert_eq!(session.cache().status().total_size, 200);

        session.build(&["z"]).await.unwrap();
        let graph = session.graph(&["x", "y", "z"]).unwrap();
        let available =
            |name: &str| session.cache().is_available_locally(graph.find(name).unwrap());
        assert!(!available("x"));
        assert!(available("y"));
        assert!(available("z"));
        assert_eq!(session.cache().status().total_size, 200);
    }

    #[tokio::test]
    async fn test_remote_artifact_replaces_subtree() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorage::default());

        let producer_log = Log::default();
        let producer = session(
            chain(&producer_log),
            open_cache(&temp.path().join("producer"), 0).with_storage(storage.clone()),
            Arc::new(CollectingReporter::default()),
        );
        producer.build(&["a"]).await.unwrap();
        assert_eq!(storage.len(), 3);

        let consumer_log = Log::default();
        let reporter = Arc::new(CollectingReporter::default());
        let consumer = session(
            chain(&consumer_log),
            open_cache(&temp.path().join("consumer"), 0).with_storage(storage.clone()),
            reporter.clone(),
        );
        let mut graph = consumer.graph(&["a"]).unwrap();
        let summary = consumer.execute(&mut graph).await.unwrap();

        assert!(recorded(&consumer_log).is_empty());
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.pruned, 2);
        assert!(consumer.cache().is_available_locally(graph.find("a").unwrap()));
        assert!(!consumer.cache().is_available_locally(graph.find("c").unwrap()));
        assert!(reporter
            .events()
            .contains(&TaskEvent::Downloaded { task: "a".to_string() }));
    }

    #[tokio::test]
    async fn test_failed_transfer_is_a_download_error() {
        let temp = TempDir::new().unwrap();
        let log = Log::default();
        let session = session(
            chain(&log),
            open_cache(temp.path(), 0).with_storage(Arc::new(UnreachableStorage)),
            Arc::new(CollectingReporter::default()),
        );

        let err = session.build(&["a"]).await.unwrap_err();
        match err {
            BuildError::Execution(error) => {
                assert_eq!(error.task, "a");
                assert_eq!(error.stage, Stage::Download);
                assert!(error.message.contains("connection reset"), "{}", error.message);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(recorded(&log).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_dependency_is_unpacked_once() {
        let temp = TempDir::new().unwrap();
        let log = Log::default();
        let unpacks = Arc::new(AtomicUsize::new(0));
        let mut tasks = TaskRegistry::new();
        let sdk = SlowUnpack {
            unpacks: unpacks.clone(),
        };
        tasks.register(TaskDefinition::new("sdk", Arc::new(sdk))).unwrap();
        for name in ["left", "right"] {
            tasks
                .register(TaskDefinition::new(name, recording(&log, 1)).with_requires("sdk"))
                .unwrap();
        }
        let reporter = Arc::new(CollectingReporter::default());
        let session =
            session(tasks, open_cache(temp.path(), 0), reporter).with_options(SchedulerOptions {
                concurrency: 4,
                network: false,
            });

        let summary = session.build(&["left", "right"]).await.unwrap();
        assert_eq!(summary.built, 3);
        assert_eq!(unpacks.load(Ordering::SeqCst), 1);

        let graph = session.graph(&["sdk"]).unwrap();
        let sdk = graph.find("sdk").unwrap();
        assert!(session.cache().manifest(sdk).unwrap().unpacked);
        assert!(session.cache().get_path(sdk).join("sdk").exists());
    }

    #[tokio::test]
    async fn test_session_from_config() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        let toml = format!(
            r#"
[cache]
root = "{cache}"

[scheduler]
concurrency = 2

[storage.directory]
path = "remote"

[tasks.hello]
command = "echo hello > \"$CAIRN_OUTPUT/hello.txt\""
[tasks.hello.exports]
PATH = "bin"

[tasks.greet]
requires = ["hello"]
command = "cat \"$CAIRN_DEP_HELLO/hello.txt\" > \"$CAIRN_OUTPUT/greeting.txt\""
"#,
            cache = temp.path().join("cache").display()
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let reporter = Arc::new(CollectingReporter::default());
        let session = BuildSession::from_config(&config, &project, reporter.clone()).unwrap();
        assert_eq!(session.options().concurrency, 2);
        assert_eq!(session.tasks().len(), 2);

        let summary = session.build(&["greet"]).await.unwrap();
        assert_eq!(summary.built, 2);

        let graph = session.graph(&["greet"]).unwrap();
        let greet = graph.find("greet").unwrap();
        let greeting =
            std::fs::read_to_string(session.cache().get_path(greet).join("greeting.txt")).unwrap();
        assert_eq!(greeting, "hello\n");
        assert!(project.join("remote").join("hello").exists());

        // A second build finds everything in the cache
        let summary = session.build(&["greet"]).await.unwrap();
        assert_eq!(summary.built, 0);
        assert_eq!(summary.pruned, 2);
    }
}
