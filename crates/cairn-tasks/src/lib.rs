//! Cairn Tasks - dependency-driven build engine
//!
//! This crate resolves task instances into a dependency graph, derives a
//! content identity for every node, and executes the graph against a
//! content-addressed artifact cache that can be shared through remote
//! storage.

pub mod attributes;
pub mod cache;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod influence;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod shell;
pub mod storage;
pub mod task;

pub use attributes::{Attribute, AttributeProvider, AttributeRegistry, Attributes, Environment};
pub use cache::{ArtifactCache, CacheOptions, CacheStats, EvictionStats};
pub use context::{DependencyArtifact, ExecutionContext};
pub use error::{BuildError, CacheError, ExecutionError, GraphError, Stage, TaskError};
pub use executor::{ExecutionOutcome, Executor, ExecutorFactory, ExecutorRegistry, NetworkExtension};
pub use graph::{Graph, GraphBuilder, GraphNode};
pub use influence::{Identity, InfluenceProvider, InfluenceRegistry};
pub use reporter::{TaskEvent, TaskReporter, TaskReporterRegistry};
pub use scheduler::{BuildSummary, SchedulerOptions, TaskScheduler};
pub use session::BuildSession;
pub use shell::{definitions_from_config, ShellAction};
pub use storage::{DirectoryStorage, StorageProvider};
pub use task::{ParameterSpec, TaskAction, TaskDefinition, TaskInstance, TaskRegistry};
