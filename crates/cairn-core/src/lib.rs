//! Cairn Core - configuration and error types
//!
//! This crate provides the configuration model shared by the cairn engine
//! and command line front end, together with the error types used while
//! loading and validating it.

pub mod config;
pub mod error;

pub use config::{
    find_config, load_config, load_config_from_dir, load_config_or_default, CacheConfig, Config,
    DirectoryStorageConfig, ParameterConfig, SchedulerConfig, StorageConfig, TaskConfig,
};
pub use error::{CairnError, ConfigError, Result};
