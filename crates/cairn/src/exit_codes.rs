//! Exit codes for the CLI

use cairn_core::{CairnError, ConfigError};
use cairn_tasks::BuildError;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error: bad config file, unknown task, cycle
pub const CONFIG_ERROR: i32 = 2;

/// A task failed to build, upload, download or unpack
pub const BUILD_ERROR: i32 = 3;

/// Cache could not be opened or maintained
pub const CACHE_ERROR: i32 = 4;

/// Exit code for an error returned by a command
pub fn for_error(error: &anyhow::Error) -> i32 {
    if let Some(build) = error.downcast_ref::<BuildError>() {
        return match build {
            BuildError::Config(_) | BuildError::Task(_) | BuildError::Graph(_) => CONFIG_ERROR,
            BuildError::Cache(_) => CACHE_ERROR,
            BuildError::Execution(_) | BuildError::Stalled(_) | BuildError::Worker(_) => {
                BUILD_ERROR
            }
        };
    }
    if error.downcast_ref::<CairnError>().is_some()
        || error.downcast_ref::<ConfigError>().is_some()
    {
        return CONFIG_ERROR;
    }
    if error.downcast_ref::<cairn_tasks::GraphError>().is_some()
        || error.downcast_ref::<cairn_tasks::TaskError>().is_some()
    {
        return CONFIG_ERROR;
    }
    if error.downcast_ref::<cairn_tasks::CacheError>().is_some() {
        return CACHE_ERROR;
    }
    ERROR
}
