//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_cache(config)?;
    validate_scheduler(config)?;
    validate_storage(config)?;
    validate_tasks(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    let root = config.cache.resolved_root();
    if root.as_os_str().is_empty() {
        return Err(ConfigError::invalid("cache.root", "cache root cannot be empty").into());
    }

    if root.is_file() {
        return Err(ConfigError::invalid(
            "cache.root",
            format!("{} is a file, not a directory", root.display()),
        )
        .into());
    }

    Ok(())
}

fn validate_scheduler(config: &Config) -> Result<()> {
    if config.scheduler.concurrency == 0 {
        return Err(
            ConfigError::invalid("scheduler.concurrency", "must be at least 1").into(),
        );
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<()> {
    if let Some(directory) = &config.storage.directory {
        if directory.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "storage.directory.path",
                "storage path cannot be empty",
            )
            .into());
        }
    }

    Ok(())
}

fn validate_tasks(config: &Config) -> Result<()> {
    if !config.tasks.is_empty() {
        debug!(count = config.tasks.len(), "validating tasks");
    }

    for (name, task) in &config.tasks {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid("tasks", "task name cannot be empty").into());
        }

        for (i, requirement) in task.requires.iter().enumerate() {
            let field = format!("tasks.{}.requires[{}]", name, i);
            let kind = requirement.split(':').next().unwrap_or_default().trim();
            if kind.is_empty() {
                return Err(ConfigError::invalid(field, "requirement cannot be empty").into());
            }

            // Kinds produced by macro expansion are checked when the graph is built
            if !kind.contains('{') && !config.tasks.contains_key(kind) {
                return Err(
                    ConfigError::invalid(field, format!("unknown task '{}'", kind)).into(),
                );
            }
        }

        for (param, spec) in &task.parameters {
            if let (Some(default), Some(values)) = (&spec.default, &spec.values) {
                if !values.contains(default) {
                    return Err(ConfigError::invalid(
                        format!("tasks.{}.parameters.{}.default", name, param),
                        format!("must be one of: {}", values.join(", ")),
                    )
                    .into());
                }
            }
        }
    }

    Ok(())
}
