//! Shell task actions declared in the configuration file

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use cairn_core::{Config, TaskConfig};

use crate::context::ExecutionContext;
use crate::error::TaskError;
use crate::influence::{EnvironmentInfluence, FileInfluence, GitInfluence};
use crate::task::{ParameterSpec, TaskAction, TaskDefinition, TaskInstance};

/// Environment variable holding the output directory
pub const OUTPUT_VARIABLE: &str = "CAIRN_OUTPUT";

/// Prefix of the variables holding dependency artifact paths
pub const DEPENDENCY_PREFIX: &str = "CAIRN_DEP_";

/// Environment variable holding the artifact directory during unpack
pub const ARTIFACT_VARIABLE: &str = "CAIRN_ARTIFACT";

/// Number of trailing stderr lines kept for error messages
const STDERR_TAIL: usize = 10;

/// Runs `sh -c` commands and publishes configured attributes
#[derive(Debug, Clone, Default)]
pub struct ShellAction {
    command: Option<String>,
    workdir: PathBuf,
    exports: BTreeMap<String, String>,
    strings: BTreeMap<String, String>,
    unpack: Option<String>,
}

impl ShellAction {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_export(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exports.insert(key.into(), value.into());
        self
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    pub fn with_unpack(mut self, script: impl Into<String>) -> Self {
        self.unpack = Some(script.into());
        self
    }

    fn from_config(config: &TaskConfig, workdir: &Path) -> Self {
        Self {
            command: config.command.clone(),
            workdir: workdir.to_path_buf(),
            exports: config.exports.clone(),
            strings: config.strings.clone(),
            unpack: config.unpack.clone(),
        }
    }
}

/// Environment variable name for a dependency, e.g. `CAIRN_DEP_TOOLCHAIN_GCC`
pub fn dependency_variable(canonical: &str) -> String {
    let suffix: String = canonical
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", DEPENDENCY_PREFIX, suffix)
}

#[async_trait]
impl TaskAction for ShellAction {
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_deref().unwrap_or_default());
        for (key, value) in self.exports.iter().chain(self.strings.iter()) {
            hasher.update(format!("\n{}={}", key, value));
        }
        if let Some(unpack) = &self.unpack {
            hasher.update(format!("\nunpack {}", unpack));
        }
        format!("{:x}", hasher.finalize())
    }

    #[instrument(skip_all, fields(task = %ctx.instance().qualified_name()))]
    async fn run(&self, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
        let instance = ctx.instance().clone();

        if let Some(template) = &self.command {
            let script = instance.expand(template)?;
            debug!(command = %script, "running shell command");

            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&script)
                .current_dir(&self.workdir)
                .env_clear()
                .envs(ctx.env().iter())
                .env(OUTPUT_VARIABLE, ctx.output_dir())
                .kill_on_drop(true);
            for dependency in ctx.dependencies() {
                let canonical = dependency.task.replace('/', "_");
                command.env(dependency_variable(&canonical), &dependency.path);
            }
            run_command(command, ctx).await?;
        }

        for (key, value) in &self.exports {
            let value = instance.expand(value)?;
            ctx.publish("environ", key, &value)?;
        }
        for (key, value) in &self.strings {
            let value = instance.expand(value)?;
            ctx.publish("strings", key, &value)?;
        }
        Ok(())
    }

    fn is_unpackable(&self) -> bool {
        self.unpack.is_some()
    }

    async fn unpack(&self, task: &TaskInstance, artifact: &Path) -> anyhow::Result<()> {
        let Some(template) = &self.unpack else {
            return Ok(());
        };
        let script = task.expand(template)?;
        debug!(task = %task.qualified_name(), command = %script, "running unpack command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .current_dir(artifact)
            .env(ARTIFACT_VARIABLE, artifact)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to spawn sh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "unpack command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// Run a command, forwarding its output lines to the context's reporter
async fn run_command(mut command: Command, ctx: &ExecutionContext<'_>) -> anyhow::Result<()> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn sh")?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let forward_stdout = async {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                ctx.report_output(line, false);
            }
        }
    };
    let forward_stderr = async {
        let mut tail = Vec::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line.clone());
                ctx.report_output(line, true);
            }
        }
        tail
    };

    let ((), tail) = tokio::join!(forward_stdout, forward_stderr);
    let status = child.wait().await.context("failed to wait for sh")?;

    if !status.success() {
        if tail.is_empty() {
            bail!("command exited with {}", status);
        }
        bail!("command exited with {}: {}", status, tail.join("\n"));
    }
    Ok(())
}

/// Task definitions for every task in the configuration.
///
/// Commands run in `base_dir`; file and git influence paths are relative to
/// it.
pub fn definitions_from_config(
    config: &Config,
    base_dir: &Path,
) -> Result<Vec<TaskDefinition>, TaskError> {
    let mut definitions = Vec::with_capacity(config.tasks.len());

    for (name, task) in &config.tasks {
        if name.is_empty() || name.contains(':') {
            return Err(TaskError::MalformedName(name.clone()));
        }

        let action = ShellAction::from_config(task, base_dir);
        let mut definition =
            TaskDefinition::new(name.clone(), Arc::new(action)).with_cacheable(task.cacheable);

        for (parameter, spec) in &task.parameters {
            definition = definition.with_parameter(parameter.clone(), ParameterSpec::from(spec));
        }
        for requirement in &task.requires {
            definition = definition.with_requires(requirement.clone());
        }
        for pattern in &task.influence {
            let influence = FileInfluence::new(base_dir, pattern.clone());
            definition = definition.with_influence(Arc::new(influence));
        }
        for variable in &task.environ_influence {
            let influence = EnvironmentInfluence::new(variable.clone());
            definition = definition.with_influence(Arc::new(influence));
        }
        for path in &task.git_influence {
            let influence = GitInfluence::new(base_dir.join(path));
            definition = definition.with_influence(Arc::new(influence));
        }

        debug!(task = %name, "loaded task definition");
        definitions.push(definition);
    }

    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Attribute, AttributeRegistry, Environment};
    use crate::context::DependencyArtifact;
    use crate::reporter::{CollectingReporter, TaskEvent};
    use crate::task::TaskRegistry;
    use cairn_core::ParameterConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(action: ShellAction) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register(
                TaskDefinition::new("greeter", Arc::new(action))
                    .with_parameter("name", ParameterSpec::new().with_default("world")),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_dependency_variable() {
        assert_eq!(dependency_variable("toolchain_gcc"), "CAIRN_DEP_TOOLCHAIN_GCC");
        assert_eq!(dependency_variable("lib-ssl"), "CAIRN_DEP_LIB_SSL");
    }

    #[test]
    fn test_fingerprint_tracks_command() {
        let a = ShellAction::new("/src").with_command("make");
        let b = ShellAction::new("/src").with_command("make install");
        let c = ShellAction::new("/elsewhere").with_command("make");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), a.clone().with_export("PATH", "bin").fingerprint());
    }

    #[tokio::test]
    async fn test_run_shell_command() {
        let workdir = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let action = ShellAction::new(workdir.path())
            .with_command(concat!(
                "echo hello {name} > \"$CAIRN_OUTPUT/greeting\"; ",
                "echo done; ",
                "echo \"$CAIRN_DEP_COMPILER\" >&2",
            ))
            .with_export("PATH", "bin")
            .with_string("greeting", "hello {name}");
        let tasks = registry(action);
        let instance = tasks.instance("greeter:name=cairn").unwrap();

        let reporter = Arc::new(CollectingReporter::default());
        let mut env: Environment = [("PATH", "/usr/bin:/bin")].into_iter().collect();
        let dependency = DependencyArtifact {
            task: "compiler".to_string(),
            path: PathBuf::from("/cache/compiler/abc"),
            attributes: Default::default(),
        };
        let mut ctx = ExecutionContext::new(
            instance.clone(),
            output.path(),
            vec![dependency],
            env.scope(),
            Arc::new(AttributeRegistry::with_defaults()),
            reporter.clone(),
        );

        instance.action().run(&mut ctx).await.unwrap();
        let attributes = ctx.into_attributes();

        assert_eq!(
            std::fs::read_to_string(output.path().join("greeting")).unwrap(),
            "hello cairn\n"
        );
        assert_eq!(
            attributes["strings"]["greeting"],
            Attribute::Text("hello cairn".to_string())
        );
        assert_eq!(
            attributes["environ"]["PATH"],
            Attribute::PathList(vec!["bin".to_string()])
        );

        let events = reporter.events();
        assert!(events.contains(&TaskEvent::Output {
            task: "greeter:name=cairn".to_string(),
            line: "done".to_string(),
            is_stderr: false,
        }));
        assert!(events.contains(&TaskEvent::Output {
            task: "greeter:name=cairn".to_string(),
            line: "/cache/compiler/abc".to_string(),
            is_stderr: true,
        }));
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let workdir = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let action = ShellAction::new(workdir.path()).with_command("echo broken >&2; exit 3");
        let tasks = registry(action);
        let instance = tasks.instance("greeter").unwrap();

        let mut env: Environment = [("PATH", "/usr/bin:/bin")].into_iter().collect();
        let mut ctx = ExecutionContext::new(
            instance.clone(),
            output.path(),
            Vec::new(),
            env.scope(),
            Arc::new(AttributeRegistry::with_defaults()),
            Arc::new(CollectingReporter::default()),
        );

        let err = instance.action().run(&mut ctx).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("broken"));
    }

    #[tokio::test]
    async fn test_dropped_run_kills_command() {
        let workdir = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let action =
            ShellAction::new(workdir.path()).with_command("sleep 1; touch \"$CAIRN_OUTPUT/late\"");
        let tasks = registry(action);
        let instance = tasks.instance("greeter").unwrap();

        let mut env: Environment = [("PATH", "/usr/bin:/bin")].into_iter().collect();
        let mut ctx = ExecutionContext::new(
            instance.clone(),
            output.path(),
            Vec::new(),
            env.scope(),
            Arc::new(AttributeRegistry::with_defaults()),
            Arc::new(CollectingReporter::default()),
        );

        let run = instance.action().run(&mut ctx);
        assert!(tokio::time::timeout(Duration::from_millis(200), run).await.is_err());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!output.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_unpack_script_runs_in_artifact() {
        let artifact = TempDir::new().unwrap();
        let action = ShellAction::new("/").with_unpack("touch \"$CAIRN_ARTIFACT/{name}.ready\"");
        assert!(action.is_unpackable());
        let tasks = registry(action);
        let instance = tasks.instance("greeter").unwrap();

        instance
            .action()
            .unpack(&instance, artifact.path())
            .await
            .unwrap();
        assert!(artifact.path().join("world.ready").exists());
    }

    #[test]
    fn test_definitions_from_config() {
        let toml = r#"
[tasks.compiler]
command = "make"
influence = ["src/*.c"]
environ_influence = ["CC"]
[tasks.compiler.parameters.arch]
default = "x86_64"
values = ["x86_64", "aarch64"]

[tasks.app]
requires = ["compiler:arch=aarch64"]
cacheable = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let definitions = definitions_from_config(&config, Path::new("/project")).unwrap();
        assert_eq!(definitions.len(), 2);

        let app = definitions.iter().find(|d| d.name == "app").unwrap();
        assert!(!app.cacheable);
        assert_eq!(app.requires, vec!["compiler:arch=aarch64".to_string()]);

        let compiler = definitions.iter().find(|d| d.name == "compiler").unwrap();
        assert!(compiler.cacheable);
        assert_eq!(compiler.influence.len(), 2);
        assert_eq!(
            compiler.parameters["arch"],
            ParameterSpec::from(&ParameterConfig {
                default: Some("x86_64".to_string()),
                values: Some(vec!["x86_64".to_string(), "aarch64".to_string()]),
                help: None,
            })
        );
    }
}
