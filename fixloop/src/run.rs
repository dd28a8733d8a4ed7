//! Orchestration for `fixloop run`: inspect a project and execute it once.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::dotenv;
use crate::core::types::{ExecutionResult, ProjectContext};
use crate::io::config::{FixloopConfig, config_path, load_config};
use crate::io::executor::{CommandRunner, RunRequest};
use crate::io::inspector::{ConfigurationError, InspectOptions, inspect};

/// Caller overrides for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replaces the detected run command.
    pub run_command: Option<Vec<String>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub context: ProjectContext,
    pub execution: ExecutionResult,
}

/// Inspect `path` and run it once.
///
/// Fails with [`ConfigurationError`] when the path is invalid or no run
/// command can be resolved. A failing or timed-out run is a value.
pub fn run_project<R: CommandRunner>(
    runner: &R,
    path: &Path,
    options: &RunOptions,
) -> Result<RunOutcome> {
    let context = inspect(
        path,
        &InspectOptions {
            run_command: options.run_command.clone(),
            test_command: None,
        },
    )?;
    let config = project_config(&context)?;
    let timeout = options.timeout.unwrap_or_else(|| config.run_timeout());
    let overlay = dotenv_overlay(&context.root)?;
    let execution = execute(runner, &context, &overlay, timeout, config.output_limit_bytes)?;
    Ok(RunOutcome { context, execution })
}

/// Load `.fixloop/config.toml` for an inspected project.
pub fn project_config(context: &ProjectContext) -> Result<FixloopConfig> {
    let path = config_path(&context.root);
    load_config(&path).with_context(|| format!("load {}", path.display()))
}

/// Variables from the project's `.env`, re-read on every call so fixes
/// that edit it take effect on the next run.
pub fn dotenv_overlay(root: &Path) -> Result<BTreeMap<String, String>> {
    let path = root.join(".env");
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(dotenv::parse(&contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Run the context's run command with its environment plus `overlay`.
#[instrument(skip_all, fields(project = %context.root.display()))]
pub fn execute<R: CommandRunner>(
    runner: &R,
    context: &ProjectContext,
    overlay: &BTreeMap<String, String>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ExecutionResult> {
    let Some(argv) = context.run_command.clone() else {
        return Err(ConfigurationError::new(format!(
            "no run command detected for {}; pass one explicitly",
            context.root.display()
        ))
        .into());
    };
    let request = RunRequest::new(argv, &context.root, timeout)
        .with_env(&context.env)
        .with_env(overlay)
        .with_output_limit(output_limit_bytes);
    let execution = runner.run(&request).context("run project")?;
    debug!(
        exit_code = execution.exit_code,
        timed_out = execution.timed_out,
        "project run finished"
    );
    Ok(execution)
}
