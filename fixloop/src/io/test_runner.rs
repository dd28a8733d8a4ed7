//! Test command execution.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::health::run_is_healthy;
use crate::core::test_parser::build_outcome;
use crate::core::types::{ExecutionResult, ProjectContext, TestOutcome};
use crate::io::config::FixloopConfig;
use crate::io::executor::{CommandRunner, RunRequest};

/// Run the tests for a cycle whose project run produced `execution`.
///
/// Skipped when tests are disabled or the run crashed: a project that cannot
/// start only repeats its errors through the test runner.
pub fn run_tests_after<R: CommandRunner>(
    runner: &R,
    context: &ProjectContext,
    extra_env: &BTreeMap<String, String>,
    execution: &ExecutionResult,
    config: &FixloopConfig,
) -> Result<Option<TestOutcome>> {
    if !config.run_tests {
        return Ok(None);
    }
    if !run_is_healthy(execution, config.timeout_means_running) {
        debug!(exit_code = execution.exit_code, "run failed; skipping tests");
        return Ok(None);
    }
    run_tests(
        runner,
        context,
        extra_env,
        config.test_timeout(),
        config.output_limit_bytes,
    )
}

/// Run the project's test command. `None` when the project has none.
///
/// `extra_env` is layered over the context environment (e.g. values read
/// from the project's `.env`).
#[instrument(skip_all, fields(project = %context.root.display()))]
pub fn run_tests<R: CommandRunner>(
    runner: &R,
    context: &ProjectContext,
    extra_env: &BTreeMap<String, String>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<Option<TestOutcome>> {
    let Some(argv) = context.test_command.clone() else {
        return Ok(None);
    };
    let request = RunRequest::new(argv, &context.root, timeout)
        .with_env(&context.env)
        .with_env(extra_env)
        .with_output_limit(output_limit_bytes);
    let execution = runner.run(&request).context("run test command")?;
    let outcome = build_outcome(context.test_framework, &execution);
    info!(
        total = outcome.total,
        passed = outcome.passed,
        failed = outcome.failed,
        parse_failed = outcome.parse_failed,
        "tests finished"
    );
    Ok(Some(outcome))
}
