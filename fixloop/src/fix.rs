//! Orchestration for `fixloop fix`: one pass of propose-and-apply.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::classifier::classify;
use crate::core::diagnosis::ErrorEntry;
use crate::core::fix::{FixApplication, best_fix};
use crate::core::health::assess;
use crate::core::types::ProjectContext;
use crate::io::applier::{ApplyOptions, apply};
use crate::io::backup::BackupStore;
use crate::io::config::FixloopConfig;
use crate::io::executor::CommandRunner;
use crate::io::inspector::{InspectOptions, inspect};
use crate::io::oracle::FixOracle;
use crate::io::test_runner::run_tests_after;
use crate::run::{dotenv_overlay, execute, project_config};

#[derive(Debug, Clone, Default)]
pub struct FixOptions {
    pub run_command: Option<Vec<String>>,
    /// Classify this text instead of running the project.
    pub error_text: Option<String>,
    pub confidence_threshold: Option<f64>,
    pub auto_apply: Option<bool>,
}

/// Propose and apply (or suggest) one fix per distinct error signature.
///
/// At most `max_errors_per_fix_pass` signatures are sent to the oracle.
/// Oracle failures skip the error; applier failures abort the pass.
pub fn fix_issues<R: CommandRunner, O: FixOracle>(
    runner: &R,
    oracle: &O,
    path: &Path,
    options: &FixOptions,
) -> Result<Vec<FixApplication>> {
    let context = inspect(
        path,
        &InspectOptions {
            run_command: options.run_command.clone(),
            test_command: None,
        },
    )?;
    let mut config = project_config(&context)?;
    if let Some(threshold) = options.confidence_threshold {
        config.confidence_threshold = threshold;
    }
    if let Some(auto_apply) = options.auto_apply {
        config.auto_fix = auto_apply;
    }
    config.validate()?;

    let errors = match &options.error_text {
        Some(text) => classify(text),
        None => {
            let overlay = dotenv_overlay(&context.root)?;
            let execution = execute(
                runner,
                &context,
                &overlay,
                config.run_timeout(),
                config.output_limit_bytes,
            )?;
            let tests = run_tests_after(runner, &context, &overlay, &execution, &config)?;
            assess(None, &execution, tests.as_ref(), config.timeout_means_running).errors
        }
    };
    info!(errors = errors.len(), "fix pass starting");

    let mut backups = BackupStore::new(&context.root, &config.backup_dir);
    fix_errors(
        runner,
        oracle,
        &context,
        &config,
        &mut backups,
        &errors,
        &HashSet::new(),
    )
}

/// Fix each distinct signature in `errors` once, skipping `exhausted` ones.
pub(crate) fn fix_errors<R: CommandRunner, O: FixOracle>(
    runner: &R,
    oracle: &O,
    context: &ProjectContext,
    config: &FixloopConfig,
    backups: &mut BackupStore,
    errors: &[ErrorEntry],
    exhausted: &HashSet<String>,
) -> Result<Vec<FixApplication>> {
    let apply_options = ApplyOptions {
        confidence_threshold: config.confidence_threshold,
        auto_apply: config.auto_fix,
        command_timeout: config.fix_command_timeout(),
        output_limit_bytes: config.output_limit_bytes,
    };
    let mut seen = HashSet::new();
    let mut applications = Vec::new();
    for error in errors
        .iter()
        .filter(|e| !exhausted.contains(&e.signature))
        .filter(|e| seen.insert(e.signature.clone()))
        .take(config.max_errors_per_fix_pass)
    {
        let proposal = match oracle.propose_fix(error, context) {
            Ok(proposal) => proposal,
            Err(err) => {
                warn!(signature = %error.signature, err = %format!("{err:#}"), "oracle failed");
                continue;
            }
        };
        let Some(fix) = best_fix(&proposal.fixes) else {
            info!(signature = %error.signature, root_cause = %proposal.root_cause, "no fix proposed");
            continue;
        };
        let application = apply(runner, backups, context, fix, &error.signature, &apply_options)?;
        applications.push(application);
    }
    Ok(applications)
}
