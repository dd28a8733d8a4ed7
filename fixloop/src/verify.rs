//! Orchestration for `fixloop verify`: the execute → test → classify → fix loop.
//!
//! A [`VerificationSession`] owns all cross-cycle state. Every cycle is
//! appended before stop conditions are evaluated, and once a session has
//! started it always produces a [`VerificationReport`], including when an
//! internal failure aborts it.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::core::health::assess;
use crate::core::progress::{StopPolicy, evaluate};
use crate::core::report::{
    CycleRecord, LoopStatus, VerificationReport, compute_stats, cycle_status, recommendations,
    trend,
};
use crate::core::types::{ExecutionResult, ProjectContext};
use crate::fix::fix_errors;
use crate::io::backup::BackupStore;
use crate::io::config::FixloopConfig;
use crate::io::executor::{CommandRunner, RunRequest};
use crate::io::inspector::{ConfigurationError, InspectOptions, inspect};
use crate::io::oracle::FixOracle;
use crate::io::session_log::{SessionPaths, new_session_id, write_cycle, write_report};
use crate::io::test_runner::run_tests_after;
use crate::run::{dotenv_overlay, execute, project_config};

/// Caller overrides for one verification session. `None` keeps the value
/// from `.fixloop/config.toml`.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub run_command: Option<Vec<String>>,
    pub test_command: Option<Vec<String>>,
    /// Run timeout per cycle.
    pub timeout: Option<Duration>,
    pub max_cycles: Option<u32>,
    pub auto_apply: Option<bool>,
    pub confidence_threshold: Option<f64>,
    pub run_tests: Option<bool>,
    pub setup: Option<bool>,
}

impl VerifyOptions {
    fn apply_to(&self, config: &mut FixloopConfig) {
        if let Some(timeout) = self.timeout {
            config.run_timeout_secs = timeout.as_secs().max(1);
        }
        if let Some(max_cycles) = self.max_cycles {
            config.max_cycles = max_cycles;
        }
        if let Some(auto_apply) = self.auto_apply {
            config.auto_fix = auto_apply;
        }
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold;
        }
        if let Some(run_tests) = self.run_tests {
            config.run_tests = run_tests;
        }
        if let Some(setup) = self.setup {
            config.setup = setup;
        }
    }
}

/// Inspect `path` and verify it until success or a stop condition.
///
/// Errors are limited to problems found before the session starts (invalid
/// path or config, no run command). Afterwards the outcome is the report.
pub fn verify_project<R: CommandRunner, O: FixOracle>(
    runner: R,
    oracle: O,
    path: &Path,
    options: &VerifyOptions,
) -> Result<VerificationReport> {
    let context = inspect(
        path,
        &InspectOptions {
            run_command: options.run_command.clone(),
            test_command: options.test_command.clone(),
        },
    )?;
    if context.run_command.is_none() {
        return Err(ConfigurationError::new(format!(
            "no run command detected for {}; pass one explicitly",
            context.root.display()
        ))
        .into());
    }
    let mut config = project_config(&context)?;
    options.apply_to(&mut config);
    config.validate().context("validate options")?;

    let mut session = VerificationSession::new(runner, oracle, context, config);
    Ok(session.run())
}

/// State of one verification session.
pub struct VerificationSession<R, O> {
    id: String,
    context: ProjectContext,
    runner: R,
    oracle: O,
    config: FixloopConfig,
    backups: BackupStore,
    cycles: Vec<CycleRecord>,
    /// Attempted (non-suggested) applications per signature.
    attempts: BTreeMap<String, u32>,
    paths: Option<SessionPaths>,
    started_at: DateTime<Utc>,
}

impl<R: CommandRunner, O: FixOracle> VerificationSession<R, O> {
    pub fn new(runner: R, oracle: O, context: ProjectContext, config: FixloopConfig) -> Self {
        let id = new_session_id();
        let paths = config
            .record_sessions
            .then(|| SessionPaths::new(&context.root.join(&config.sessions_dir), &id));
        Self {
            backups: BackupStore::new(&context.root, &config.backup_dir),
            id,
            context,
            runner,
            oracle,
            config,
            cycles: Vec::new(),
            attempts: BTreeMap::new(),
            paths,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cycles(&self) -> &[CycleRecord] {
        &self.cycles
    }

    /// Drive cycles until a stop condition fires.
    #[instrument(skip_all, fields(session = %self.id, project = %self.context.root.display()))]
    pub fn run(&mut self) -> VerificationReport {
        let policy = StopPolicy {
            max_cycles: self.config.max_cycles,
            stuck_threshold: self.config.stuck_threshold,
            auto_fix: self.config.auto_fix,
        };
        info!(max_cycles = policy.max_cycles, "verification started");

        loop {
            let number = self.next_cycle_number();
            let record = match self.run_cycle(number) {
                Ok(record) => record,
                Err(err) => {
                    let failure = format!("{err:#}");
                    error!(cycle = number, err = %failure, "verification aborted");
                    return self.finish(
                        LoopStatus::Failed,
                        "internal failure".to_string(),
                        Some(&failure),
                    );
                }
            };
            info!(
                cycle = number,
                errors = record.error_count(),
                status = ?record.status,
                "cycle finished"
            );
            self.log_cycle(&record);
            self.cycles.push(record);

            if let Some(stop) = evaluate(&self.cycles, &policy, &self.exhausted()) {
                return self.finish(stop.status(), stop.describe(), None);
            }
        }
    }

    fn next_cycle_number(&self) -> u32 {
        u32::try_from(self.cycles.len()).map_or(u32::MAX, |n| n.saturating_add(1))
    }

    #[instrument(skip_all, fields(cycle = number))]
    fn run_cycle(&mut self, number: u32) -> Result<CycleRecord> {
        let overlay = dotenv_overlay(&self.context.root)?;
        let setup = if number == 1 && self.config.setup {
            self.run_setup(&overlay)?
        } else {
            None
        };

        let execution = execute(
            &self.runner,
            &self.context,
            &overlay,
            self.config.run_timeout(),
            self.config.output_limit_bytes,
        )?;
        let tests = run_tests_after(
            &self.runner,
            &self.context,
            &overlay,
            &execution,
            &self.config,
        )?;

        let health = assess(
            setup.as_ref(),
            &execution,
            tests.as_ref(),
            self.config.timeout_means_running,
        );
        let clean = health.clean();
        let fixes = if clean {
            Vec::new()
        } else {
            let exhausted = self.exhausted();
            fix_errors(
                &self.runner,
                &self.oracle,
                &self.context,
                &self.config,
                &mut self.backups,
                &health.errors,
                &exhausted,
            )?
        };
        for fix in fixes.iter().filter(|f| f.attempted()) {
            *self.attempts.entry(fix.error_signature.clone()).or_insert(0) += 1;
        }

        Ok(CycleRecord {
            cycle: number,
            setup,
            execution,
            tests,
            status: cycle_status(clean, &fixes, self.config.auto_fix),
            errors: health.errors,
            fixes,
        })
    }

    fn run_setup(
        &self,
        overlay: &BTreeMap<String, String>,
    ) -> Result<Option<ExecutionResult>> {
        let Some(argv) = self.context.install_command.clone() else {
            return Ok(None);
        };
        let request = RunRequest::new(argv, &self.context.root, self.config.setup_timeout())
            .with_env(&self.context.env)
            .with_env(overlay)
            .with_output_limit(self.config.output_limit_bytes);
        let result = self.runner.run(&request).context("run setup")?;
        if !result.succeeded() {
            warn!(exit_code = result.exit_code, "setup failed");
        }
        Ok(Some(result))
    }

    /// Signatures whose attempts reached the per-error limit.
    fn exhausted(&self) -> HashSet<String> {
        self.attempts
            .iter()
            .filter(|(_, n)| **n >= self.config.max_fix_attempts_per_error)
            .map(|(signature, _)| signature.clone())
            .collect()
    }

    fn log_cycle(&self, record: &CycleRecord) {
        if let Some(paths) = &self.paths
            && let Err(err) = write_cycle(paths, record)
        {
            warn!(err = %format!("{err:#}"), "failed to write cycle log");
        }
    }

    fn finish(
        &self,
        status: LoopStatus,
        stop_reason: String,
        failure: Option<&str>,
    ) -> VerificationReport {
        let stats = compute_stats(&self.cycles);
        let report = VerificationReport {
            session_id: self.id.clone(),
            project: self.context.root.clone(),
            project_type: self.context.project_type,
            status,
            stop_reason,
            trend: (status != LoopStatus::Success).then(|| trend(&stats.error_history)),
            recommendations: recommendations(status, &self.cycles, &stats, failure),
            cycles: self.cycles.clone(),
            stats,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        info!(status = status.as_str(), cycles = report.cycle_count(), "verification finished");
        if let Some(paths) = &self.paths
            && let Err(err) = write_report(paths, &report)
        {
            warn!(err = %format!("{err:#}"), "failed to write session report");
        }
        report
    }
}
