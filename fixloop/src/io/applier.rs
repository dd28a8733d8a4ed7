//! Fix application with backups, post-apply validation and rollback.
//!
//! The applier is the only component that writes project files. Command
//! fixes are judged by their exit code (plus an importability check for
//! named installs); file fixes are snapshotted, written, validated and
//! restored byte-for-byte when validation fails.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::dotenv;
use crate::core::fix::{
    ApplyMode, BackupHandle, Fix, FixAction, FixApplication, apply_mode, validate_fix,
};
use crate::core::types::ProjectContext;
use crate::io::backup::BackupStore;
use crate::io::executor::{CommandRunner, EXIT_NOT_FOUND, RunRequest};

/// Policy and limits for one application.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub confidence_threshold: f64,
    pub auto_apply: bool,
    /// Timeout for command fixes and validation commands.
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Apply (or only suggest) `fix` for the error with `signature`.
///
/// Fix failures are returned as unsuccessful records. `Err` means the
/// applier itself could not work (backup dir unwritable, runner failure).
#[instrument(skip_all, fields(signature = %signature, kind = fix.kind().as_str(), confidence = fix.confidence))]
pub fn apply<R: CommandRunner>(
    runner: &R,
    backups: &mut BackupStore,
    context: &ProjectContext,
    fix: &Fix,
    signature: &str,
    options: &ApplyOptions,
) -> Result<FixApplication> {
    let mode = apply_mode(fix.confidence, options.confidence_threshold, options.auto_apply);
    let record = |success: bool, message: String| FixApplication {
        timestamp: Utc::now(),
        error_signature: signature.to_string(),
        fix: fix.clone(),
        mode,
        success,
        message,
        backup: None,
        rolled_back: false,
    };

    if mode == ApplyMode::SuggestedOnly {
        let message = if options.auto_apply {
            format!(
                "suggested only: confidence {:.2} below threshold {:.2}",
                fix.confidence, options.confidence_threshold
            )
        } else {
            "suggested only: automatic fixing is disabled".to_string()
        };
        info!("fix suggested");
        return Ok(record(false, message));
    }
    if let Err(invalid) = validate_fix(fix) {
        warn!(reason = %invalid.reason, "fix rejected");
        return Ok(record(false, invalid.to_string()));
    }

    let applied = match &fix.action {
        FixAction::InstallDependency { command, package } => {
            let outcome = match (run_fix_command(runner, context, command, options)?, package) {
                (Ok(()), Some(package)) => {
                    check_installed(runner, context, command, package, options)?
                }
                (outcome, _) => outcome,
            };
            outcome.map(|()| format!("ran {command}"))
        }
        FixAction::RunCommand { command } => {
            run_fix_command(runner, context, command, options)?.map(|()| format!("ran {command}"))
        }
        FixAction::PatchFile { .. } | FixAction::CreateFile { .. } | FixAction::ConfigChange { .. } => {
            let file = apply_file_fix(runner, backups, context, &fix.action, options)?;
            let mut application = match file.outcome {
                Ok(message) => record(true, message),
                Err(message) => record(false, message),
            };
            application.backup = file.backup;
            application.rolled_back = file.rolled_back;
            log_result(&application);
            return Ok(application);
        }
    };

    let application = match applied {
        Ok(message) => record(true, message),
        Err(message) => record(false, message),
    };
    log_result(&application);
    Ok(application)
}

fn log_result(application: &FixApplication) {
    if application.success {
        info!(mode = ?application.mode, "fix applied");
    } else {
        warn!(message = %application.message, rolled_back = application.rolled_back, "fix failed");
    }
}

/// Inner result: `Err(message)` is a failed fix, not an applier error.
type FixOutcome<T> = std::result::Result<T, String>;

fn run_fix_command<R: CommandRunner>(
    runner: &R,
    context: &ProjectContext,
    command: &str,
    options: &ApplyOptions,
) -> Result<FixOutcome<()>> {
    let request = RunRequest::shell(command, &context.root, options.command_timeout)
        .with_env(&context.env)
        .with_output_limit(options.output_limit_bytes);
    let result = runner.run(&request).with_context(|| format!("run fix command {command}"))?;
    if result.timed_out {
        return Ok(Err(format!(
            "{command} timed out after {}s",
            options.command_timeout.as_secs()
        )));
    }
    if result.exit_code != 0 {
        return Ok(Err(format!(
            "{command} exited with {}: {}",
            result.exit_code,
            tail(&result.combined_output(), 400)
        )));
    }
    Ok(Ok(()))
}

/// After an install succeeds, check the package is really usable.
fn check_installed<R: CommandRunner>(
    runner: &R,
    context: &ProjectContext,
    command: &str,
    package: &str,
    options: &ApplyOptions,
) -> Result<FixOutcome<()>> {
    let tool = command.split_whitespace().next().unwrap_or_default();
    if tool.starts_with("pip") {
        let argv = vec![
            "python".to_string(),
            "-c".to_string(),
            format!("import {package}"),
        ];
        let request = RunRequest::new(argv, &context.root, options.command_timeout)
            .with_env(&context.env)
            .with_output_limit(options.output_limit_bytes);
        let result = runner.run(&request).context("run import check")?;
        if result.exit_code == EXIT_NOT_FOUND {
            return Ok(Ok(()));
        }
        if !result.succeeded() {
            return Ok(Err(format!(
                "{command} succeeded but {package} is not importable: {}",
                tail(&result.stderr, 400)
            )));
        }
    } else if tool == "npm" && !context.root.join("node_modules").join(package).exists() {
        return Ok(Err(format!(
            "{command} succeeded but node_modules/{package} is missing"
        )));
    }
    Ok(Ok(()))
}

struct FileFixResult {
    outcome: FixOutcome<String>,
    backup: Option<BackupHandle>,
    rolled_back: bool,
}

impl FileFixResult {
    fn refused(message: String) -> Self {
        Self {
            outcome: Err(message),
            backup: None,
            rolled_back: false,
        }
    }
}

fn apply_file_fix<R: CommandRunner>(
    runner: &R,
    backups: &mut BackupStore,
    context: &ProjectContext,
    action: &FixAction,
    options: &ApplyOptions,
) -> Result<FileFixResult> {
    let Some(relative) = action.target_path() else {
        return Ok(FileFixResult::refused("fix has no target path".to_string()));
    };
    let target = context.root.join(relative);
    if let Err(message) = ensure_inside(&context.root, &target) {
        return Ok(FileFixResult::refused(message));
    }

    let current = match fs::read(&target) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("read {}", target.display())),
    };
    let contents = match action {
        FixAction::PatchFile { old, new, .. } => {
            let Some(bytes) = current else {
                return Ok(FileFixResult::refused(format!("{relative} does not exist")));
            };
            let Ok(text) = String::from_utf8(bytes) else {
                return Ok(FileFixResult::refused(format!("{relative} is not valid UTF-8")));
            };
            if !text.contains(old.as_str()) {
                return Ok(FileFixResult::refused(format!(
                    "search text not found in {relative}"
                )));
            }
            text.replacen(old.as_str(), new, 1)
        }
        FixAction::CreateFile { contents, .. } => contents.clone(),
        FixAction::ConfigChange { key, value, .. } => {
            let Ok(existing) = current.map(String::from_utf8).transpose() else {
                return Ok(FileFixResult::refused(format!("{relative} is not valid UTF-8")));
            };
            dotenv::set(&existing.unwrap_or_default(), key, value)
        }
        FixAction::InstallDependency { .. } | FixAction::RunCommand { .. } => {
            return Ok(FileFixResult::refused("not a file fix".to_string()));
        }
    };

    let handle = backups.snapshot(relative)?;
    if let Err(err) = write_file(&target, &contents) {
        backups.restore(&handle)?;
        return Ok(FileFixResult {
            outcome: Err(format!("{err:#}")),
            backup: Some(handle),
            rolled_back: true,
        });
    }

    if let Err(message) = validate_file(runner, context, relative, &contents, options)? {
        backups.restore(&handle)?;
        return Ok(FileFixResult {
            outcome: Err(format!("validation failed, rolled back: {message}")),
            backup: Some(handle),
            rolled_back: true,
        });
    }

    let verb = match action {
        FixAction::PatchFile { .. } => "patched",
        FixAction::CreateFile { .. } => "wrote",
        _ => "updated",
    };
    Ok(FileFixResult {
        outcome: Ok(format!("{verb} {relative}")),
        backup: Some(handle),
        rolled_back: false,
    })
}

fn write_file(target: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(target, contents).with_context(|| format!("write {}", target.display()))
}

/// Reject targets that resolve outside the root through symlinks.
fn ensure_inside(root: &Path, target: &Path) -> FixOutcome<()> {
    let mut existing: PathBuf = target.to_path_buf();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent.to_path_buf(),
            None => return Ok(()),
        }
    }
    let resolved = existing
        .canonicalize()
        .map_err(|err| format!("resolve {}: {err}", existing.display()))?;
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if resolved.starts_with(&root) {
        Ok(())
    } else {
        Err(format!("{} resolves outside the project root", target.display()))
    }
}

/// Syntax-check the written file. Missing checkers skip validation.
fn validate_file<R: CommandRunner>(
    runner: &R,
    context: &ProjectContext,
    relative: &str,
    contents: &str,
    options: &ApplyOptions,
) -> Result<FixOutcome<()>> {
    let extension = Path::new(relative)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    let argv = match extension {
        "py" => vec!["python", "-m", "py_compile", relative],
        "js" | "mjs" | "cjs" => vec!["node", "--check", relative],
        "json" => {
            return Ok(serde_json::from_str::<serde_json::Value>(contents)
                .map(|_| ())
                .map_err(|err| format!("{relative}: {err}")));
        }
        "toml" => {
            return Ok(toml::from_str::<toml::Table>(contents)
                .map(|_| ())
                .map_err(|err| format!("{relative}: {err}")));
        }
        _ => return Ok(Ok(())),
    };
    let argv = argv.into_iter().map(str::to_string).collect();
    let request = RunRequest::new(argv, &context.root, options.command_timeout)
        .with_output_limit(options.output_limit_bytes);
    let result = runner
        .run(&request)
        .with_context(|| format!("validate {relative}"))?;
    if result.exit_code == EXIT_NOT_FOUND || result.succeeded() {
        return Ok(Ok(()));
    }
    Ok(Err(tail(&result.combined_output(), 400)))
}

/// Last `max` bytes of `text`, trimmed, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::inspector::{InspectOptions, inspect};
    use crate::test_support::{ScriptedRunner, TestProject, failure, success};

    fn options() -> ApplyOptions {
        ApplyOptions {
            confidence_threshold: 0.7,
            auto_apply: true,
            command_timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    fn context(project: &TestProject) -> ProjectContext {
        inspect(project.path(), &InspectOptions::default()).expect("inspect")
    }

    fn store(project: &TestProject) -> BackupStore {
        BackupStore::new(&context(project).root, Path::new(".fixloop/backups"))
    }

    fn patch(confidence: f64) -> Fix {
        Fix::new(
            FixAction::PatchFile {
                path: "app.py".to_string(),
                old: "print(1".to_string(),
                new: "print(1)".to_string(),
            },
            confidence,
            "close paren",
        )
    }

    #[test]
    fn sub_threshold_fix_touches_nothing() {
        let project = TestProject::new().file("app.py", "print(1\n");
        let runner = ScriptedRunner::new();
        let mut backups = store(&project);
        let application = apply(
            &runner,
            &mut backups,
            &context(&project),
            &patch(0.4),
            "syntax:abc",
            &options(),
        )
        .expect("apply");

        assert_eq!(application.mode, ApplyMode::SuggestedOnly);
        assert!(!application.success);
        assert!(application.backup.is_none());
        assert_eq!(project.read("app.py"), "print(1\n");
        assert!(!project.exists(".fixloop"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn auto_apply_off_only_suggests() {
        let project = TestProject::new().file("app.py", "print(1\n");
        let runner = ScriptedRunner::new();
        let opts = ApplyOptions {
            auto_apply: false,
            ..options()
        };
        let application = apply(
            &runner,
            &mut store(&project),
            &context(&project),
            &patch(0.99),
            "syntax:abc",
            &opts,
        )
        .expect("apply");
        assert_eq!(application.mode, ApplyMode::SuggestedOnly);
        assert!(application.message.contains("disabled"));
        assert_eq!(project.read("app.py"), "print(1\n");
    }

    #[test]
    fn patch_applies_with_backup_marker() {
        let project = TestProject::new().file("app.py", "print(1\n");
        let runner = ScriptedRunner::new().on("python -m py_compile app.py", success(""));
        let application = apply(
            &runner,
            &mut store(&project),
            &context(&project),
            &patch(0.8),
            "syntax:abc",
            &options(),
        )
        .expect("apply");

        assert!(application.success, "{}", application.message);
        assert_eq!(application.mode, ApplyMode::WithBackup);
        assert!(application.backup.is_some());
        assert_eq!(project.read("app.py"), "print(1)\n");
        assert_eq!(runner.count("python -m py_compile app.py"), 1);
    }

    #[test]
    fn failed_validation_restores_exact_bytes() {
        let original = "def f():\r\n    return print(1\n\u{feff}";
        let project = TestProject::new().file("app.py", original);
        let runner = ScriptedRunner::new().on(
            "python -m py_compile app.py",
            failure(1, "SyntaxError: invalid syntax"),
        );
        let application = apply(
            &runner,
            &mut store(&project),
            &context(&project),
            &patch(0.95),
            "syntax:abc",
            &options(),
        )
        .expect("apply");

        assert!(!application.success);
        assert!(application.rolled_back);
        assert!(application.message.contains("SyntaxError"));
        assert_eq!(fs::read(project.join("app.py")).expect("read"), original.as_bytes());
    }

    #[test]
    fn missing_checker_skips_validation() {
        let project = TestProject::new().file("app.py", "print(1\n");
        let runner = ScriptedRunner::new().on(
            "python -m py_compile app.py",
            failure(EXIT_NOT_FOUND, "python: command not found"),
        );
        let application = apply(
            &runner,
            &mut store(&project),
            &context(&project),
            &patch(0.95),
            "syntax:abc",
            &options(),
        )
        .expect("apply");
        assert!(application.success);
    }

    #[test]
    fn invalid_json_is_rolled_back() {
        let project = TestProject::new().file("settings.json", "{\"a\": 1}\n");
        let fix = Fix::new(
            FixAction::CreateFile {
                path: "settings.json".to_string(),
                contents: "{\"a\": ".to_string(),
            },
            0.95,
            "rewrite settings",
        );
        let application = apply(
            &ScriptedRunner::new(),
            &mut store(&project),
            &context(&project),
            &fix,
            "configuration:abc",
            &options(),
        )
        .expect("apply");
        assert!(application.rolled_back);
        assert_eq!(project.read("settings.json"), "{\"a\": 1}\n");
    }

    #[test]
    fn created_file_is_removed_on_rollback() {
        let project = TestProject::new();
        let fix = Fix::new(
            FixAction::CreateFile {
                path: "config/app.toml".to_string(),
                contents: "port = \n".to_string(),
            },
            0.95,
            "create config",
        );
        let application = apply(
            &ScriptedRunner::new(),
            &mut store(&project),
            &context(&project),
            &fix,
            "configuration:abc",
            &options(),
        )
        .expect("apply");
        assert!(application.rolled_back);
        assert!(!project.exists("config/app.toml"));
    }

    #[test]
    fn config_change_sets_dotenv_key() {
        let project = TestProject::new().file(".env", "DEBUG=1\nPORT=3000\n");
        let fix = Fix::new(
            FixAction::ConfigChange {
                path: ".env".to_string(),
                key: "PORT".to_string(),
                value: "3001".to_string(),
            },
            0.85,
            "change port",
        );
        let application = apply(
            &ScriptedRunner::new(),
            &mut store(&project),
            &context(&project),
            &fix,
            "port:abc",
            &options(),
        )
        .expect("apply");
        assert!(application.success);
        assert_eq!(project.read(".env"), "DEBUG=1\nPORT=3001\n");
    }

    #[test]
    fn patch_without_match_fails_without_backup() {
        let project = TestProject::new().file("app.py", "print(2)\n");
        let application = apply(
            &ScriptedRunner::new(),
            &mut store(&project),
            &context(&project),
            &patch(0.95),
            "syntax:abc",
            &options(),
        )
        .expect("apply");
        assert!(!application.success);
        assert!(application.backup.is_none());
        assert!(application.message.contains("not found"));
    }

    #[test]
    fn non_utf8_targets_are_refused_untouched() {
        let project = TestProject::new().file("app.py", "").file(".env", "");
        let latin1: &[u8] = b"print(1\n# caf\xe9\n";
        std::fs::write(project.join("app.py"), latin1).expect("write");
        std::fs::write(project.join(".env"), b"NAME=caf\xe9\n").expect("write");
        let runner = ScriptedRunner::new();
        let port = Fix::new(
            FixAction::ConfigChange {
                path: ".env".to_string(),
                key: "PORT".to_string(),
                value: "3001".to_string(),
            },
            0.85,
            "change port",
        );

        for fix in [patch(0.95), port] {
            let application = apply(
                &runner,
                &mut store(&project),
                &context(&project),
                &fix,
                "syntax:abc",
                &options(),
            )
            .expect("apply");
            assert!(!application.success);
            assert!(application.backup.is_none());
            assert!(application.message.contains("not valid UTF-8"), "{}", application.message);
        }
        assert_eq!(std::fs::read(project.join("app.py")).expect("read"), latin1);
        assert_eq!(
            std::fs::read(project.join(".env")).expect("read"),
            b"NAME=caf\xe9\n"
        );
        assert!(!project.exists(".fixloop"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn escaping_path_is_rejected() {
        let project = TestProject::new();
        let fix = Fix::new(
            FixAction::CreateFile {
                path: "../outside.txt".to_string(),
                contents: "x".to_string(),
            },
            0.95,
            "escape",
        );
        let application = apply(
            &ScriptedRunner::new(),
            &mut store(&project),
            &context(&project),
            &fix,
            "unknown:abc",
            &options(),
        )
        .expect("apply");
        assert!(!application.success);
        assert!(application.message.starts_with("invalid fix"));
    }

    #[cfg(unix)]
    #[test]
    fn install_is_checked_by_import() {
        let project = TestProject::new().file("app.py", "import flask\n");
        let runner = ScriptedRunner::new()
            .on("sh -c pip install flask", success("Successfully installed flask"))
            .on("python -c import flask", failure(1, "ModuleNotFoundError: No module named 'flask'"));
        let fix = Fix::new(
            FixAction::InstallDependency {
                command: "pip install flask".to_string(),
                package: Some("flask".to_string()),
            },
            0.95,
            "install flask",
        );
        let application = apply(
            &runner,
            &mut store(&project),
            &context(&project),
            &fix,
            "dependency:abc",
            &options(),
        )
        .expect("apply");
        assert!(!application.success);
        assert!(application.message.contains("not importable"));
        assert_eq!(application.mode, ApplyMode::Automatic);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_exit_code() {
        let project = TestProject::new();
        let runner = ScriptedRunner::new().on("sh -c make build", failure(2, "no rule"));
        let fix = Fix::new(
            FixAction::RunCommand {
                command: "make build".to_string(),
            },
            0.9,
            "build",
        );
        let application = apply(
            &runner,
            &mut store(&project),
            &context(&project),
            &fix,
            "runtime:abc",
            &options(),
        )
        .expect("apply");
        assert!(!application.success);
        assert!(application.message.contains("exited with 2"));
    }
}
