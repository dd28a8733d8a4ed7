//! Command runner abstraction for project processes.
//!
//! The [`CommandRunner`] trait decouples the loop, the applier and the test
//! runner from real process spawning. Tests use scripted runners that return
//! predetermined results without spawning anything.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::types::ExecutionResult;
use crate::io::process::run_command_with_timeout;

/// Exit code reported when the program could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when the program could not be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Parameters for one process execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Per-stream bound on captured output.
    pub output_limit_bytes: usize,
    /// Bytes written to the child's stdin.
    pub stdin: Option<Vec<u8>>,
}

impl RunRequest {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            workdir: workdir.into(),
            env: BTreeMap::new(),
            timeout,
            output_limit_bytes: 100_000,
            stdin: None,
        }
    }

    /// Run a shell string through the platform shell.
    pub fn shell(command: &str, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new(shell_argv(command), workdir, timeout)
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_output_limit(mut self, output_limit_bytes: usize) -> Self {
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Command line as recorded in results and used as the scripted-runner key.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Argument vector running `command` through `sh -c` (`cmd /C` on Windows).
pub fn shell_argv(command: &str) -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string(), command.to_string()]
    } else {
        vec!["sh".to_string(), "-c".to_string(), command.to_string()]
    }
}

/// Abstraction over process execution.
///
/// Timeouts and nonzero exits are values in the returned [`ExecutionResult`].
/// `Err` is reserved for infrastructure failures (pipes, threads, waits).
pub trait CommandRunner {
    fn run(&self, request: &RunRequest) -> Result<ExecutionResult>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, request: &RunRequest) -> Result<ExecutionResult> {
        (**self).run(request)
    }
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(command = %request.command_line(), timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &RunRequest) -> Result<ExecutionResult> {
        let command_line = request.command_line();
        let Some((program, args)) = request.argv.split_first() else {
            return Ok(spawn_failure(command_line, "", EXIT_NOT_FOUND, "empty command"));
        };
        info!(workdir = %request.workdir.display(), "running command");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir).envs(&request.env);

        let started = Instant::now();
        let output = match run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                // Spawn failures are results so they can be classified.
                if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
                    let code = match io_err.kind() {
                        ErrorKind::NotFound => Some(EXIT_NOT_FOUND),
                        ErrorKind::PermissionDenied => Some(EXIT_NOT_EXECUTABLE),
                        _ => None,
                    };
                    if let Some(code) = code {
                        warn!(program = %program, code, "command could not be started");
                        let reason = if code == EXIT_NOT_FOUND {
                            "command not found".to_string()
                        } else {
                            format!("Permission denied ({io_err})")
                        };
                        return Ok(spawn_failure(command_line, program, code, &reason));
                    }
                }
                return Err(err);
            }
        };

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&output.stdout_truncated_notice());
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.push_str(&output.stderr_truncated_notice());

        let exit_code = if output.timed_out {
            -1
        } else {
            output.status.code().unwrap_or(-1)
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(exit_code, duration_ms, timed_out = output.timed_out, "command result");

        Ok(ExecutionResult {
            command: command_line,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            timed_out: output.timed_out,
            truncated: output.stdout_truncated > 0 || output.stderr_truncated > 0,
            stdout_truncated_bytes: output.stdout_truncated,
            stderr_truncated_bytes: output.stderr_truncated,
            warnings: output.warnings,
        })
    }
}

fn spawn_failure(command: String, program: &str, exit_code: i32, reason: &str) -> ExecutionResult {
    ExecutionResult {
        command,
        exit_code,
        stdout: String::new(),
        stderr: format!("{program}: {reason}\n"),
        duration_ms: 0,
        timed_out: false,
        truncated: false,
        stdout_truncated_bytes: 0,
        stderr_truncated_bytes: 0,
        warnings: Vec::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_exit_127_not_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = RunRequest::new(
            vec!["definitely-not-a-real-binary-xyz".to_string()],
            temp.path(),
            Duration::from_secs(5),
        );
        let result = SystemRunner.run(&request).expect("run");
        assert_eq!(result.exit_code, EXIT_NOT_FOUND);
        assert_eq!(
            result.stderr,
            "definitely-not-a-real-binary-xyz: command not found\n"
        );
    }

    #[test]
    fn timeout_is_reported_as_value() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = RunRequest::shell("echo started; sleep 30", temp.path(), Duration::from_millis(300));
        let result = SystemRunner.run(&request).expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stdout, "started\n");
        assert!(!result.succeeded());
    }

    #[test]
    fn env_and_workdir_are_applied() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut env = BTreeMap::new();
        env.insert("FIXLOOP_MARKER".to_string(), "42".to_string());
        let request = RunRequest::shell("echo $FIXLOOP_MARKER; ls", temp.path(), Duration::from_secs(5))
            .with_env(&env);
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let result = SystemRunner.run(&request).expect("run");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "42\nmarker.txt\n");
    }

    #[test]
    fn truncation_is_marked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = RunRequest::shell("printf '0123456789'", temp.path(), Duration::from_secs(5))
            .with_output_limit(5);
        let result = SystemRunner.run(&request).expect("run");
        assert!(result.truncated);
        assert_eq!(result.stdout_truncated_bytes, 5);
        assert_eq!(result.stdout, "01234\n[stdout truncated 5 bytes]\n");
    }
}
