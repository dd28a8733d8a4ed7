//! Test-only doubles: scripted command runner, scripted oracle and
//! temporary project trees.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::diagnosis::{ErrorCategory, ErrorEntry};
use crate::core::fix::Fix;
use crate::core::types::{ExecutionResult, ProjectContext};
use crate::io::executor::{CommandRunner, RunRequest};
use crate::io::oracle::{FixOracle, Proposal};

/// Successful result with the given stdout.
pub fn success(stdout: &str) -> ExecutionResult {
    result(0, stdout, "")
}

/// Failed result with the given exit code and stderr.
pub fn failure(exit_code: i32, stderr: &str) -> ExecutionResult {
    result(exit_code, "", stderr)
}

/// Process killed at the timeout after printing `stdout`.
pub fn timed_out(stdout: &str) -> ExecutionResult {
    ExecutionResult {
        timed_out: true,
        ..result(-1, stdout, "")
    }
}

fn result(exit_code: i32, stdout: &str, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        command: String::new(),
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms: 1,
        timed_out: false,
        truncated: false,
        stdout_truncated_bytes: 0,
        stderr_truncated_bytes: 0,
        warnings: Vec::new(),
    }
}

/// Runner returning queued results keyed by command line.
///
/// Each command pops its queue; the last queued result repeats. Commands
/// with no script succeed with empty output. Every request is recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: RefCell<BTreeMap<String, VecDeque<ExecutionResult>>>,
    calls: RefCell<Vec<RunRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `result` for `command_line` (argv joined with spaces).
    pub fn on(self, command_line: &str, result: ExecutionResult) -> Self {
        self.scripts
            .borrow_mut()
            .entry(command_line.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<RunRequest> {
        self.calls.borrow().clone()
    }

    /// Command lines in call order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(RunRequest::command_line).collect()
    }

    pub fn count(&self, command_line: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.command_line() == command_line)
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &RunRequest) -> Result<ExecutionResult> {
        self.calls.borrow_mut().push(request.clone());
        let command = request.command_line();
        let mut scripts = self.scripts.borrow_mut();
        let next = match scripts.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let mut result = next.unwrap_or_else(|| success(""));
        result.command = command;
        Ok(result)
    }
}

/// Oracle proposing fixed fixes per error category.
#[derive(Default)]
pub struct ScriptedOracle {
    fixes: BTreeMap<ErrorCategory, Vec<Fix>>,
    fail: bool,
    consulted: RefCell<Vec<String>>,
    consults: Cell<usize>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: ErrorCategory, fixes: Vec<Fix>) -> Self {
        self.fixes.insert(category, fixes);
        self
    }

    /// Every consultation returns an error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn consults(&self) -> usize {
        self.consults.get()
    }

    /// Signatures in consultation order.
    pub fn consulted(&self) -> Vec<String> {
        self.consulted.borrow().clone()
    }
}

impl FixOracle for ScriptedOracle {
    fn propose_fix(&self, error: &ErrorEntry, _context: &ProjectContext) -> Result<Proposal> {
        self.consults.set(self.consults.get() + 1);
        self.consulted.borrow_mut().push(error.signature.clone());
        if self.fail {
            return Err(anyhow!("scripted oracle failure"));
        }
        let fixes = self.fixes.get(&error.category).cloned().unwrap_or_default();
        Ok(Proposal::new(
            format!("scripted {} proposal", error.category),
            fixes,
        ))
    }
}

/// Temporary project directory, removed on drop.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn file(self, relative: &str, contents: &str) -> Self {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write project file");
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.join(relative)).expect("read project file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.join(relative).exists()
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
