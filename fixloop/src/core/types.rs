//! Shared deterministic types for project execution.
//!
//! These types define stable contracts between components. They do not depend
//! on external state and serialize to stable JSON for callers and session logs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Detected kind of project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Python,
    Node,
    React,
    Nextjs,
    Flask,
    Django,
    Generic,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectType::Python => "python",
            ProjectType::Node => "node",
            ProjectType::React => "react",
            ProjectType::Nextjs => "nextjs",
            ProjectType::Flask => "flask",
            ProjectType::Django => "django",
            ProjectType::Generic => "generic",
        }
    }

    /// Python-family projects share the pip toolchain.
    pub fn is_python(self) -> bool {
        matches!(
            self,
            ProjectType::Python | ProjectType::Flask | ProjectType::Django
        )
    }

    /// Node-family projects share the npm toolchain.
    pub fn is_node(self) -> bool {
        matches!(
            self,
            ProjectType::Node | ProjectType::React | ProjectType::Nextjs
        )
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected test framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestFramework {
    Pytest,
    Jest,
    Mocha,
    Vitest,
    Django,
    None,
}

impl TestFramework {
    pub fn as_str(self) -> &'static str {
        match self {
            TestFramework::Pytest => "pytest",
            TestFramework::Jest => "jest",
            TestFramework::Mocha => "mocha",
            TestFramework::Vitest => "vitest",
            TestFramework::Django => "django",
            TestFramework::None => "none",
        }
    }
}

/// Immutable per-session description of the project under verification.
///
/// Built once by the inspector. A different run command requires a fresh
/// inspection rather than mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Absolute, canonicalized project root.
    pub root: PathBuf,
    pub project_type: ProjectType,
    /// Entry point relative to `root`, when one was found.
    pub entry_point: Option<String>,
    /// Argument vector used to run the project. `None` means the caller must
    /// supply one explicitly.
    pub run_command: Option<Vec<String>>,
    pub test_command: Option<Vec<String>>,
    pub test_framework: TestFramework,
    /// Dependency installation command run before the first cycle.
    pub install_command: Option<Vec<String>>,
    /// Extra environment applied to run and test commands.
    pub env: BTreeMap<String, String>,
    /// Ports the project usually binds.
    pub ports: Vec<u16>,
}

impl ProjectContext {
    /// Render the run command for logs and reports.
    pub fn run_command_line(&self) -> Option<String> {
        self.run_command.as_ref().map(|argv| argv.join(" "))
    }
}

/// Outcome of one process execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Command line as executed (argv joined with spaces).
    pub command: String,
    /// Process exit code. `-1` when killed by timeout or a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// True when any output was dropped because of the output limit. The
    /// dropped byte counts are kept alongside and a marker is appended to the
    /// affected stream.
    pub truncated: bool,
    pub stdout_truncated_bytes: usize,
    pub stderr_truncated_bytes: usize,
    /// Non-fatal problems, e.g. a process group that could not be killed.
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Exit 0 without a timeout.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout and stderr joined for classification.
    pub fn combined_output(&self) -> String {
        let mut buf = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        buf.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') {
            buf.push('\n');
        }
        buf.push_str(&self.stderr);
        buf
    }
}

/// A single failing test with its first failure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingTest {
    pub id: String,
    pub message: Option<String>,
}

/// Normalized outcome of one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub framework: TestFramework,
    pub command: String,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failing: Vec<FailingTest>,
    /// `passed / (total - skipped)`, 0.0 when nothing ran.
    pub pass_rate: f64,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    /// The output did not match the framework's report format.
    pub parse_failed: bool,
    /// Combined stdout/stderr (bounded by the output limit).
    pub output: String,
}

impl TestOutcome {
    pub fn all_passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.failed == 0
    }
}

/// Compute the pass rate over tests that actually ran.
pub fn pass_rate(passed: u32, total: u32, skipped: u32) -> f64 {
    let ran = total.saturating_sub(skipped);
    if ran == 0 {
        return 0.0;
    }
    f64::from(passed) / f64::from(ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_rate_ignores_skipped_tests() {
        assert_eq!(pass_rate(3, 5, 1), 0.75);
        assert_eq!(pass_rate(0, 2, 2), 0.0);
        assert_eq!(pass_rate(0, 0, 0), 0.0);
    }

    #[test]
    fn combined_output_separates_streams() {
        let result = ExecutionResult {
            command: "python app.py".to_string(),
            exit_code: 1,
            stdout: "starting".to_string(),
            stderr: "Traceback".to_string(),
            duration_ms: 3,
            timed_out: false,
            truncated: false,
            stdout_truncated_bytes: 0,
            stderr_truncated_bytes: 0,
            warnings: Vec::new(),
        };
        assert_eq!(result.combined_output(), "starting\nTraceback");
        assert!(!result.succeeded());
    }

    #[test]
    fn project_type_serializes_lowercase() {
        let json = serde_json::to_string(&ProjectType::Nextjs).expect("serialize");
        assert_eq!(json, "\"nextjs\"");
        assert!(ProjectType::Flask.is_python());
        assert!(ProjectType::React.is_node());
        assert!(!ProjectType::Generic.is_python());
    }
}
