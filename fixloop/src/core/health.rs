//! Judge one cycle's run and test results and collect its errors.

use std::collections::HashSet;

use crate::core::classifier::classify;
use crate::core::diagnosis::{ErrorCategory, ErrorEntry, Severity};
use crate::core::types::{ExecutionResult, TestOutcome};

/// Verdict for one execute (+ setup, + tests) pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub run_ok: bool,
    pub tests_ok: bool,
    /// Empty when the cycle is clean.
    pub errors: Vec<ErrorEntry>,
}

impl Health {
    pub fn clean(&self) -> bool {
        self.run_ok && self.tests_ok
    }
}

/// Classify a cycle.
///
/// A run that timed out without error-severity entries counts as a healthy
/// long-running process when `timeout_means_running` is set. Failing steps
/// that yield no classified entry get one synthesized entry so every failure
/// is explainable. Entries are deduplicated by signature in output order.
pub fn assess(
    setup: Option<&ExecutionResult>,
    execution: &ExecutionResult,
    tests: Option<&TestOutcome>,
    timeout_means_running: bool,
) -> Health {
    let mut errors = Vec::new();

    let run_ok = run_is_healthy(execution, timeout_means_running);
    if !run_ok {
        let run_errors = classify(&execution.combined_output());
        if run_errors.is_empty() {
            errors.push(synthesized_run_error(execution));
        }
        errors.extend(run_errors);
    }

    let tests_ok = match tests {
        Some(outcome) if !outcome.all_passed() => {
            let test_errors = classify(&outcome.output);
            if test_errors.is_empty() {
                errors.push(synthesized_test_error(outcome));
            }
            errors.extend(test_errors);
            false
        }
        _ => true,
    };

    if run_ok && tests_ok {
        return Health {
            run_ok,
            tests_ok,
            errors: Vec::new(),
        };
    }

    if let Some(setup) = setup.filter(|s| !s.succeeded()) {
        let mut setup_errors = classify(&setup.combined_output());
        setup_errors.append(&mut errors);
        errors = setup_errors;
    }

    Health {
        run_ok,
        tests_ok,
        errors: dedupe(errors),
    }
}

/// Whether a run is healthy enough for its tests to mean anything.
///
/// A clean exit qualifies, and so does a timeout without error-severity
/// entries when `timeout_means_running` is set.
pub fn run_is_healthy(execution: &ExecutionResult, timeout_means_running: bool) -> bool {
    if execution.succeeded() {
        return true;
    }
    execution.timed_out
        && timeout_means_running
        && !classify(&execution.combined_output())
            .iter()
            .any(|e| e.severity == Severity::Error)
}

fn synthesized_run_error(execution: &ExecutionResult) -> ErrorEntry {
    if execution.timed_out {
        ErrorEntry::new(
            ErrorCategory::Timeout,
            format!("{} timed out after {} ms", execution.command, execution.duration_ms),
        )
    } else {
        ErrorEntry::new(
            ErrorCategory::Unknown,
            format!("{} exited with code {}", execution.command, execution.exit_code),
        )
    }
}

fn synthesized_test_error(outcome: &TestOutcome) -> ErrorEntry {
    if outcome.timed_out {
        return ErrorEntry::new(
            ErrorCategory::Timeout,
            format!("{} timed out after {} ms", outcome.command, outcome.duration_ms),
        );
    }
    let message = match outcome.failing.first() {
        Some(first) if outcome.failed > 0 => {
            format!("{} test(s) failed, first: {}", outcome.failed, first.id)
        }
        _ if outcome.failed > 0 => format!("{} test(s) failed", outcome.failed),
        _ => format!("{} exited with code {}", outcome.command, outcome.exit_code),
    };
    ErrorEntry::new(ErrorCategory::Logic, message)
}

fn dedupe(entries: Vec<ErrorEntry>) -> Vec<ErrorEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.signature.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailingTest, TestFramework};

    fn execution(exit_code: i32, stderr: &str, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            command: "python app.py".to_string(),
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 5,
            timed_out,
            truncated: false,
            stdout_truncated_bytes: 0,
            stderr_truncated_bytes: 0,
            warnings: Vec::new(),
        }
    }

    fn tests(failed: u32, output: &str) -> TestOutcome {
        TestOutcome {
            framework: TestFramework::Pytest,
            command: "python -m pytest --tb=short".to_string(),
            total: 2,
            passed: 2 - failed,
            failed,
            skipped: 0,
            failing: (0..failed)
                .map(|i| FailingTest {
                    id: format!("tests/test_app.py::test_{i}"),
                    message: None,
                })
                .collect(),
            pass_rate: 0.0,
            duration_ms: 3,
            exit_code: i32::from(failed > 0),
            timed_out: false,
            parse_failed: false,
            output: output.to_string(),
        }
    }

    #[test]
    fn timed_out_server_without_errors_is_healthy() {
        let mut run = execution(-1, "", true);
        run.stdout = " * Running on http://127.0.0.1:5000\n".to_string();
        let health = assess(None, &run, None, true);
        assert!(health.clean());
        assert!(health.errors.is_empty());

        let health = assess(None, &run, None, false);
        assert!(!health.clean());
        assert_eq!(health.errors[0].category, ErrorCategory::Timeout);
    }

    #[test]
    fn run_health_gates_on_exit_and_timeout() {
        assert!(run_is_healthy(&execution(0, "", false), true));
        assert!(!run_is_healthy(&execution(1, "ModuleNotFoundError: No module named 'x'", false), true));
        assert!(run_is_healthy(&execution(-1, "", true), true));
        assert!(!run_is_healthy(&execution(-1, "", true), false));
        assert!(!run_is_healthy(&execution(-1, "TypeError: x is not a function", true), true));
    }

    #[test]
    fn timed_out_run_with_errors_fails() {
        let run = execution(-1, "Error: listen EADDRINUSE: address already in use :::3000", true);
        let health = assess(None, &run, None, true);
        assert!(!health.run_ok);
        assert_eq!(health.errors[0].category, ErrorCategory::Port);
    }

    #[test]
    fn silent_failures_are_synthesized() {
        let health = assess(None, &execution(3, "", false), None, true);
        assert_eq!(health.errors.len(), 1);
        assert_eq!(health.errors[0].category, ErrorCategory::Unknown);

        let health = assess(None, &execution(0, "", false), Some(&tests(1, "")), true);
        assert!(health.run_ok);
        assert!(!health.tests_ok);
        assert_eq!(health.errors[0].category, ErrorCategory::Logic);
        assert!(health.errors[0].message.contains("test_0"));
    }

    #[test]
    fn failed_setup_errors_come_first() {
        let setup = ExecutionResult {
            command: "pip install -r requirements.txt".to_string(),
            ..execution(1, "ERROR: No matching distribution found for flaskk", false)
        };
        let run = execution(1, "ModuleNotFoundError: No module named 'flask'", false);
        let health = assess(Some(&setup), &run, None, true);
        let categories: Vec<_> = health.errors.iter().map(|e| e.category).collect();
        assert_eq!(categories, vec![ErrorCategory::Dependency, ErrorCategory::Dependency]);
        assert!(health.errors[0].message.contains("flaskk"));
    }

    #[test]
    fn clean_cycle_ignores_setup_noise() {
        let setup = execution(1, "npm ERR! peer dep warning", false);
        let health = assess(Some(&setup), &execution(0, "", false), Some(&tests(0, "")), true);
        assert!(health.clean());
        assert!(health.errors.is_empty());
    }

    #[test]
    fn run_and_test_duplicates_collapse() {
        let output = "ModuleNotFoundError: No module named 'flask'";
        let health = assess(None, &execution(1, output, false), Some(&tests(1, output)), true);
        assert_eq!(health.errors.len(), 1);
    }
}
