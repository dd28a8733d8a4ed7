//! Orchestration for `fixloop analyze`: classify supplied text or a fresh
//! run of a project.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::core::classifier::{category_counts, classify};
use crate::core::diagnosis::{ErrorCategory, ErrorEntry};
use crate::core::health::assess;
use crate::io::executor::CommandRunner;
use crate::io::inspector::{InspectOptions, inspect};
use crate::io::test_runner::run_tests_after;
use crate::run::{RunOptions, dotenv_overlay, execute, project_config};

pub enum AnalyzeInput<'a> {
    /// Raw output to classify; nothing is executed.
    Text(&'a str),
    /// Run the project (no setup) and its tests, then classify.
    Project { path: &'a Path, options: RunOptions },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub entries: Vec<ErrorEntry>,
    pub counts: BTreeMap<ErrorCategory, usize>,
}

impl Analysis {
    fn new(entries: Vec<ErrorEntry>) -> Self {
        Self {
            counts: category_counts(&entries),
            entries,
        }
    }
}

pub fn analyze_errors<R: CommandRunner>(runner: &R, input: AnalyzeInput<'_>) -> Result<Analysis> {
    match input {
        AnalyzeInput::Text(text) => Ok(Analysis::new(classify(text))),
        AnalyzeInput::Project { path, options } => {
            let context = inspect(
                path,
                &InspectOptions {
                    run_command: options.run_command.clone(),
                    test_command: None,
                },
            )?;
            let config = project_config(&context)?;
            let overlay = dotenv_overlay(&context.root)?;
            let execution = execute(
                runner,
                &context,
                &overlay,
                options.timeout.unwrap_or_else(|| config.run_timeout()),
                config.output_limit_bytes,
            )?;
            let tests = run_tests_after(runner, &context, &overlay, &execution, &config)?;
            let health = assess(
                None,
                &execution,
                tests.as_ref(),
                config.timeout_means_running,
            );
            Ok(Analysis::new(health.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, TestProject, failure, success};

    #[test]
    fn text_input_runs_nothing() {
        let runner = ScriptedRunner::new();
        let analysis = analyze_errors(
            &runner,
            AnalyzeInput::Text(
                "Traceback (most recent call last):\n  File \"app.py\", line 3, in <module>\n    import flask\nModuleNotFoundError: No module named 'flask'\n",
            ),
        )
        .expect("analyze");
        assert_eq!(analysis.entries.len(), 1);
        assert_eq!(analysis.entries[0].category, ErrorCategory::Dependency);
        assert_eq!(analysis.counts.get(&ErrorCategory::Dependency), Some(&1));
        assert!(runner.calls().is_empty());
    }

    fn project_with_tests() -> TestProject {
        TestProject::new()
            .file("main.py", "print('hi')\n")
            .file("tests/test_main.py", "def test_x():\n    assert 1 == 2\n")
            .file("requirements.txt", "requests\n")
    }

    fn analyze_project(runner: &ScriptedRunner, project: &TestProject) -> Analysis {
        analyze_errors(
            runner,
            AnalyzeInput::Project {
                path: project.path(),
                options: RunOptions::default(),
            },
        )
        .expect("analyze")
    }

    #[test]
    fn project_input_classifies_test_failures() {
        let project = project_with_tests();
        let runner = ScriptedRunner::new()
            .on("python main.py", success("hi\n"))
            .on(
                "python -m pytest --tb=short",
                failure(
                    1,
                    "FAILED tests/test_main.py::test_x - assert 1 == 2\n1 failed in 0.01s\n",
                ),
            );
        let analysis = analyze_project(&runner, &project);
        assert_eq!(analysis.counts.get(&ErrorCategory::Logic), Some(&1));
        // Analysis never installs dependencies.
        assert!(!runner.command_lines().iter().any(|c| c.starts_with("pip")));
    }

    #[test]
    fn crashed_run_is_classified_without_tests() {
        let project = project_with_tests();
        let runner = ScriptedRunner::new()
            .on("python main.py", failure(1, "NameError: name 'cfg' is not defined"));
        let analysis = analyze_project(&runner, &project);
        assert_eq!(analysis.counts.get(&ErrorCategory::Runtime), Some(&1));
        assert_eq!(analysis.entries.len(), 1);
        assert_eq!(runner.command_lines(), vec!["python main.py".to_string()]);
    }

    #[test]
    fn healthy_project_has_no_entries() {
        let project = TestProject::new().file("main.py", "print('hi')\n");
        let runner = ScriptedRunner::new().on("python main.py", success("hi\n"));
        let analysis = analyze_errors(
            &runner,
            AnalyzeInput::Project {
                path: project.path(),
                options: RunOptions::default(),
            },
        )
        .expect("analyze");
        assert!(analysis.entries.is_empty());
        assert!(analysis.counts.is_empty());
    }
}
