//! Orchestration for `fixloop test`: inspect a project and run its tests.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::core::types::TestOutcome;
use crate::io::executor::CommandRunner;
use crate::io::inspector::{InspectOptions, inspect};
use crate::io::test_runner::run_tests;
use crate::run::{dotenv_overlay, project_config};

#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    /// Replaces the detected test command.
    pub test_command: Option<Vec<String>>,
    pub timeout: Option<Duration>,
}

/// Run the project's tests once. `None` when no test command exists.
pub fn test_project<R: CommandRunner>(
    runner: &R,
    path: &Path,
    options: &TestOptions,
) -> Result<Option<TestOutcome>> {
    let context = inspect(
        path,
        &InspectOptions {
            run_command: None,
            test_command: options.test_command.clone(),
        },
    )?;
    let config = project_config(&context)?;
    let overlay = dotenv_overlay(&context.root)?;
    run_tests(
        runner,
        &context,
        &overlay,
        options.timeout.unwrap_or_else(|| config.test_timeout()),
        config.output_limit_bytes,
    )
}
