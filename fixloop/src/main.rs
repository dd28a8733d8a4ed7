//! Command-line entry point for fixloop.
//!
//! Every command prints its result as JSON on stdout. Diagnostics go to
//! stderr through `RUST_LOG`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use fixloop::analyze::{AnalyzeInput, analyze_errors};
use fixloop::exit_codes;
use fixloop::fix::{FixOptions, fix_issues};
use fixloop::io::executor::SystemRunner;
use fixloop::io::inspector::{InspectOptions, inspect};
use fixloop::io::oracle::{CommandOracle, FallbackOracle, FixOracle};
use fixloop::io::rules::RuleOracle;
use fixloop::logging;
use fixloop::run::{RunOptions, project_config, run_project};
use fixloop::testing::{TestOptions, test_project};
use fixloop::verify::{VerifyOptions, verify_project};

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Run a project, classify its failures and fix them until it works"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the project once.
    Run {
        path: PathBuf,
        /// Run command, split on whitespace (overrides detection).
        #[arg(long = "run")]
        run_command: Option<String>,
        /// Timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run the project's tests once.
    Test {
        path: PathBuf,
        /// Test command, split on whitespace (overrides detection).
        #[arg(long = "test")]
        test_command: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Classify errors from a file (`-` for stdin) or from a fresh project run.
    Analyze {
        path: Option<PathBuf>,
        #[arg(long, conflicts_with = "path")]
        input: Option<PathBuf>,
        #[arg(long = "run")]
        run_command: Option<String>,
    },
    /// Propose and apply one fix per current error.
    Fix {
        path: PathBuf,
        #[arg(long = "run")]
        run_command: Option<String>,
        /// Classify this file (`-` for stdin) instead of running the project.
        #[arg(long)]
        errors: Option<PathBuf>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Only suggest fixes.
        #[arg(long)]
        no_apply: bool,
    },
    /// Loop until the project runs and its tests pass, or a stop condition fires.
    Verify {
        path: PathBuf,
        #[arg(long = "run")]
        run_command: Option<String>,
        #[arg(long = "test")]
        test_command: Option<String>,
        /// Run timeout per cycle in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        max_cycles: Option<u32>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        no_apply: bool,
        #[arg(long)]
        no_tests: bool,
        /// Skip dependency installation before the first cycle.
        #[arg(long)]
        no_setup: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let runner = SystemRunner;
    match cli.command {
        Command::Run {
            path,
            run_command,
            timeout,
        } => {
            let options = RunOptions {
                run_command: split_command(run_command),
                timeout: timeout.map(Duration::from_secs),
            };
            let outcome = run_project(&runner, &path, &options)?;
            print_json(&outcome)?;
            Ok(unresolved_unless(outcome.execution.succeeded()))
        }
        Command::Test {
            path,
            test_command,
            timeout,
        } => {
            let options = TestOptions {
                test_command: split_command(test_command),
                timeout: timeout.map(Duration::from_secs),
            };
            let outcome = test_project(&runner, &path, &options)?;
            print_json(&outcome)?;
            Ok(unresolved_unless(outcome.as_ref().is_none_or(|t| t.all_passed())))
        }
        Command::Analyze {
            path,
            input,
            run_command,
        } => {
            let analysis = match (input, path) {
                (Some(input), _) => {
                    let text = read_input(&input)?;
                    analyze_errors(&runner, AnalyzeInput::Text(&text))?
                }
                (None, Some(path)) => analyze_errors(
                    &runner,
                    AnalyzeInput::Project {
                        path: &path,
                        options: RunOptions {
                            run_command: split_command(run_command),
                            timeout: None,
                        },
                    },
                )?,
                (None, None) => {
                    let text = read_input(Path::new("-"))?;
                    analyze_errors(&runner, AnalyzeInput::Text(&text))?
                }
            };
            print_json(&analysis)?;
            Ok(exit_codes::OK)
        }
        Command::Fix {
            path,
            run_command,
            errors,
            threshold,
            no_apply,
        } => {
            let oracle = build_oracle(&path)?;
            let options = FixOptions {
                run_command: split_command(run_command),
                error_text: errors.as_deref().map(read_input).transpose()?,
                confidence_threshold: threshold,
                auto_apply: no_apply.then_some(false),
            };
            let applications = fix_issues(&runner, &oracle, &path, &options)?;
            print_json(&applications)?;
            Ok(exit_codes::OK)
        }
        Command::Verify {
            path,
            run_command,
            test_command,
            timeout,
            max_cycles,
            threshold,
            no_apply,
            no_tests,
            no_setup,
        } => {
            let oracle = build_oracle(&path)?;
            let options = VerifyOptions {
                run_command: split_command(run_command),
                test_command: split_command(test_command),
                timeout: timeout.map(Duration::from_secs),
                max_cycles,
                auto_apply: no_apply.then_some(false),
                confidence_threshold: threshold,
                run_tests: no_tests.then_some(false),
                setup: no_setup.then_some(false),
            };
            let report = verify_project(runner, oracle, &path, &options)?;
            print_json(&report)?;
            Ok(exit_codes::for_status(report.status))
        }
    }
}

/// Rules only, or an external oracle backed by the rules when configured.
fn build_oracle(path: &Path) -> Result<Box<dyn FixOracle>> {
    let context = inspect(path, &InspectOptions::default())?;
    let config = project_config(&context)?;
    if config.oracle.command.is_empty() {
        return Ok(Box::new(RuleOracle));
    }
    let external = CommandOracle::new(
        SystemRunner,
        config.oracle.command.clone(),
        Duration::from_secs(config.oracle.timeout_secs),
        config.output_limit_bytes,
    );
    Ok(Box::new(FallbackOracle::new(external, RuleOracle)))
}

fn split_command(command: Option<String>) -> Option<Vec<String>> {
    command.map(|c| c.split_whitespace().map(str::to_string).collect())
}

fn unresolved_unless(ok: bool) -> i32 {
    if ok {
        exit_codes::OK
    } else {
        exit_codes::UNRESOLVED
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
