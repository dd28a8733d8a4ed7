//! Execution-verification-autofix loop for failing projects.
//!
//! The crate runs a project, runs its tests, classifies failures, asks a fix
//! oracle for candidate remedies, applies them with backups and rollback, and
//! repeats until the project is healthy or a stop condition fires. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, test-output
//!   parsing, fix policy, stop conditions, report assembly). No I/O.
//! - **[`io`]**: Side-effecting operations (process execution, project
//!   inspection, backups, fix application, oracles, session logs).
//!
//! Orchestration modules ([`run`], [`testing`], [`analyze`], [`fix`], [`verify`])
//! coordinate core logic with I/O to implement the exposed operations.

pub mod analyze;
pub mod core;
pub mod exit_codes;
pub mod fix;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod testing;
pub mod verify;
