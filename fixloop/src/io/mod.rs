//! I/O helpers for fixloop operations.

pub mod applier;
pub mod backup;
pub mod config;
pub mod executor;
pub mod inspector;
pub mod oracle;
pub mod process;
pub mod rules;
pub mod session_log;
pub mod test_runner;
