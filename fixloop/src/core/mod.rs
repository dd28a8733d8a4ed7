//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod diagnosis;
pub mod dotenv;
pub mod fix;
pub mod health;
pub mod progress;
pub mod report;
pub mod test_parser;
pub mod types;
