//! Stable exit codes for fixloop CLI commands.

use crate::core::report::LoopStatus;

/// Command succeeded or verification reached `success`.
pub const OK: i32 = 0;
/// Command failed due to an invalid path/config or an internal error.
pub const INVALID: i32 = 1;
/// Verification ended without success (failed, max cycles, needs manual work).
pub const UNRESOLVED: i32 = 2;
/// Verification detected a stuck loop.
pub const STUCK: i32 = 3;

/// Map a terminal verification status to a process exit code.
pub fn for_status(status: LoopStatus) -> i32 {
    match status {
        LoopStatus::Success => OK,
        LoopStatus::StuckInLoop => STUCK,
        LoopStatus::Failed => INVALID,
        LoopStatus::MaxCyclesReached | LoopStatus::NeedsManualIntervention => UNRESOLVED,
        LoopStatus::Running => INVALID,
    }
}
