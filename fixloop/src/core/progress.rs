//! Stop-condition evaluation over the cycle history.

use std::collections::HashSet;

use crate::core::report::{CycleRecord, CycleStatus, LoopStatus};

/// Limits that bound a verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_cycles: u32,
    /// Consecutive cycles used by the stuck, plateau and manual checks.
    pub stuck_threshold: usize,
    pub auto_fix: bool,
}

/// Reason why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Run succeeded and tests passed.
    Success,
    /// The same signature survived `stuck_threshold` consecutive cycles
    /// without a successful fix.
    SameError { signature: String, cycles: usize },
    /// The error count did not decrease for `stuck_threshold` consecutive cycles.
    NoProgress { cycles: usize },
    /// The error count rose across the last `cycles` cycles.
    Regressing { from: usize, to: usize, cycles: usize },
    /// Every remaining error only received suggestions (or nothing).
    NeedsManual { cycles: usize },
    /// Every error of the latest cycle used up its fix attempts.
    Exhausted { errors: usize },
    MaxCycles { max_cycles: u32 },
}

impl LoopStop {
    pub fn status(&self) -> LoopStatus {
        match self {
            LoopStop::Success => LoopStatus::Success,
            LoopStop::SameError { .. } | LoopStop::NoProgress { .. } => LoopStatus::StuckInLoop,
            LoopStop::Regressing { .. }
            | LoopStop::NeedsManual { .. }
            | LoopStop::Exhausted { .. } => LoopStatus::NeedsManualIntervention,
            LoopStop::MaxCycles { .. } => LoopStatus::MaxCyclesReached,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            LoopStop::Success => "project runs and all tests pass".to_string(),
            LoopStop::SameError { signature, cycles } => {
                format!("error {signature} persisted for {cycles} consecutive cycles")
            }
            LoopStop::NoProgress { cycles } => {
                format!("error count did not decrease for {cycles} consecutive cycles")
            }
            LoopStop::Regressing { from, to, cycles } => {
                format!("error count rose from {from} to {to} over {cycles} cycles")
            }
            LoopStop::Exhausted { errors } => {
                format!("fix attempts exhausted for all {errors} remaining error(s)")
            }
            LoopStop::NeedsManual { cycles } if *cycles <= 1 => {
                "automatic fixing is disabled".to_string()
            }
            LoopStop::NeedsManual { cycles } => {
                format!("no applicable fix for {cycles} consecutive cycles")
            }
            LoopStop::MaxCycles { max_cycles } => format!("reached max_cycles ({max_cycles})"),
        }
    }
}

/// Evaluate stop conditions after the latest cycle was appended.
///
/// Checked in order: success, same error, no progress, regression, auto fix
/// disabled, exhausted attempts, needs manual, max cycles. `exhausted` holds
/// the signatures that reached their attempt limit, including this cycle's
/// attempts. Returns `None` when the loop should continue.
pub fn evaluate(
    cycles: &[CycleRecord],
    policy: &StopPolicy,
    exhausted: &HashSet<String>,
) -> Option<LoopStop> {
    let last = cycles.last()?;
    if last.status == CycleStatus::Clean {
        return Some(LoopStop::Success);
    }
    if let Some(signature) = stuck_signature(cycles, policy.stuck_threshold) {
        return Some(LoopStop::SameError {
            signature,
            cycles: policy.stuck_threshold,
        });
    }
    if no_progress(cycles, policy.stuck_threshold) {
        return Some(LoopStop::NoProgress {
            cycles: policy.stuck_threshold,
        });
    }
    if let Some((from, to)) = regression(cycles, policy.stuck_threshold) {
        return Some(LoopStop::Regressing {
            from,
            to,
            cycles: policy.stuck_threshold,
        });
    }
    if !policy.auto_fix {
        return Some(LoopStop::NeedsManual { cycles: 1 });
    }
    if !last.errors.is_empty()
        && last
            .errors
            .iter()
            .all(|e| exhausted.contains(&e.signature))
    {
        return Some(LoopStop::Exhausted {
            errors: last.error_count(),
        });
    }
    if tail(cycles, policy.stuck_threshold)
        .is_some_and(|window| window.iter().all(|c| c.status == CycleStatus::NoFixAvailable))
    {
        return Some(LoopStop::NeedsManual {
            cycles: policy.stuck_threshold,
        });
    }
    if cycles.len() >= policy.max_cycles as usize {
        return Some(LoopStop::MaxCycles {
            max_cycles: policy.max_cycles,
        });
    }
    None
}

fn tail(cycles: &[CycleRecord], n: usize) -> Option<&[CycleRecord]> {
    (n > 0 && cycles.len() >= n).then(|| &cycles[cycles.len() - n..])
}

/// First signature of the latest cycle present in each of the last `n`
/// cycles with no successful fix for it in any of them.
fn stuck_signature(cycles: &[CycleRecord], n: usize) -> Option<String> {
    let window = tail(cycles, n)?;
    let last = window.last()?;
    last.errors
        .iter()
        .map(|e| &e.signature)
        .find(|signature| {
            window
                .iter()
                .all(|c| c.has_signature(signature) && !c.fixed_signature(signature))
        })
        .cloned()
}

/// True when the error count did not decrease across the last `n` cycles.
fn no_progress(cycles: &[CycleRecord], n: usize) -> bool {
    let Some(window) = tail(cycles, n) else {
        return false;
    };
    window
        .windows(2)
        .all(|w| w[1].error_count() >= w[0].error_count())
}

/// Counts at both ends of the last `n` cycles when the later one is higher.
/// Needs at least three cycles of history.
fn regression(cycles: &[CycleRecord], n: usize) -> Option<(usize, usize)> {
    if cycles.len() < 3 {
        return None;
    }
    let window = tail(cycles, n)?;
    let from = window.first()?.error_count();
    let to = window.last()?.error_count();
    (to > from).then_some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnosis::{ErrorCategory, ErrorEntry};
    use crate::core::fix::{ApplyMode, Fix, FixAction, FixApplication};
    use crate::core::types::ExecutionResult;
    use chrono::Utc;

    const POLICY: StopPolicy = StopPolicy {
        max_cycles: 10,
        stuck_threshold: 3,
        auto_fix: true,
    };

    fn none() -> HashSet<String> {
        HashSet::new()
    }

    fn record(n: u32, messages: &[&str], status: CycleStatus) -> CycleRecord {
        CycleRecord {
            cycle: n,
            setup: None,
            execution: ExecutionResult {
                command: "node server.js".to_string(),
                exit_code: if messages.is_empty() { 0 } else { 1 },
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
                timed_out: false,
                truncated: false,
                stdout_truncated_bytes: 0,
                stderr_truncated_bytes: 0,
                warnings: Vec::new(),
            },
            tests: None,
            errors: messages
                .iter()
                .map(|m| ErrorEntry::new(ErrorCategory::Runtime, *m))
                .collect(),
            fixes: Vec::new(),
            status,
        }
    }

    fn with_fix(mut record: CycleRecord, success: bool) -> CycleRecord {
        let signature = record.errors[0].signature.clone();
        record.fixes.push(FixApplication {
            timestamp: Utc::now(),
            error_signature: signature,
            fix: Fix::new(
                FixAction::RunCommand {
                    command: "npm install".to_string(),
                },
                0.9,
                "install",
            ),
            mode: ApplyMode::Automatic,
            success,
            message: String::new(),
            backup: None,
            rolled_back: false,
        });
        record
    }

    #[test]
    fn clean_cycle_is_success() {
        let cycles = vec![record(1, &[], CycleStatus::Clean)];
        assert_eq!(evaluate(&cycles, &POLICY, &none()), Some(LoopStop::Success));
    }

    #[test]
    fn same_signature_three_cycles_is_stuck() {
        let cycles: Vec<_> = (1..=3)
            .map(|n| record(n, &["ReferenceError: x is not defined"], CycleStatus::NoFixAvailable))
            .collect();
        assert!(evaluate(&cycles[..2], &POLICY, &none()).is_none());
        let stop = evaluate(&cycles, &POLICY, &none()).expect("stop");
        assert!(matches!(stop, LoopStop::SameError { cycles: 3, .. }));
        assert_eq!(stop.status(), LoopStatus::StuckInLoop);
    }

    #[test]
    fn successful_fix_resets_same_signature_detection() {
        let msg = ["RuntimeError: flaky"];
        let cycles = vec![
            record(1, &["RuntimeError: flaky", "RuntimeError: other"], CycleStatus::ErrorsFound),
            with_fix(record(2, &msg, CycleStatus::FixedAndRetrying), true),
            record(3, &msg, CycleStatus::ErrorsFound),
        ];
        assert!(evaluate(&cycles, &POLICY, &none()).is_none());
    }

    #[test]
    fn plateau_stops_after_three_cycles() {
        let cycles = vec![
            with_fix(record(1, &["RuntimeError: a"], CycleStatus::FixedAndRetrying), true),
            with_fix(record(2, &["RuntimeError: b"], CycleStatus::FixedAndRetrying), true),
            with_fix(record(3, &["RuntimeError: c"], CycleStatus::FixedAndRetrying), true),
        ];
        assert!(evaluate(&cycles[..2], &POLICY, &none()).is_none());
        assert_eq!(
            evaluate(&cycles, &POLICY, &none()),
            Some(LoopStop::NoProgress { cycles: 3 })
        );
    }

    #[test]
    fn decreasing_count_is_progress() {
        let cycles = vec![
            with_fix(record(1, &["RuntimeError: a", "RuntimeError: aa"], CycleStatus::FixedAndRetrying), true),
            with_fix(record(2, &["RuntimeError: b", "RuntimeError: bb"], CycleStatus::FixedAndRetrying), true),
            with_fix(record(3, &["RuntimeError: c"], CycleStatus::FixedAndRetrying), true),
        ];
        assert!(evaluate(&cycles, &POLICY, &none()).is_none());
    }

    #[test]
    fn rising_error_count_is_regression() {
        let cycles = vec![
            with_fix(record(1, &["RuntimeError: a", "RuntimeError: aa"], CycleStatus::FixedAndRetrying), true),
            with_fix(record(2, &["RuntimeError: b"], CycleStatus::FixedAndRetrying), true),
            with_fix(
                record(3, &["RuntimeError: c", "RuntimeError: cc", "RuntimeError: ccc"], CycleStatus::FixedAndRetrying),
                true,
            ),
        ];
        let stop = evaluate(&cycles, &POLICY, &none()).expect("stop");
        assert_eq!(
            stop,
            LoopStop::Regressing {
                from: 2,
                to: 3,
                cycles: 3
            }
        );
        assert_eq!(stop.status(), LoopStatus::NeedsManualIntervention);
        assert!(evaluate(&cycles[1..], &POLICY, &none()).is_none());
    }

    #[test]
    fn exhausted_errors_need_manual_intervention() {
        let cycles = vec![with_fix(
            record(1, &["RuntimeError: a", "RuntimeError: b"], CycleStatus::FixedAndRetrying),
            false,
        )];
        let first: HashSet<String> = HashSet::from([cycles[0].errors[0].signature.clone()]);
        assert!(evaluate(&cycles, &POLICY, &first).is_none());

        let all: HashSet<String> = cycles[0].errors.iter().map(|e| e.signature.clone()).collect();
        let stop = evaluate(&cycles, &POLICY, &all).expect("stop");
        assert_eq!(stop, LoopStop::Exhausted { errors: 2 });
        assert_eq!(stop.status(), LoopStatus::NeedsManualIntervention);
    }

    #[test]
    fn actionless_cycles_need_manual_intervention() {
        let cycles = vec![
            record(1, &["RuntimeError: a", "RuntimeError: aa"], CycleStatus::NoFixAvailable),
            record(2, &["RuntimeError: b", "RuntimeError: bb"], CycleStatus::NoFixAvailable),
            record(3, &["RuntimeError: c"], CycleStatus::NoFixAvailable),
        ];
        assert_eq!(
            evaluate(&cycles, &POLICY, &none()),
            Some(LoopStop::NeedsManual { cycles: 3 })
        );
    }

    #[test]
    fn disabled_auto_fix_stops_after_first_cycle() {
        let policy = StopPolicy {
            auto_fix: false,
            ..POLICY
        };
        let cycles = vec![record(1, &["RuntimeError: a"], CycleStatus::ErrorsFound)];
        let stop = evaluate(&cycles, &policy, &none()).expect("stop");
        assert_eq!(stop.status(), LoopStatus::NeedsManualIntervention);
        assert_eq!(stop.describe(), "automatic fixing is disabled");
    }

    #[test]
    fn max_cycles_bounds_the_loop() {
        let policy = StopPolicy {
            max_cycles: 2,
            ..POLICY
        };
        let cycles = vec![
            with_fix(record(1, &["RuntimeError: a", "RuntimeError: x"], CycleStatus::FixedAndRetrying), true),
            with_fix(record(2, &["RuntimeError: b"], CycleStatus::FixedAndRetrying), true),
        ];
        assert_eq!(
            evaluate(&cycles, &policy, &none()),
            Some(LoopStop::MaxCycles { max_cycles: 2 })
        );
    }
}
