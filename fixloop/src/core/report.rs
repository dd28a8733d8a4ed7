//! Cycle records, session statistics and the final verification report.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::classifier::guidance;
use crate::core::diagnosis::{ErrorCategory, ErrorEntry};
use crate::core::fix::{ApplyMode, FixApplication};
use crate::core::types::{ExecutionResult, ProjectType, TestOutcome};

/// Outcome of a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Run succeeded and all tests passed.
    Clean,
    /// Errors remain and fix attempts failed (or fixing is disabled).
    ErrorsFound,
    /// At least one fix was applied successfully.
    FixedAndRetrying,
    /// Nothing could be attempted: only suggestions, no proposals, or every
    /// signature exhausted.
    NoFixAvailable,
}

/// Session state. `Running` only appears while a session is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Success,
    Failed,
    MaxCyclesReached,
    StuckInLoop,
    NeedsManualIntervention,
}

impl LoopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Success => "success",
            LoopStatus::Failed => "failed",
            LoopStatus::MaxCyclesReached => "max_cycles_reached",
            LoopStatus::StuckInLoop => "stuck_in_loop",
            LoopStatus::NeedsManualIntervention => "needs_manual_intervention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stuck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 1-based.
    pub cycle: u32,
    /// Dependency installation, first cycle only.
    pub setup: Option<ExecutionResult>,
    pub execution: ExecutionResult,
    pub tests: Option<TestOutcome>,
    pub errors: Vec<ErrorEntry>,
    pub fixes: Vec<FixApplication>,
    pub status: CycleStatus,
}

impl CycleRecord {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn has_signature(&self, signature: &str) -> bool {
        self.errors.iter().any(|e| e.signature == signature)
    }

    /// A fix for `signature` was applied successfully in this cycle.
    pub fn fixed_signature(&self, signature: &str) -> bool {
        self.fixes
            .iter()
            .any(|f| f.success && f.error_signature == signature)
    }
}

/// Derive the status of a cycle from its errors and fix applications.
pub fn cycle_status(clean: bool, fixes: &[FixApplication], auto_fix: bool) -> CycleStatus {
    if clean {
        CycleStatus::Clean
    } else if fixes.iter().any(|f| f.success) {
        CycleStatus::FixedAndRetrying
    } else if !auto_fix || fixes.iter().any(FixApplication::attempted) {
        CycleStatus::ErrorsFound
    } else {
        CycleStatus::NoFixAvailable
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Error count per cycle, in cycle order.
    pub error_history: Vec<usize>,
    /// Distinct signatures in first-seen order.
    pub unique_signatures: Vec<String>,
    /// Signatures seen in more than one cycle.
    pub repeated_errors: usize,
    pub total_errors: usize,
    pub fixes_applied: usize,
    pub fixes_failed: usize,
    pub fixes_suggested: usize,
    pub rollbacks: usize,
}

pub fn compute_stats(cycles: &[CycleRecord]) -> SessionStats {
    let mut stats = SessionStats::default();
    let mut cycles_seen: HashMap<&str, usize> = HashMap::new();
    for cycle in cycles {
        stats.error_history.push(cycle.error_count());
        stats.total_errors += cycle.error_count();
        let mut in_cycle: Vec<&str> = Vec::new();
        for entry in &cycle.errors {
            if in_cycle.contains(&entry.signature.as_str()) {
                continue;
            }
            in_cycle.push(&entry.signature);
            let seen = cycles_seen.entry(&entry.signature).or_insert(0);
            if *seen == 0 {
                stats.unique_signatures.push(entry.signature.clone());
            }
            *seen += 1;
        }
        for fix in &cycle.fixes {
            match (fix.mode, fix.success) {
                (ApplyMode::SuggestedOnly, _) => stats.fixes_suggested += 1,
                (_, true) => stats.fixes_applied += 1,
                (_, false) => stats.fixes_failed += 1,
            }
            if fix.rolled_back {
                stats.rollbacks += 1;
            }
        }
    }
    stats.repeated_errors = cycles_seen.values().filter(|&&n| n > 1).count();
    stats
}

/// `Improving` when the error count never increased across the session.
pub fn trend(error_history: &[usize]) -> Trend {
    if error_history.windows(2).all(|w| w[1] <= w[0]) {
        Trend::Improving
    } else {
        Trend::Stuck
    }
}

/// Final product of a verification session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub session_id: String,
    pub project: PathBuf,
    pub project_type: ProjectType,
    pub status: LoopStatus,
    /// Human-readable reason the session stopped.
    pub stop_reason: String,
    pub cycles: Vec<CycleRecord>,
    pub stats: SessionStats,
    /// Present unless the session succeeded.
    pub trend: Option<Trend>,
    pub recommendations: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn cycle_count(&self) -> usize {
        self.cycles.len()
    }
}

/// Build recommendations for a finished session. Empty on success.
pub fn recommendations(
    status: LoopStatus,
    cycles: &[CycleRecord],
    stats: &SessionStats,
    failure: Option<&str>,
) -> Vec<String> {
    let mut out = Vec::new();
    match status {
        LoopStatus::Success | LoopStatus::Running => return out,
        LoopStatus::Failed => {
            if let Some(failure) = failure {
                out.push(format!("Session aborted: {failure}"));
            }
        }
        LoopStatus::MaxCyclesReached => out.push(
            "Maximum cycles reached; review the remaining errors or raise max_cycles".to_string(),
        ),
        LoopStatus::StuckInLoop => out.push(
            "The same errors keep recurring; automated fixes are not making progress".to_string(),
        ),
        LoopStatus::NeedsManualIntervention => out.push(
            "Remaining errors need manual fixes; see the suggestions below".to_string(),
        ),
    }

    let last_errors = cycles.last().map(|c| c.errors.as_slice()).unwrap_or(&[]);
    let mut by_category: BTreeMap<ErrorCategory, usize> = BTreeMap::new();
    for entry in cycles.iter().flat_map(|c| &c.errors) {
        *by_category.entry(entry.category).or_insert(0) += 1;
    }
    // Most frequent first; category order breaks ties.
    if let Some((category, count)) = by_category
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
    {
        out.push(format!("Most common error category: {category} ({count} occurrences)"));
    }

    let mut guided: Vec<ErrorCategory> = Vec::new();
    for entry in last_errors {
        if matches!(
            entry.category,
            ErrorCategory::Dependency
                | ErrorCategory::Syntax
                | ErrorCategory::Type
                | ErrorCategory::Port
                | ErrorCategory::Configuration
        ) && !guided.contains(&entry.category)
        {
            guided.push(entry.category);
            for hint in guidance(entry.category) {
                out.push(format!("{}: {hint}", entry.category));
            }
        }
    }

    for fix in cycles
        .iter()
        .flat_map(|c| &c.fixes)
        .filter(|f| f.mode == ApplyMode::SuggestedOnly)
    {
        let line = format!(
            "Review suggested fix ({:.2} confidence): {}",
            fix.fix.confidence, fix.fix.description
        );
        if !out.contains(&line) {
            out.push(line);
        }
    }

    if stats.rollbacks > 0 {
        out.push(format!(
            "{} fix(es) were rolled back after failing validation",
            stats.rollbacks
        ));
    }
    out
}
