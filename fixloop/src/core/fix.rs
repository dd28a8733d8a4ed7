//! Fix proposals, application policy and application records.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence at or above which a fix is applied without a backup marker.
pub const AUTO_APPLY_CONFIDENCE: f64 = 0.9;

/// Default threshold below which fixes are only suggested.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Kind-specific payload of a fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixAction {
    /// Shell command that installs a package, e.g. `pip install flask`.
    InstallDependency {
        command: String,
        #[serde(default)]
        package: Option<String>,
    },
    /// Arbitrary shell command, judged by its exit code.
    RunCommand { command: String },
    /// Replace the first occurrence of `old` with `new` in `path`.
    PatchFile { path: String, old: String, new: String },
    /// Write `contents` to `path`, creating parent directories.
    CreateFile { path: String, contents: String },
    /// Set `key=value` in a dotenv-style file.
    ConfigChange { path: String, key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    InstallDependency,
    RunCommand,
    PatchFile,
    CreateFile,
    ConfigChange,
}

impl FixKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FixKind::InstallDependency => "install_dependency",
            FixKind::RunCommand => "run_command",
            FixKind::PatchFile => "patch_file",
            FixKind::CreateFile => "create_file",
            FixKind::ConfigChange => "config_change",
        }
    }
}

impl FixAction {
    pub fn kind(&self) -> FixKind {
        match self {
            FixAction::InstallDependency { .. } => FixKind::InstallDependency,
            FixAction::RunCommand { .. } => FixKind::RunCommand,
            FixAction::PatchFile { .. } => FixKind::PatchFile,
            FixAction::CreateFile { .. } => FixKind::CreateFile,
            FixAction::ConfigChange { .. } => FixKind::ConfigChange,
        }
    }

    /// Project-relative file touched by a file fix. Command fixes have none.
    pub fn target_path(&self) -> Option<&str> {
        match self {
            FixAction::PatchFile { path, .. }
            | FixAction::CreateFile { path, .. }
            | FixAction::ConfigChange { path, .. } => Some(path),
            FixAction::InstallDependency { .. } | FixAction::RunCommand { .. } => None,
        }
    }

    /// Shell command run by a command fix.
    pub fn command(&self) -> Option<&str> {
        match self {
            FixAction::InstallDependency { command, .. } | FixAction::RunCommand { command } => {
                Some(command)
            }
            _ => None,
        }
    }
}

/// A candidate remedy with its confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(flatten)]
    pub action: FixAction,
    pub confidence: f64,
    pub description: String,
}

impl Fix {
    pub fn new(action: FixAction, confidence: f64, description: impl Into<String>) -> Self {
        Self {
            action,
            confidence,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> FixKind {
        self.action.kind()
    }
}

/// How a fix is (or would be) applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    Automatic,
    WithBackup,
    SuggestedOnly,
}

/// Decide the application mode for a confidence value.
///
/// Below `threshold` (or with `auto_apply` off) a fix is only suggested.
/// At or above [`AUTO_APPLY_CONFIDENCE`] it is applied automatically;
/// in between it is applied with a backup and marked as such.
pub fn apply_mode(confidence: f64, threshold: f64, auto_apply: bool) -> ApplyMode {
    if !auto_apply || confidence.is_nan() || confidence < threshold {
        ApplyMode::SuggestedOnly
    } else if confidence >= AUTO_APPLY_CONFIDENCE {
        ApplyMode::Automatic
    } else {
        ApplyMode::WithBackup
    }
}

/// Highest-confidence fix; the earliest wins ties.
pub fn best_fix(fixes: &[Fix]) -> Option<&Fix> {
    fixes
        .iter()
        .filter(|fix| fix.confidence.is_finite())
        .fold(None, |best: Option<&Fix>, fix| match best {
            Some(current) if current.confidence >= fix.confidence => Some(current),
            _ => Some(fix),
        })
}

/// Snapshot taken before a file fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    /// Project-relative path of the backed-up file.
    pub path: String,
    /// Snapshot file, `None` when the target did not exist.
    pub snapshot: Option<PathBuf>,
    pub taken_at: DateTime<Utc>,
}

/// Record of one attempt (or suggestion) to apply a fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixApplication {
    pub timestamp: DateTime<Utc>,
    /// Signature of the error the fix addresses.
    pub error_signature: String,
    pub fix: Fix,
    pub mode: ApplyMode,
    pub success: bool,
    pub message: String,
    /// Backup for file fixes; `None` for command fixes and suggestions.
    pub backup: Option<BackupHandle>,
    pub rolled_back: bool,
}

impl FixApplication {
    /// True when the fix was acted on (not merely suggested).
    pub fn attempted(&self) -> bool {
        self.mode != ApplyMode::SuggestedOnly
    }
}

/// Reason a fix was refused before anything ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFix {
    pub reason: String,
}

impl fmt::Display for InvalidFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fix: {}", self.reason)
    }
}

impl std::error::Error for InvalidFix {}

static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Structural checks that need no filesystem access.
pub fn validate_fix(fix: &Fix) -> Result<(), InvalidFix> {
    let invalid = |reason: String| Err(InvalidFix { reason });
    if !fix.confidence.is_finite() || !(0.0..=1.0).contains(&fix.confidence) {
        return invalid(format!("confidence {} outside [0, 1]", fix.confidence));
    }
    match &fix.action {
        FixAction::InstallDependency { command, .. } | FixAction::RunCommand { command } => {
            if command.trim().is_empty() {
                return invalid("empty command".to_string());
            }
        }
        FixAction::PatchFile { path, old, .. } => {
            check_relative(path)?;
            if old.is_empty() {
                return invalid(format!("patch for {path} has empty search text"));
            }
        }
        FixAction::CreateFile { path, .. } => check_relative(path)?,
        FixAction::ConfigChange { path, key, value } => {
            check_relative(path)?;
            if !ENV_KEY_RE.is_match(key) {
                return invalid(format!("invalid config key {key:?}"));
            }
            if value.contains('\n') {
                return invalid(format!("value for {key} spans lines"));
            }
        }
    }
    Ok(())
}

/// Paths must be relative and stay inside the project root.
fn check_relative(path: &str) -> Result<(), InvalidFix> {
    let candidate = Path::new(path);
    if path.trim().is_empty() {
        return Err(InvalidFix {
            reason: "empty path".to_string(),
        });
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(InvalidFix {
                    reason: format!("path {path} escapes the project root"),
                });
            }
        }
    }
    Ok(())
}
