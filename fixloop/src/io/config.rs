//! Project configuration stored under `.fixloop/config.toml`.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Directory holding fixloop state inside a project.
pub const STATE_DIR: &str = ".fixloop";

/// Configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults. Explicit
/// operation options override these values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FixloopConfig {
    /// Timeout for one project run. A server still running at this point is
    /// considered healthy when `timeout_means_running` is set.
    pub run_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// Timeout for the dependency installation before the first cycle.
    pub setup_timeout_secs: u64,
    /// Timeout for command fixes (installs, kills).
    pub fix_command_timeout_secs: u64,
    /// Per-stream bound on captured output.
    pub output_limit_bytes: usize,

    pub max_cycles: u32,
    /// Fixes below this confidence are only suggested.
    pub confidence_threshold: f64,
    /// Consecutive cycles for the stuck, plateau and manual-intervention checks.
    pub stuck_threshold: usize,
    /// Attempts per error signature before it is exhausted.
    pub max_fix_attempts_per_error: u32,
    /// Distinct signatures sent to the oracle per cycle.
    pub max_errors_per_fix_pass: usize,

    pub run_tests: bool,
    pub auto_fix: bool,
    /// Run the install command before the first cycle.
    pub setup: bool,
    pub timeout_means_running: bool,
    pub record_sessions: bool,

    /// Relative to the project root.
    pub backup_dir: PathBuf,
    /// Relative to the project root.
    pub sessions_dir: PathBuf,

    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// External proposal command (JSON on stdin/stdout). Empty means rules only.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl Default for FixloopConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 60,
            test_timeout_secs: 300,
            setup_timeout_secs: 600,
            fix_command_timeout_secs: 120,
            output_limit_bytes: 100_000,
            max_cycles: 10,
            confidence_threshold: 0.7,
            stuck_threshold: 3,
            max_fix_attempts_per_error: 3,
            max_errors_per_fix_pass: 5,
            run_tests: true,
            auto_fix: true,
            setup: true,
            timeout_means_running: true,
            record_sessions: true,
            backup_dir: PathBuf::from(STATE_DIR).join("backups"),
            sessions_dir: PathBuf::from(STATE_DIR).join("sessions"),
            oracle: OracleConfig::default(),
        }
    }
}

impl FixloopConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("run_timeout_secs", self.run_timeout_secs),
            ("test_timeout_secs", self.test_timeout_secs),
            ("setup_timeout_secs", self.setup_timeout_secs),
            ("fix_command_timeout_secs", self.fix_command_timeout_secs),
            ("oracle.timeout_secs", self.oracle.timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_cycles == 0 {
            return Err(anyhow!("max_cycles must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.stuck_threshold < 2 {
            return Err(anyhow!("stuck_threshold must be >= 2"));
        }
        if self.max_fix_attempts_per_error == 0 {
            return Err(anyhow!("max_fix_attempts_per_error must be > 0"));
        }
        if self.max_errors_per_fix_pass == 0 {
            return Err(anyhow!("max_errors_per_fix_pass must be > 0"));
        }
        validate_state_dir("backup_dir", &self.backup_dir)?;
        validate_state_dir("sessions_dir", &self.sessions_dir)?;
        if self
            .oracle
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("oracle.command must start with a program"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn fix_command_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_command_timeout_secs)
    }
}

fn validate_state_dir(name: &str, dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(anyhow!("{name} must not be empty"));
    }
    if dir
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!(
            "{name} must be relative to the project root: {}",
            dir.display()
        ));
    }
    Ok(())
}

/// Location of the config file for a project.
pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR).join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FixloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<FixloopConfig> {
    if !path.exists() {
        let cfg = FixloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FixloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FixloopConfig::default());
        assert_eq!(cfg.max_cycles, 10);
        assert_eq!(cfg.confidence_threshold, 0.7);
        assert_eq!(cfg.backup_dir, PathBuf::from(".fixloop/backups"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_cycles = 3\n[oracle]\ntimeout_secs = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_cycles, 3);
        assert_eq!(cfg.oracle.timeout_secs, 5);
        assert_eq!(cfg.run_timeout_secs, 60);
        assert!(cfg.oracle.command.is_empty());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad = [
            FixloopConfig {
                max_cycles: 0,
                ..FixloopConfig::default()
            },
            FixloopConfig {
                confidence_threshold: 1.5,
                ..FixloopConfig::default()
            },
            FixloopConfig {
                stuck_threshold: 1,
                ..FixloopConfig::default()
            },
            FixloopConfig {
                backup_dir: PathBuf::from("../backups"),
                ..FixloopConfig::default()
            },
            FixloopConfig {
                run_timeout_secs: 0,
                ..FixloopConfig::default()
            },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn invalid_file_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_cycles = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_cycles must be >= 1"));
    }
}
