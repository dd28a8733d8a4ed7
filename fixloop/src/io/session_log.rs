//! Session logging helpers for `.fixloop/sessions/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use crate::core::report::{CycleRecord, VerificationReport};

/// New session id: `<UTC timestamp>_<6 random lowercase alphanumerics>`.
pub fn new_session_id() -> String {
    build_session_id(&Utc::now().format("%Y%m%d_%H%M%S").to_string(), &short_id())
}

pub fn build_session_id(timestamp: &str, short_id: &str) -> String {
    format!("{timestamp}_{short_id}")
}

fn short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub report_path: PathBuf,
}

impl SessionPaths {
    pub fn new(sessions_dir: &Path, session_id: &str) -> Self {
        let dir = sessions_dir.join(session_id);
        Self {
            report_path: dir.join("report.json"),
            dir,
        }
    }

    pub fn cycle_path(&self, cycle: u32) -> PathBuf {
        self.dir.join(format!("cycle-{cycle}.json"))
    }
}

pub fn write_cycle(paths: &SessionPaths, record: &CycleRecord) -> Result<PathBuf> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session dir {}", paths.dir.display()))?;
    let path = paths.cycle_path(record.cycle);
    write_json(&path, record)?;
    Ok(path)
}

pub fn write_report(paths: &SessionPaths, report: &VerificationReport) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session dir {}", paths.dir.display()))?;
    write_json(&paths.report_path, report)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
