//! File snapshots taken before file fixes, restored on rollback.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;

use crate::core::fix::BackupHandle;

/// Snapshot store under `<root>/<backup_dir>`.
///
/// Snapshot names are `<timestamp>-<seq>-<flattened path>.bak`, so several
/// snapshots of the same file taken in one second stay distinct. Handles are
/// kept per session so the latest snapshot of a file can be restored first.
#[derive(Debug)]
pub struct BackupStore {
    root: PathBuf,
    dir: PathBuf,
    seq: u32,
    history: Vec<BackupHandle>,
}

impl BackupStore {
    pub fn new(root: &Path, backup_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dir: root.join(backup_dir),
            seq: 0,
            history: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `relative` (project-relative). A missing file is recorded as
    /// absent so a restore deletes whatever the fix created.
    pub fn snapshot(&mut self, relative: &str) -> Result<BackupHandle> {
        let source = self.root.join(relative);
        let taken_at = Utc::now();
        let snapshot = if source.is_file() {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("create backup dir {}", self.dir.display()))?;
            self.seq += 1;
            let name = format!(
                "{}-{:04}-{}.bak",
                taken_at.format("%Y%m%dT%H%M%S"),
                self.seq,
                flatten(relative)
            );
            let target = self.dir.join(name);
            fs::copy(&source, &target)
                .with_context(|| format!("back up {}", source.display()))?;
            Some(target)
        } else {
            None
        };
        debug!(path = relative, snapshot = ?snapshot, "took backup");
        let handle = BackupHandle {
            path: relative.to_string(),
            snapshot,
            taken_at,
        };
        self.history.push(handle.clone());
        Ok(handle)
    }

    /// Put the file back exactly as it was when `handle` was taken.
    pub fn restore(&self, handle: &BackupHandle) -> Result<()> {
        let target = self.root.join(&handle.path);
        match &handle.snapshot {
            Some(snapshot) => {
                let bytes = fs::read(snapshot)
                    .with_context(|| format!("read backup {}", snapshot.display()))?;
                fs::write(&target, bytes)
                    .with_context(|| format!("restore {}", target.display()))?;
            }
            None => {
                if target.exists() {
                    fs::remove_file(&target)
                        .with_context(|| format!("remove {}", target.display()))?;
                }
            }
        }
        debug!(path = %handle.path, "restored backup");
        Ok(())
    }

    /// Restore the most recent snapshot of `relative`, if any was taken.
    pub fn rollback_latest(&self, relative: &str) -> Result<Option<BackupHandle>> {
        let Some(handle) = self.history.iter().rev().find(|h| h.path == relative) else {
            return Ok(None);
        };
        self.restore(handle)?;
        Ok(Some(handle.clone()))
    }

    pub fn history(&self) -> &[BackupHandle] {
        &self.history
    }
}

fn flatten(relative: &str) -> String {
    relative
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProject;

    #[test]
    fn restore_brings_back_exact_bytes() {
        let project = TestProject::new().file("src/app.py", "print('a')\r\n\tx = 1");
        let mut store = BackupStore::new(project.path(), Path::new(".fixloop/backups"));
        let handle = store.snapshot("src/app.py").expect("snapshot");
        let snapshot = handle.snapshot.clone().expect("snapshot path");
        assert!(snapshot.starts_with(project.join(".fixloop/backups")));
        assert!(
            snapshot
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("-0001-src_app.py.bak"))
        );

        fs::write(project.join("src/app.py"), "broken").expect("write");
        store.restore(&handle).expect("restore");
        assert_eq!(project.read("src/app.py"), "print('a')\r\n\tx = 1");
    }

    #[test]
    fn absent_file_restore_deletes_it() {
        let project = TestProject::new();
        let mut store = BackupStore::new(project.path(), Path::new(".fixloop/backups"));
        let handle = store.snapshot(".env").expect("snapshot");
        assert!(handle.snapshot.is_none());

        fs::write(project.join(".env"), "PORT=1\n").expect("write");
        store.restore(&handle).expect("restore");
        assert!(!project.exists(".env"));
    }

    #[test]
    fn rollback_latest_uses_newest_snapshot() {
        let project = TestProject::new().file("a.txt", "one");
        let mut store = BackupStore::new(project.path(), Path::new(".fixloop/backups"));
        store.snapshot("a.txt").expect("first");
        fs::write(project.join("a.txt"), "two").expect("write");
        store.snapshot("a.txt").expect("second");
        fs::write(project.join("a.txt"), "three").expect("write");

        let restored = store.rollback_latest("a.txt").expect("rollback");
        assert!(restored.is_some());
        assert_eq!(project.read("a.txt"), "two");
        assert!(store.rollback_latest("b.txt").expect("none").is_none());
        assert_eq!(store.history().len(), 2);
    }
}
