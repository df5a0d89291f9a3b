use crate::core::{Result, VaultError, VaultKey};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

/// Keeps rotating copies of records before they are overwritten.
///
/// Copies live at `<root>/<owner>/<index>-<millis>-<seq>.vault`. A failed copy
/// is logged and never stops the write it precedes.
pub struct BackupManager {
    root: PathBuf,
    enabled: bool,
    max_per_vault: usize,
    seq: AtomicU64,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, enabled: bool, max_per_vault: usize) -> Self {
        Self {
            root: root.into(),
            enabled,
            max_per_vault: max_per_vault.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), false, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copies `current` aside before it is replaced.
    pub fn preserve(&self, key: &VaultKey, current: &Path) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        match self.try_preserve(key, current) {
            Ok(copy) => {
                if let Err(err) = self.rotate(key) {
                    event!(Level::WARN, key = %key, error = %err, "backup rotation failed");
                }
                Some(copy)
            }
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "vault backup failed, continuing with write");
                None
            }
        }
    }

    /// Backups of `key`, oldest first.
    pub fn list_backups(&self, key: &VaultKey) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(key.owner_id());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(format!("list backups of {}", key), e)),
        };

        let prefix = format!("{}-", key.index());
        let mut copies = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .collect::<Vec<_>>();
        copies.sort();
        Ok(copies)
    }

    fn try_preserve(&self, key: &VaultKey, current: &Path) -> Result<PathBuf> {
        let dir = self.root.join(key.owner_id());
        fs::create_dir_all(&dir)
            .map_err(|e| VaultError::io(format!("create backup dir for {}", key), e))?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let target = dir.join(format!(
            "{}-{:013}-{:06}.vault",
            key.index(),
            Utc::now().timestamp_millis(),
            seq
        ));
        fs::copy(current, &target).map_err(|e| VaultError::io(format!("back up {}", key), e))?;
        event!(Level::DEBUG, key = %key, backup = %target.display(), "vault backed up");
        Ok(target)
    }

    fn rotate(&self, key: &VaultKey) -> Result<usize> {
        let copies = self.list_backups(key)?;
        let excess = copies.len().saturating_sub(self.max_per_vault);
        for stale in &copies[..excess] {
            fs::remove_file(stale)
                .map_err(|e| VaultError::io(format!("prune backup {}", stale.display()), e))?;
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("current.vault");
        let backups = BackupManager::new(temp_dir.path().join("backups"), true, 2);
        let key = VaultKey::new("u1", 1).unwrap();

        for round in 0..4u8 {
            fs::write(&source, [round]).unwrap();
            assert!(backups.preserve(&key, &source).is_some());
        }

        let copies = backups.list_backups(&key).unwrap();
        assert_eq!(copies.len(), 2);
        assert_eq!(fs::read(&copies[0]).unwrap(), vec![2]);
        assert_eq!(fs::read(&copies[1]).unwrap(), vec![3]);
    }

    #[test]
    fn test_failed_backup_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let backups = BackupManager::new(temp_dir.path().join("backups"), true, 2);
        let key = VaultKey::new("u1", 1).unwrap();
        assert!(backups.preserve(&key, &temp_dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_disabled_does_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("current.vault");
        fs::write(&source, b"x").unwrap();
        let key = VaultKey::new("u1", 1).unwrap();
        assert!(BackupManager::disabled().preserve(&key, &source).is_none());
    }
}
