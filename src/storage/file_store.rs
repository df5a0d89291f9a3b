//! One file per vault under a directory per owner.
//!
//! ```text
//! <root>/<owner id>/<index>.vault
//! ```
//!
//! Writes land in a temp file inside the owner directory and are renamed into
//! place after `sync_all`, so readers see either the previous record or the
//! complete new one.

use super::backup::BackupManager;
use super::engine::RecordStore;
use super::record::{RecordMeta, StoreStats};
use crate::core::{Result, VaultError, VaultKey, validate_owner_id};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

pub const RECORD_EXTENSION: &str = "vault";
const TMP_PREFIX: &str = ".";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Default)]
struct StoreCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

pub struct FileRecordStore {
    root: PathBuf,
    backups: BackupManager,
    counters: StoreCounters,
}

impl FileRecordStore {
    /// Opens (creating if needed) a store rooted at `root` and removes temp
    /// files left behind by writes that never reached the rename.
    pub fn open<P: AsRef<Path>>(root: P, backups: BackupManager) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| VaultError::io(format!("create store root {}", root.display()), e))?;

        let store = Self {
            root,
            backups,
            counters: StoreCounters::default(),
        };
        let removed = store.remove_partial_writes()?;
        if removed > 0 {
            event!(Level::WARN, removed, "removed interrupted vault writes");
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn record_path(&self, key: &VaultKey) -> PathBuf {
        self.owner_dir(key.owner_id())
            .join(format!("{}.{}", key.index(), RECORD_EXTENSION))
    }

    fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.root.join(owner_id)
    }

    fn remove_partial_writes(&self) -> Result<usize> {
        let mut removed = 0;
        for owner in self.list_owners()? {
            let dir = self.owner_dir(&owner);
            let entries = fs::read_dir(&dir)
                .map_err(|e| VaultError::io(format!("scan {}", dir.display()), e))?;
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX) {
                    fs::remove_file(entry.path()).map_err(|e| {
                        VaultError::io(format!("remove {}", entry.path().display()), e)
                    })?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl RecordStore for FileRecordStore {
    fn read(&self, key: &VaultKey) -> Result<Vec<u8>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        fs::read(self.record_path(key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => VaultError::NotFound(key.clone()),
            _ => VaultError::io(format!("read {}", key), e),
        })
    }

    fn write(&self, key: &VaultKey, blob: &[u8]) -> Result<()> {
        let dir = self.owner_dir(key.owner_id());
        fs::create_dir_all(&dir).map_err(|e| VaultError::io(format!("create dir for {}", key), e))?;

        let path = self.record_path(key);
        if path.exists() {
            self.backups.preserve(key, &path);
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .suffix(TMP_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|e| VaultError::io(format!("create temp file for {}", key), e))?;
        tmp.write_all(blob)
            .map_err(|e| VaultError::io(format!("write {}", key), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| VaultError::io(format!("sync {}", key), e))?;
        tmp.persist(&path)
            .map_err(|e| VaultError::io(format!("rename into place {}", key), e.error))?;

        // Persist the rename itself; not every platform allows syncing a directory.
        if let Ok(dir) = File::open(&dir) {
            let _ = dir.sync_all();
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        event!(Level::DEBUG, key = %key, bytes = blob.len(), "vault record written");
        Ok(())
    }

    fn exists(&self, key: &VaultKey) -> bool {
        self.record_path(key).is_file()
    }

    fn delete(&self, key: &VaultKey) -> Result<()> {
        fs::remove_file(self.record_path(key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => VaultError::NotFound(key.clone()),
            _ => VaultError::io(format!("delete {}", key), e),
        })?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);

        // Only succeeds once the owner has no records left.
        let _ = fs::remove_dir(self.owner_dir(key.owner_id()));
        Ok(())
    }

    fn stat(&self, key: &VaultKey) -> Result<RecordMeta> {
        let metadata = fs::metadata(self.record_path(key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => VaultError::NotFound(key.clone()),
            _ => VaultError::io(format!("stat {}", key), e),
        })?;
        let modified = metadata
            .modified()
            .map_err(|e| VaultError::io(format!("mtime of {}", key), e))?;
        Ok(RecordMeta {
            key: key.clone(),
            len: metadata.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }

    fn list_indices(&self, owner_id: &str) -> Result<Vec<u32>> {
        validate_owner_id(owner_id)?;
        let dir = self.owner_dir(owner_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(format!("list vaults of {}", owner_id), e)),
        };

        let mut indices = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != RECORD_EXTENSION {
                    return None;
                }
                path.file_stem()?.to_str()?.parse::<u32>().ok()
            })
            .filter(|index| *index > 0)
            .collect::<Vec<_>>();
        indices.sort_unstable();
        Ok(indices)
    }

    fn list_owners(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| VaultError::io(format!("list owners in {}", self.root.display()), e))?;
        let mut owners = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| validate_owner_id(name).is_ok())
            .collect::<Vec<_>>();
        owners.sort();
        Ok(owners)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
        }
    }
}
