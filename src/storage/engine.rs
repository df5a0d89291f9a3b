use super::record::{RecordMeta, StoreStats, VaultRecord};
use crate::core::{Result, VaultKey};

/// Record store trait - allows pluggable storage backends
///
/// Implementations are synchronous; callers run them on sequencer workers,
/// which also guarantee that one key is never accessed concurrently.
pub trait RecordStore: Send + Sync {
    /// Read the blob stored under `key`
    fn read(&self, key: &VaultKey) -> Result<Vec<u8>>;

    /// Atomically replace (or create) the blob stored under `key`
    fn write(&self, key: &VaultKey, blob: &[u8]) -> Result<()>;

    /// Check if a record exists
    fn exists(&self, key: &VaultKey) -> bool;

    /// Remove a record
    fn delete(&self, key: &VaultKey) -> Result<()>;

    /// Size and last-modified time of a record
    fn stat(&self, key: &VaultKey) -> Result<RecordMeta>;

    /// Indices stored for an owner, ascending, as of the time of the call
    fn list_indices(&self, owner_id: &str) -> Result<Vec<u32>>;

    /// All owners with at least one stored record directory
    fn list_owners(&self) -> Result<Vec<String>>;

    /// Operation counters
    fn stats(&self) -> StoreStats;

    /// Read the blob together with its metadata
    fn read_record(&self, key: &VaultKey) -> Result<VaultRecord> {
        let blob = self.read(key)?;
        let meta = self.stat(key)?;
        Ok(VaultRecord {
            key: key.clone(),
            blob,
            modified: meta.modified,
        })
    }
}
