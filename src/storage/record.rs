use crate::codec;
use crate::core::{Result, VaultKey};
use chrono::{DateTime, Utc};

/// A persisted vault as read from the store.
#[derive(Debug, Clone)]
pub struct VaultRecord {
    pub key: VaultKey,
    pub blob: Vec<u8>,
    pub modified: DateTime<Utc>,
}

impl VaultRecord {
    /// Row count recorded in the blob header.
    pub fn rows(&self) -> Result<u8> {
        codec::peek_rows(&self.blob)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: VaultKey,
    pub len: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}
