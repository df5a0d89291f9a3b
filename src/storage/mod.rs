pub mod backup;
pub mod engine;
pub mod file_store;
pub mod record;

pub use backup::BackupManager;
pub use engine::RecordStore;
pub use file_store::FileRecordStore;
pub use record::{RecordMeta, StoreStats, VaultRecord};
