// ============================================================================
// Vault Store Library
// ============================================================================

pub mod codec;
pub mod config;
pub mod core;
pub mod jobs;
pub mod manager;
pub mod sequencer;
pub mod session;
pub mod signs;
pub mod storage;

// Re-export main types for convenience
pub use crate::config::{BackupPolicy, PurgePolicy, SignsPolicy, VaultConfig};
pub use crate::core::{Container, ItemMeta, ItemStack, Result, VaultError, VaultKey};
pub use manager::{PermissionSource, StaticPermissions, VaultEvent, VaultEvents, VaultManager};
pub use sequencer::{Completion, SequencerStats, TaskSequencer};
pub use session::{Session, SessionHandle, SessionPhase, SessionTable};
pub use storage::{BackupManager, FileRecordStore, RecordStore};

// Re-export background jobs
pub use jobs::{
    BackgroundWorker, MigrationJob, MigrationReport, RetentionJob, RetentionReport,
    spawn_retention_worker,
};
pub use signs::{SignLocation, SignStore, spawn_sign_flush_worker};
