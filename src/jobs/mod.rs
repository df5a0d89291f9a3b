//! Maintenance jobs that run beside live traffic. They only touch records
//! through the manager's public accessors and the owner's sequencer lane.

pub mod migration;
pub mod retention;
pub mod worker;

pub use migration::{
    IdentityMapper, MigrationFailure, MigrationJob, MigrationReport, MigrationState,
    UuidIdentityMapper,
};
pub use retention::{RetentionJob, RetentionReport, spawn_retention_worker};
pub use worker::BackgroundWorker;
