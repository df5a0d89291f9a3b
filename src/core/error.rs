use super::types::VaultKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Vault index {index} is out of range (allowed 1..={max})")]
    IndexOutOfRange { index: u32, max: u32 },

    #[error("Owner '{owner_id}' already has vault #{open_index} open")]
    AlreadyOpenElsewhere { owner_id: String, open_index: u32 },

    #[error("Vault {0} is currently open")]
    VaultInUse(VaultKey),

    #[error("No vault is open for owner '{0}'")]
    NotOpen(String),

    #[error("Vault {0} is still loading")]
    StillLoading(VaultKey),

    #[error("Vault {0} was closed before it finished loading")]
    OpenCancelled(VaultKey),

    #[error("Vault {0} not found")]
    NotFound(VaultKey),

    #[error("Container rows must be within 1..={max}, got {rows}")]
    InvalidRows { rows: u8, max: u8 },

    #[error("Slot {slot} out of bounds (size {size})")]
    SlotOutOfRange { slot: usize, size: usize },

    #[error("Corrupt vault data: {0}")]
    CorruptData(String),

    #[error("Vault data is in the legacy format")]
    LegacyFormat,

    #[error("I/O failure on {context}: {source}")]
    IoFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid owner id '{0}'")]
    InvalidOwner(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration is already running")]
    MigrationInProgress,

    #[error("Vault manager is shutting down")]
    ShuttingDown,

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoFailure {
            context: context.into(),
            source,
        }
    }

    /// Rejections caused by the request itself. Retrying them cannot succeed.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::IndexOutOfRange { .. }
                | Self::AlreadyOpenElsewhere { .. }
                | Self::VaultInUse(_)
                | Self::InvalidRows { .. }
                | Self::SlotOutOfRange { .. }
                | Self::InvalidOwner(_)
                | Self::ShuttingDown
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for VaultError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
