use crate::core::{MAX_ROWS, Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, event};

const DEFAULT_ROWS: u8 = 6;

/// Copies kept of each vault before it is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    pub enabled: bool,
    pub max_per_vault: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_vault: 5,
        }
    }
}

/// Periodic removal of vaults nobody has touched in a while.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgePolicy {
    pub enabled: bool,
    pub days_since_last_edit: u32,
    pub interval_secs: u64,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            days_since_last_edit: 30,
            interval_secs: 3_600,
        }
    }
}

impl PurgePolicy {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.days_since_last_edit))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignsPolicy {
    pub enabled: bool,
    pub flush_interval_ms: u64,
}

impl Default for SignsPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: 1_000,
        }
    }
}

/// Vault store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root for records, backups and the signs file
    pub data_dir: PathBuf,

    /// Old per-identity layout; `<data_dir>/uuidvaults` when unset
    pub legacy_dir: Option<PathBuf>,

    /// Rows of a freshly created vault (1-6)
    pub default_rows: u8,

    /// Highest vault index an owner may open before permission overrides
    pub max_vault_amount: u32,

    /// Background I/O workers
    pub workers: usize,

    pub backups: BackupPolicy,
    pub purge: PurgePolicy,
    pub signs: SignsPolicy,

    /// Verbose logging
    pub debug: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            legacy_dir: None,
            default_rows: DEFAULT_ROWS,
            max_vault_amount: 1,
            workers: 4,
            backups: BackupPolicy::default(),
            purge: PurgePolicy::default(),
            signs: SignsPolicy::default(),
            debug: false,
        }
    }
}

impl VaultConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Set the data directory
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set the legacy layout directory
    pub fn with_legacy_dir(mut self, legacy_dir: impl Into<PathBuf>) -> Self {
        self.legacy_dir = Some(legacy_dir.into());
        self
    }

    /// Set default rows
    pub fn with_default_rows(mut self, rows: u8) -> Self {
        self.default_rows = rows;
        self
    }

    /// Set base maximum vault index
    pub fn with_max_vault_amount(mut self, max: u32) -> Self {
        self.max_vault_amount = max;
        self
    }

    /// Set worker pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Enable or disable backups
    pub fn with_backups(mut self, enabled: bool, max_per_vault: usize) -> Self {
        self.backups = BackupPolicy {
            enabled,
            max_per_vault,
        };
        self
    }

    /// Set purge policy
    pub fn with_purge(mut self, purge: PurgePolicy) -> Self {
        self.purge = purge;
        self
    }

    pub fn vaults_dir(&self) -> PathBuf {
        self.data_dir.join("vaults")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn signs_file(&self) -> PathBuf {
        self.data_dir.join("signs.json")
    }

    pub fn legacy_dir(&self) -> PathBuf {
        self.legacy_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("uuidvaults"))
    }

    pub fn default_size(&self) -> usize {
        self.default_rows as usize * crate::core::SLOTS_PER_ROW
    }

    /// Replaces out-of-range soft settings with usable values.
    pub fn normalize(mut self) -> Self {
        if self.default_rows == 0 || self.default_rows > MAX_ROWS {
            event!(
                Level::WARN,
                default_rows = self.default_rows,
                "default_rows out of range, using {}",
                DEFAULT_ROWS
            );
            self.default_rows = DEFAULT_ROWS;
        }
        self.workers = self.workers.max(1);
        self.backups.max_per_vault = self.backups.max_per_vault.max(1);
        self.signs.flush_interval_ms = self.signs.flush_interval_ms.max(50);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(VaultError::Config("data_dir cannot be empty".to_string()));
        }
        if self.max_vault_amount == 0 {
            return Err(VaultError::Config("max_vault_amount must be > 0".to_string()));
        }
        if self.purge.enabled && self.purge.days_since_last_edit == 0 {
            return Err(VaultError::Config(
                "purge.days_since_last_edit must be > 0 when purge is enabled".to_string(),
            ));
        }
        if self.purge.enabled && self.purge.interval_secs == 0 {
            return Err(VaultError::Config(
                "purge.interval_secs must be > 0 when purge is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses, normalizes and validates a JSON document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VaultError::Config(format!("parse config: {}", e)))?;
        let config = config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` (or defaults when absent) and writes the merged result back
    /// so newly added settings show up in the file.
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = match fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                event!(Level::INFO, path = %path.display(), "no config found, writing defaults");
                Self::default()
            }
            Err(e) => return Err(VaultError::io(format!("read config {}", path.display()), e)),
        };
        config.save(path)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VaultError::io(format!("create config dir {}", parent.display()), e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::Config(format!("serialize config: {}", e)))?;
        fs::write(path, json).map_err(|e| VaultError::io(format!("write config {}", path.display()), e))
    }
}
