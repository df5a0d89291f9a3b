//! Sign locations bound to vaults.
//!
//! Bindings live in memory and are written to a single JSON file by a
//! periodic flush. The file is overwritten in place without fsync; losing the
//! last interval of binding changes on a crash is acceptable here.

use crate::config::SignsPolicy;
use crate::core::{Result, VaultError, VaultKey};
use crate::jobs::BackgroundWorker;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignLocation {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SignLocation {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}

impl fmt::Display for SignLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{};{}", self.world, self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignBinding {
    pub location: SignLocation,
    pub vault: VaultKey,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SignFile {
    #[serde(default)]
    bindings: Vec<SignBinding>,
}

pub struct SignStore {
    path: PathBuf,
    bindings: Mutex<BTreeMap<SignLocation, VaultKey>>,
    dirty: AtomicBool,
}

impl SignStore {
    /// Loads bindings from `path`; a missing file means no bindings.
    ///
    /// Entries naming an invalid vault are dropped with a warning.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str::<SignFile>(&json)
                .map_err(|e| VaultError::CorruptData(format!("signs file: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SignFile::default(),
            Err(e) => return Err(VaultError::io(format!("read {}", path.display()), e)),
        };

        let mut bindings = BTreeMap::new();
        for binding in file.bindings {
            match VaultKey::new(binding.vault.owner_id(), binding.vault.index()) {
                Ok(vault) => {
                    bindings.insert(binding.location, vault);
                }
                Err(err) => {
                    event!(Level::WARN, location = %binding.location, error = %err, "dropping invalid sign binding");
                }
            }
        }
        event!(Level::DEBUG, count = bindings.len(), "sign bindings loaded");

        Ok(Self {
            path,
            bindings: Mutex::new(bindings),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bind(&self, location: SignLocation, vault: VaultKey) -> Result<Option<VaultKey>> {
        let previous = self.bindings.lock()?.insert(location, vault);
        self.dirty.store(true, Ordering::Release);
        Ok(previous)
    }

    pub fn unbind(&self, location: &SignLocation) -> Result<Option<VaultKey>> {
        let removed = self.bindings.lock()?.remove(location);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    pub fn binding_at(&self, location: &SignLocation) -> Result<Option<VaultKey>> {
        Ok(self.bindings.lock()?.get(location).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.bindings.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Writes the file if anything changed since the last flush.
    pub fn flush_if_dirty(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        if let Err(err) = self.write_file() {
            self.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        Ok(true)
    }

    fn write_file(&self) -> Result<()> {
        let file = SignFile {
            bindings: self
                .bindings
                .lock()?
                .iter()
                .map(|(location, vault)| SignBinding {
                    location: location.clone(),
                    vault: vault.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| VaultError::ExecutionError(format!("serialize signs: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VaultError::io(format!("create {}", parent.display()), e))?;
        }
        fs::write(&self.path, json)
            .map_err(|e| VaultError::io(format!("write {}", self.path.display()), e))?;
        event!(Level::DEBUG, count = file.bindings.len(), "sign bindings flushed");
        Ok(())
    }
}

/// Flushes `signs` every `policy.flush_interval_ms` while sign support is on.
pub fn spawn_sign_flush_worker(signs: Arc<SignStore>, policy: &SignsPolicy) -> Result<BackgroundWorker> {
    if !policy.enabled {
        return Err(VaultError::Config(
            "signs.enabled must be set to start the sign flush worker".to_string(),
        ));
    }
    Ok(BackgroundWorker::spawn(
        "sign-flush",
        Duration::from_millis(policy.flush_interval_ms),
        move || {
            let signs = signs.clone();
            async move {
                tokio::task::spawn_blocking(move || signs.flush_if_dirty())
                    .await
                    .map_err(|err| VaultError::ExecutionError(format!("sign flush: {}", err)))?
                    .map(|_| ())
            }
        },
    ))
}
