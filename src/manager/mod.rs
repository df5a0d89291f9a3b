//! The process-wide vault store.
//!
//! `VaultManager` ties the session table, the record store and the task
//! sequencer together. The simulation loop calls its async operations and
//! drains [`VaultEvents`] once per tick; every disk access runs on a sequencer
//! lane for the owner involved.

pub mod events;
pub mod permissions;

pub use events::{VaultEvent, VaultEvents};
pub use permissions::{PermissionSource, StaticPermissions};

use crate::codec;
use crate::config::VaultConfig;
use crate::core::{Container, Result, VaultError, VaultKey, validate_owner_id};
use crate::sequencer::TaskSequencer;
use crate::session::{Session, SessionHandle, SessionPhase, SessionTable};
use crate::storage::{BackupManager, FileRecordStore, RecordStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};
use tracing::{Level, event, info_span};

/// Process-wide vault store.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vaultstore::{ItemStack, StaticPermissions, VaultConfig, VaultManager};
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let config = VaultConfig::new(dir.path()).with_max_vault_amount(3);
/// let (manager, mut events) =
///     VaultManager::open(config, Arc::new(StaticPermissions::new(3))).unwrap();
///
/// let session = manager.open_vault("u1", 2).await.unwrap();
/// session
///     .edit(|c| c.set(0, Some(ItemStack::new("DIAMOND", 3))))
///     .unwrap()
///     .unwrap();
/// manager.close_vault("u1").await.unwrap();
///
/// assert_eq!(manager.list_vaults("u1").await.unwrap(), vec![2]);
/// assert_eq!(events.drain().len(), 2);
/// manager.shutdown().await.unwrap();
/// # });
/// ```
pub struct VaultManager {
    config: VaultConfig,
    store: Arc<dyn RecordStore>,
    sessions: Arc<SessionTable>,
    sequencer: TaskSequencer,
    permissions: Arc<dyn PermissionSource>,
    events: mpsc::UnboundedSender<VaultEvent>,
    migration: AsyncMutex<()>,
    shutting_down: AtomicBool,
}

impl VaultManager {
    /// Opens the file-backed store described by `config`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn open(
        config: VaultConfig,
        permissions: Arc<dyn PermissionSource>,
    ) -> Result<(Arc<Self>, VaultEvents)> {
        let config = config.normalize();
        config.validate()?;

        let backups = BackupManager::new(
            config.backups_dir(),
            config.backups.enabled,
            config.backups.max_per_vault,
        );
        let store = FileRecordStore::open(config.vaults_dir(), backups)?;
        event!(
            Level::INFO,
            data_dir = %config.data_dir.display(),
            workers = config.workers,
            backups = config.backups.enabled,
            "vault store opened"
        );
        Self::with_store(config, Arc::new(store), permissions)
    }

    /// Builds a manager over an arbitrary record store.
    pub fn with_store(
        config: VaultConfig,
        store: Arc<dyn RecordStore>,
        permissions: Arc<dyn PermissionSource>,
    ) -> Result<(Arc<Self>, VaultEvents)> {
        let sequencer = TaskSequencer::new(config.workers)?;
        let sessions = Arc::new(SessionTable::new(config.default_rows));
        let (events, receiver) = VaultEvents::channel();

        let manager = Arc::new(Self {
            config,
            store,
            sessions,
            sequencer,
            permissions,
            events,
            migration: AsyncMutex::new(()),
            shutting_down: AtomicBool::new(false),
        });
        Ok((manager, receiver))
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn sequencer(&self) -> &TaskSequencer {
        &self.sequencer
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionSource> {
        &self.permissions
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Publishes an event; dropped silently once the receiver is gone.
    pub fn notify(&self, event: VaultEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn begin_migration(&self) -> Result<AsyncMutexGuard<'_, ()>> {
        self.migration
            .try_lock()
            .map_err(|_| VaultError::MigrationInProgress)
    }

    /// Opens `index` for `owner_id` and loads its contents.
    ///
    /// The owner's permission limit is looked up on every call. A missing
    /// record opens as an empty vault; a record that fails to decode is left
    /// on disk untouched and the open is rejected. The claimed slot stays
    /// `Loading` until the read has finished on the owner's lane.
    pub async fn open_vault(&self, owner_id: &str, index: u32) -> Result<SessionHandle> {
        let session = match self.claim_session(owner_id, index) {
            Ok(session) => session,
            Err(err) => {
                self.reject_open(owner_id, index, &err);
                return Err(err);
            }
        };

        let key = session.key().clone();
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        let loading = session.clone();
        let rows = self.config.default_rows;
        let loaded = self
            .sequencer
            .submit(owner_id, move || {
                let loaded = load_container(store.as_ref(), &key, rows)
                    .and_then(|(container, dirty)| loading.load(container, dirty));
                if loaded.is_err() {
                    sessions.release(&loading)?;
                }
                loaded
            })
            .await
            .and_then(|()| self.confirm_claim(&session));

        match loaded {
            Ok(()) => {
                event!(Level::DEBUG, key = %session.key(), "vault opened");
                self.notify(VaultEvent::OpenSucceeded {
                    session: session.clone(),
                });
                Ok(session)
            }
            Err(err) => {
                self.sessions.release(&session)?;
                let err = match err {
                    VaultError::OpenCancelled(_) if self.is_shutting_down() => {
                        VaultError::ShuttingDown
                    }
                    err => err,
                };
                self.reject_open(owner_id, index, &err);
                Err(err)
            }
        }
    }

    fn claim_session(&self, owner_id: &str, index: u32) -> Result<SessionHandle> {
        if self.is_shutting_down() {
            return Err(VaultError::ShuttingDown);
        }
        validate_owner_id(owner_id)?;
        let max_allowed = self.permissions.max_allowed(owner_id)?;
        let session = self.sessions.try_open(owner_id, index, max_allowed)?;
        // Shutdown may have snapshotted the table before this claim landed.
        if self.is_shutting_down() {
            self.sessions.release(&session)?;
            return Err(VaultError::ShuttingDown);
        }
        Ok(session)
    }

    /// Fails if the claim was released by a close or shutdown while loading.
    fn confirm_claim(&self, session: &Session) -> Result<()> {
        let current = self.sessions.get(session.owner_id())?;
        if current.is_some_and(|current| current.id() == session.id()) {
            return Ok(());
        }
        Err(VaultError::OpenCancelled(session.key().clone()))
    }

    fn reject_open(&self, owner_id: &str, index: u32, err: &VaultError) {
        if !err.is_user_error() && !matches!(err, VaultError::OpenCancelled(_)) {
            event!(Level::ERROR, owner = owner_id, index, error = %err, "vault could not be loaded");
        } else {
            event!(Level::DEBUG, owner = owner_id, index, reason = %err, "vault open rejected");
        }
        self.notify(VaultEvent::OpenRejected {
            owner_id: owner_id.to_string(),
            index,
            reason: err.to_string(),
        });
    }

    /// Writes the owner's open vault if it has unsaved edits.
    ///
    /// Returns whether a write happened.
    pub async fn save_vault(&self, owner_id: &str) -> Result<bool> {
        let session = self
            .sessions
            .get(owner_id)?
            .ok_or_else(|| VaultError::NotOpen(owner_id.to_string()))?;
        self.flush(&session).await
    }

    async fn flush(&self, session: &Session) -> Result<bool> {
        let Some((container, revision)) = session.pending_snapshot()? else {
            return Ok(false);
        };

        let key = session.key().clone();
        let store = self.store.clone();
        let write_key = key.clone();
        let written = self
            .sequencer
            .submit(session.owner_id(), move || {
                let span = info_span!("vault.save", key = %write_key);
                let _enter = span.enter();
                let blob = codec::encode(&container)?;
                store.write(&write_key, &blob)
            })
            .await;

        match written {
            Ok(()) => {
                session.mark_saved(revision)?;
                self.notify(VaultEvent::SaveCompleted { key });
                Ok(true)
            }
            Err(err) => {
                event!(Level::ERROR, key = %key, error = %err, "vault save failed, session stays dirty");
                self.notify(VaultEvent::SaveFailed {
                    key,
                    cause: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Flushes and releases the owner's session. Closing with nothing open is a no-op.
    ///
    /// If the flush fails the session stays open and dirty so the caller can retry.
    pub async fn close_vault(&self, owner_id: &str) -> Result<()> {
        let Some(session) = self.sessions.get(owner_id)? else {
            return Ok(());
        };
        self.close_session(&session).await
    }

    async fn close_session(&self, session: &Session) -> Result<()> {
        if session.is_loading()? {
            // The load is queued on this lane; anything behind it sees its outcome.
            self.sequencer.submit(session.owner_id(), || Ok(())).await?;
        }
        // Edits may land while a flush is in flight; keep going until clean.
        loop {
            self.flush(session).await?;
            if !session.is_dirty()? {
                break;
            }
        }
        self.sessions.release(session)?;
        event!(Level::DEBUG, key = %session.key(), "vault closed");
        Ok(())
    }

    /// Hard-deletes a stored vault. Refused while that vault is open.
    pub async fn delete_vault(&self, owner_id: &str, index: u32) -> Result<()> {
        let key = VaultKey::new(owner_id, index)?;
        if self.sessions.is_open(&key)? {
            return Err(VaultError::VaultInUse(key));
        }

        let store = self.store.clone();
        let sessions = self.sessions.clone();
        let delete_key = key.clone();
        self.sequencer
            .submit(owner_id, move || {
                if sessions.is_open(&delete_key)? {
                    return Err(VaultError::VaultInUse(delete_key));
                }
                store.delete(&delete_key)
            })
            .await?;

        event!(Level::INFO, key = %key, "vault deleted");
        self.notify(VaultEvent::Deleted { key });
        Ok(())
    }

    /// Read-only copy of a vault. Served from the live session when that
    /// vault is open, otherwise read through the owner's lane, which also
    /// covers a vault whose load is still pending.
    pub async fn preview_vault(&self, owner_id: &str, index: u32) -> Result<Container> {
        let key = VaultKey::new(owner_id, index)?;
        if let Some(session) = self.sessions.get(owner_id)? {
            if session.key() == &key && session.phase()? == SessionPhase::Open {
                return session.contents();
            }
        }

        let store = self.store.clone();
        let rows = self.config.default_rows;
        let (container, _) = self
            .sequencer
            .submit(owner_id, move || {
                let blob = store.read(&key)?;
                decode_any(&blob, rows)
            })
            .await?;
        Ok(container)
    }

    /// Indices the owner has stored, ascending.
    pub async fn list_vaults(&self, owner_id: &str) -> Result<Vec<u32>> {
        validate_owner_id(owner_id)?;
        let store = self.store.clone();
        let owner = owner_id.to_string();
        self.sequencer
            .submit(owner_id, move || store.list_indices(&owner))
            .await
    }

    /// Stops accepting opens, then flushes and releases every open session.
    ///
    /// Every session is attempted; the first failure is returned after the
    /// rest have drained. Failed sessions remain open and dirty.
    pub async fn shutdown(&self) -> Result<usize> {
        self.shutting_down.store(true, Ordering::Release);
        let sessions = self.sessions.open_sessions()?;
        event!(Level::INFO, open = sessions.len(), "draining open vaults");

        let results =
            futures::future::join_all(sessions.iter().map(|session| self.close_session(session)))
                .await;
        self.sequencer.wait_idle().await;

        let mut closed = 0;
        let mut first_error = None;
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(()) => closed += 1,
                Err(err) => {
                    event!(Level::ERROR, key = %session.key(), error = %err, "vault not saved at shutdown");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                event!(Level::INFO, closed, "vault store drained");
                Ok(closed)
            }
        }
    }
}

/// Decodes either wire format. The flag is set when the blob was legacy and
/// therefore needs rewriting.
pub(crate) fn decode_any(blob: &[u8], rows: u8) -> Result<(Container, bool)> {
    match codec::decode(blob, rows) {
        Ok(container) => Ok((container, false)),
        Err(VaultError::LegacyFormat) => Ok((codec::decode_legacy(blob, rows)?, true)),
        Err(err) => Err(err),
    }
}

fn load_container(store: &dyn RecordStore, key: &VaultKey, rows: u8) -> Result<(Container, bool)> {
    let span = info_span!("vault.load", key = %key);
    let _enter = span.enter();
    match store.read(key) {
        Ok(blob) => {
            let loaded = decode_any(&blob, rows)?;
            if loaded.1 {
                event!(Level::INFO, key = %key, "legacy vault loaded, will be rewritten on close");
            }
            Ok(loaded)
        }
        Err(VaultError::NotFound(_)) => Ok((Container::new(rows)?, false)),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemStack;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir, max: u32) -> (Arc<VaultManager>, VaultEvents) {
        let config = VaultConfig::new(temp_dir.path()).with_max_vault_amount(max);
        VaultManager::open(config, Arc::new(StaticPermissions::new(max))).unwrap()
    }

    #[tokio::test]
    async fn test_missing_record_opens_empty() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, mut events) = manager(&temp_dir, 2);

        let session = manager.open_vault("u1", 1).await.unwrap();
        assert!(session.contents().unwrap().is_empty());
        assert_eq!(session.contents().unwrap().rows(), 6);
        assert!(!session.is_dirty().unwrap());

        let drained = events.drain();
        assert!(matches!(drained.as_slice(), [VaultEvent::OpenSucceeded { .. }]));
    }

    #[tokio::test]
    async fn test_rejections_are_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, mut events) = manager(&temp_dir, 2);

        assert!(matches!(
            manager.open_vault("u1", 3).await,
            Err(VaultError::IndexOutOfRange { index: 3, max: 2 })
        ));
        assert!(matches!(
            manager.open_vault("../x", 1).await,
            Err(VaultError::InvalidOwner(_))
        ));
        assert!(matches!(
            manager.save_vault("u1").await,
            Err(VaultError::NotOpen(_))
        ));

        let drained = events.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained
            .iter()
            .all(|event| matches!(event, VaultEvent::OpenRejected { .. })));
    }

    #[tokio::test]
    async fn test_legacy_record_opens_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _events) = manager(&temp_dir, 1);
        let key = VaultKey::new("u1", 1).unwrap();
        manager
            .store()
            .write(&key, br#"{"size": 9, "items": {"4": {"type": "APPLE", "amount": 3}}}"#)
            .unwrap();

        let session = manager.open_vault("u1", 1).await.unwrap();
        assert!(session.is_dirty().unwrap());
        assert_eq!(session.contents().unwrap().get(4).unwrap().amount, 3);

        manager.close_vault("u1").await.unwrap();
        let blob = manager.store().read(&key).unwrap();
        assert!(!codec::is_legacy(&blob));
        assert_eq!(codec::decode(&blob, 1).unwrap().get(4).unwrap().material, "APPLE");
    }

    #[tokio::test]
    async fn test_preview_uses_live_session() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _events) = manager(&temp_dir, 2);
        let session = manager.open_vault("u1", 2).await.unwrap();
        session
            .edit(|c| c.set(0, Some(ItemStack::new("DIRT", 64))))
            .unwrap()
            .unwrap();

        let preview = manager.preview_vault("u1", 2).await.unwrap();
        assert_eq!(preview.get(0).unwrap().amount, 64);
        assert!(matches!(
            manager.preview_vault("u1", 1).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_rejected_while_shutting_down() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _events) = manager(&temp_dir, 1);
        assert_eq!(manager.shutdown().await.unwrap(), 0);
        assert!(matches!(
            manager.open_vault("u1", 1).await,
            Err(VaultError::ShuttingDown)
        ));
    }
}
