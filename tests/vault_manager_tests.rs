//! End-to-end behaviour of the vault manager over a real directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use vaultstore::codec;
use vaultstore::storage::{RecordMeta, StoreStats};
use vaultstore::{
    BackupManager, Container, FileRecordStore, ItemStack, RecordStore, StaticPermissions,
    VaultConfig, VaultError, VaultEvent, VaultEvents, VaultKey, VaultManager,
};

fn open_manager(temp_dir: &TempDir, max: u32) -> (Arc<VaultManager>, VaultEvents) {
    let config = VaultConfig::new(temp_dir.path()).with_max_vault_amount(max);
    VaultManager::open(config, Arc::new(StaticPermissions::new(max))).unwrap()
}

fn key(owner: &str, index: u32) -> VaultKey {
    VaultKey::new(owner, index).unwrap()
}

#[tokio::test]
async fn test_open_edit_close_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, mut events) = open_manager(&temp_dir, 3);

    let session = manager.open_vault("u1", 2).await.unwrap();
    session
        .edit(|c| {
            c.set(0, Some(ItemStack::new("DIAMOND", 5).with_display_name("Shiny")))
                .unwrap();
            c.set(13, Some(ItemStack::new("BREAD", 12))).unwrap();
        })
        .unwrap();
    assert!(session.is_dirty().unwrap());

    let err = manager.open_vault("u1", 1).await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::AlreadyOpenElsewhere { open_index: 2, .. }
    ));
    assert!(err.is_user_error());

    manager.close_vault("u1").await.unwrap();
    assert!(manager.sessions().get("u1").unwrap().is_none());

    let blob = manager.store().read(&key("u1", 2)).unwrap();
    let stored = codec::decode(&blob, 6).unwrap();
    assert!(stored.same_contents(&session.contents().unwrap()));
    assert_eq!(
        stored.get(0).unwrap().meta.display_name.as_deref(),
        Some("Shiny")
    );

    let drained = events.drain();
    assert!(matches!(drained[0], VaultEvent::OpenSucceeded { .. }));
    assert!(matches!(drained[1], VaultEvent::OpenRejected { index: 1, .. }));
    assert!(matches!(&drained[2], VaultEvent::SaveCompleted { key } if key.index() == 2));

    // Reopening reads back what was written.
    let reopened = manager.open_vault("u1", 2).await.unwrap();
    assert_eq!(reopened.contents().unwrap().get(13).unwrap().amount, 12);
    assert!(!reopened.is_dirty().unwrap());
}

#[tokio::test]
async fn test_close_without_edits_writes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _events) = open_manager(&temp_dir, 2);

    manager.open_vault("u1", 1).await.unwrap();
    manager.close_vault("u1").await.unwrap();
    assert_eq!(manager.store().stats().writes, 0);
    assert!(!manager.store().exists(&key("u1", 1)));

    let session = manager.open_vault("u1", 1).await.unwrap();
    session
        .edit(|c| c.set(3, Some(ItemStack::new("STICK", 1))))
        .unwrap()
        .unwrap();
    manager.close_vault("u1").await.unwrap();
    assert_eq!(manager.store().stats().writes, 1);

    manager.open_vault("u1", 1).await.unwrap();
    assert!(!manager.save_vault("u1").await.unwrap());
    manager.close_vault("u1").await.unwrap();
    assert_eq!(manager.store().stats().writes, 1);

    // Nothing open: still fine.
    manager.close_vault("u1").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_have_one_winner() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _events) = open_manager(&temp_dir, 3);

    let attempts = (0..16u32).map(|i| {
        let manager = manager.clone();
        async move { manager.open_vault("u1", i % 3 + 1).await }
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(VaultError::AlreadyOpenElsewhere { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(losers, 15);
}

#[tokio::test]
async fn test_permission_is_read_on_every_open() {
    let temp_dir = TempDir::new().unwrap();
    let permissions = Arc::new(StaticPermissions::new(1));
    let (manager, _events) =
        VaultManager::open(VaultConfig::new(temp_dir.path()), permissions.clone()).unwrap();

    assert!(matches!(
        manager.open_vault("u1", 4).await,
        Err(VaultError::IndexOutOfRange { index: 4, max: 1 })
    ));
    permissions.grant("u1", 5).unwrap();
    assert!(manager.open_vault("u1", 4).await.is_ok());
}

#[tokio::test]
async fn test_save_queued_before_delete_finishes_first() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, mut events) = open_manager(&temp_dir, 1);
    let k = key("u1", 1);

    let mut container = Container::new(1).unwrap();
    container
        .set(0, Some(ItemStack::new("STONE", 1)))
        .unwrap();
    let blob = codec::encode(&container).unwrap();

    let store = manager.store().clone();
    let write_key = k.clone();
    let save = manager.sequencer().submit("u1", move || {
        std::thread::sleep(Duration::from_millis(50));
        store.write(&write_key, &blob)
    });

    // The record only exists once the slow save has run.
    manager.delete_vault("u1", 1).await.unwrap();
    save.await.unwrap();
    assert!(!manager.store().exists(&k));
    assert!(matches!(
        events.drain().as_slice(),
        [VaultEvent::Deleted { .. }]
    ));

    assert!(matches!(
        manager.delete_vault("u1", 1).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_refused_while_open() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _events) = open_manager(&temp_dir, 2);
    manager.open_vault("u1", 2).await.unwrap();

    assert!(matches!(
        manager.delete_vault("u1", 2).await,
        Err(VaultError::VaultInUse(_))
    ));
}

#[tokio::test]
async fn test_corrupt_record_is_rejected_and_preserved() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, mut events) = open_manager(&temp_dir, 2);
    let k = key("u1", 1);
    let garbage = b"PVLT\x02\x06\xff\xff\xff\xffnot msgpack".to_vec();
    manager.store().write(&k, &garbage).unwrap();

    assert!(matches!(
        manager.open_vault("u1", 1).await,
        Err(VaultError::CorruptData(_))
    ));
    assert_eq!(manager.store().read(&k).unwrap(), garbage);
    assert!(manager.sessions().is_empty().unwrap());
    assert!(matches!(
        events.drain().as_slice(),
        [VaultEvent::OpenRejected { index: 1, .. }]
    ));

    // The failed open released the owner's slot.
    assert!(manager.open_vault("u1", 2).await.is_ok());
}

#[tokio::test]
async fn test_list_and_preview() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _events) = open_manager(&temp_dir, 3);

    for index in [3, 1] {
        let session = manager.open_vault("u1", index).await.unwrap();
        session
            .edit(|c| c.set(0, Some(ItemStack::new("EMERALD", index as u8))))
            .unwrap()
            .unwrap();
        manager.close_vault("u1").await.unwrap();
    }

    assert_eq!(manager.list_vaults("u1").await.unwrap(), vec![1, 3]);
    assert!(manager.list_vaults("u2").await.unwrap().is_empty());
    assert!(matches!(
        manager.list_vaults("bad/owner").await,
        Err(VaultError::InvalidOwner(_))
    ));

    let preview = manager.preview_vault("u1", 3).await.unwrap();
    assert_eq!(preview.get(0).unwrap().amount, 3);
    assert!(manager.sessions().is_empty().unwrap());
}

#[tokio::test]
async fn test_overwrites_are_backed_up() {
    let temp_dir = TempDir::new().unwrap();
    let config = VaultConfig::new(temp_dir.path()).with_backups(true, 2);
    let (manager, _events) =
        VaultManager::open(config.clone(), Arc::new(StaticPermissions::new(1))).unwrap();

    for amount in 1..=4u8 {
        let session = manager.open_vault("u1", 1).await.unwrap();
        session
            .edit(|c| c.set(0, Some(ItemStack::new("GOLD_INGOT", amount))))
            .unwrap()
            .unwrap();
        manager.close_vault("u1").await.unwrap();
    }

    let backups = BackupManager::new(config.backups_dir(), true, 2);
    let copies = backups.list_backups(&key("u1", 1)).unwrap();
    assert_eq!(copies.len(), 2);
    let newest = codec::decode(&std::fs::read(&copies[1]).unwrap(), 1).unwrap();
    assert_eq!(newest.get(0).unwrap().amount, 3);
}

#[tokio::test]
async fn test_shutdown_drains_every_session() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _events) = open_manager(&temp_dir, 1);

    for owner in ["a", "b", "c"] {
        let session = manager.open_vault(owner, 1).await.unwrap();
        session
            .edit(|c| c.set(8, Some(ItemStack::new("TORCH", 16))))
            .unwrap()
            .unwrap();
    }
    manager.open_vault("d", 1).await.unwrap();

    assert_eq!(manager.shutdown().await.unwrap(), 4);
    assert!(manager.sessions().is_empty().unwrap());
    assert_eq!(manager.store().stats().writes, 3);
    for owner in ["a", "b", "c"] {
        assert!(manager.store().exists(&key(owner, 1)));
    }
    assert!(!manager.store().exists(&key("d", 1)));
    assert_eq!(manager.sequencer().stats().active_lanes, 0);
}

/// File store whose writes can be made to fail on demand.
struct FlakyStore {
    inner: FileRecordStore,
    fail_writes: AtomicBool,
}

impl RecordStore for FlakyStore {
    fn read(&self, key: &VaultKey) -> vaultstore::Result<Vec<u8>> {
        self.inner.read(key)
    }

    fn write(&self, key: &VaultKey, blob: &[u8]) -> vaultstore::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VaultError::io(
                format!("write {}", key),
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.write(key, blob)
    }

    fn exists(&self, key: &VaultKey) -> bool {
        self.inner.exists(key)
    }

    fn delete(&self, key: &VaultKey) -> vaultstore::Result<()> {
        self.inner.delete(key)
    }

    fn stat(&self, key: &VaultKey) -> vaultstore::Result<RecordMeta> {
        self.inner.stat(key)
    }

    fn list_indices(&self, owner_id: &str) -> vaultstore::Result<Vec<u32>> {
        self.inner.list_indices(owner_id)
    }

    fn list_owners(&self) -> vaultstore::Result<Vec<String>> {
        self.inner.list_owners()
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }
}

#[tokio::test]
async fn test_failed_save_keeps_session_dirty() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore {
        inner: FileRecordStore::open(temp_dir.path(), BackupManager::disabled()).unwrap(),
        fail_writes: AtomicBool::new(true),
    });
    let (manager, mut events) = VaultManager::with_store(
        VaultConfig::new(temp_dir.path()),
        store.clone(),
        Arc::new(StaticPermissions::new(1)),
    )
    .unwrap();

    let session = manager.open_vault("u1", 1).await.unwrap();
    session
        .edit(|c| c.set(0, Some(ItemStack::new("APPLE", 2))))
        .unwrap()
        .unwrap();

    assert!(matches!(
        manager.close_vault("u1").await,
        Err(VaultError::IoFailure { .. })
    ));
    assert!(session.is_dirty().unwrap());
    assert!(manager.sessions().get("u1").unwrap().is_some());
    assert!(
        events
            .drain()
            .iter()
            .any(|event| matches!(event, VaultEvent::SaveFailed { .. }))
    );

    store.fail_writes.store(false, Ordering::SeqCst);
    manager.close_vault("u1").await.unwrap();
    assert!(!session.is_dirty().unwrap());
    assert!(store.exists(&key("u1", 1)));
}

struct SlowStore {
    inner: FileRecordStore,
    read_delay: Duration,
}

impl RecordStore for SlowStore {
    fn read(&self, key: &VaultKey) -> vaultstore::Result<Vec<u8>> {
        std::thread::sleep(self.read_delay);
        self.inner.read(key)
    }

    fn write(&self, key: &VaultKey, blob: &[u8]) -> vaultstore::Result<()> {
        self.inner.write(key, blob)
    }

    fn exists(&self, key: &VaultKey) -> bool {
        self.inner.exists(key)
    }

    fn delete(&self, key: &VaultKey) -> vaultstore::Result<()> {
        self.inner.delete(key)
    }

    fn stat(&self, key: &VaultKey) -> vaultstore::Result<RecordMeta> {
        self.inner.stat(key)
    }

    fn list_indices(&self, owner_id: &str) -> vaultstore::Result<Vec<u32>> {
        self.inner.list_indices(owner_id)
    }

    fn list_owners(&self) -> vaultstore::Result<Vec<String>> {
        self.inner.list_owners()
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }
}

fn slow_manager(temp_dir: &TempDir) -> Arc<VaultManager> {
    let store = SlowStore {
        inner: FileRecordStore::open(temp_dir.path(), BackupManager::disabled()).unwrap(),
        read_delay: Duration::from_millis(200),
    };
    let mut stored = Container::new(6).unwrap();
    stored.set(0, Some(ItemStack::new("DIAMOND", 64))).unwrap();
    store
        .write(&key("u1", 1), &codec::encode(&stored).unwrap())
        .unwrap();

    let (manager, _events) = VaultManager::with_store(
        VaultConfig::new(temp_dir.path()).with_max_vault_amount(2),
        Arc::new(store),
        Arc::new(StaticPermissions::new(2)),
    )
    .unwrap();
    manager
}

async fn wait_for_claim(manager: &VaultManager, owner: &str) {
    while manager.sessions().get(owner).unwrap().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn stored_diamonds(manager: &VaultManager) -> u8 {
    let blob = manager.store().read(&key("u1", 1)).unwrap();
    codec::decode(&blob, 6).unwrap().get(0).map_or(0, |item| item.amount)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_during_load_keeps_stored_contents() {
    let temp_dir = TempDir::new().unwrap();
    let manager = slow_manager(&temp_dir);

    let opener = manager.clone();
    let opening = tokio::spawn(async move { opener.open_vault("u1", 1).await });
    wait_for_claim(&manager, "u1").await;

    assert!(matches!(
        manager.sessions().mark_dirty("u1"),
        Err(VaultError::StillLoading(_))
    ));
    manager.close_vault("u1").await.unwrap();
    assert!(manager.sessions().get("u1").unwrap().is_none());

    // Either the open lost the race or it handed out a handle the close then released.
    match opening.await.unwrap() {
        Err(err) => assert!(matches!(err, VaultError::OpenCancelled(_))),
        Ok(session) => assert!(matches!(
            session.edit(|c| c.clear()),
            Err(VaultError::NotOpen(_))
        )),
    }

    assert_eq!(stored_diamonds(&manager), 64);
    assert_eq!(manager.store().stats().writes, 1);
    assert!(manager.open_vault("u1", 2).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_preview_during_load_reads_stored_contents() {
    let temp_dir = TempDir::new().unwrap();
    let manager = slow_manager(&temp_dir);

    let opener = manager.clone();
    let opening = tokio::spawn(async move { opener.open_vault("u1", 1).await });
    wait_for_claim(&manager, "u1").await;

    let preview = manager.preview_vault("u1", 1).await.unwrap();
    assert_eq!(preview.get(0).unwrap().amount, 64);

    let session = opening.await.unwrap().unwrap();
    assert_eq!(session.contents().unwrap().get(0).unwrap().amount, 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_during_load_leaves_no_live_handle() {
    let temp_dir = TempDir::new().unwrap();
    let manager = slow_manager(&temp_dir);

    let opener = manager.clone();
    let opening = tokio::spawn(async move { opener.open_vault("u1", 1).await });
    wait_for_claim(&manager, "u1").await;

    manager.shutdown().await.unwrap();
    assert!(manager.sessions().is_empty().unwrap());

    match opening.await.unwrap() {
        Err(err) => assert!(matches!(err, VaultError::ShuttingDown)),
        Ok(session) => assert!(session.edit(|c| c.clear()).is_err()),
    }
    assert_eq!(stored_diamonds(&manager), 64);
    assert!(matches!(
        manager.open_vault("u1", 2).await,
        Err(VaultError::ShuttingDown)
    ));
}
