use super::worker::BackgroundWorker;
use crate::config::PurgePolicy;
use crate::core::{Result, VaultError, VaultKey};
use crate::manager::{VaultEvent, VaultManager};
use crate::storage::RecordMeta;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{Level, event, info_span};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub scanned: usize,
    pub deleted: usize,
    pub skipped_open: usize,
    pub skipped_fresh: usize,
    pub failed: usize,
}

enum SweepOutcome {
    Deleted,
    Open,
    Fresh,
}

/// Hard-deletes vaults whose record has not been modified within `max_age`.
#[derive(Debug, Clone)]
pub struct RetentionJob {
    max_age: Duration,
}

impl RetentionJob {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn from_policy(policy: &PurgePolicy) -> Self {
        Self::new(policy.max_age())
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub async fn sweep(&self, manager: &VaultManager) -> Result<RetentionReport> {
        self.sweep_at(manager, Utc::now()).await
    }

    /// One pass over every stored record, judged against `now`.
    ///
    /// Each delete runs on the owner's lane and re-checks the session table and
    /// the record's mtime there, so a save queued ahead of it always wins.
    pub async fn sweep_at(
        &self,
        manager: &VaultManager,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let cutoff = now - self.max_age;
        let store = manager.store().clone();
        let (records, unreadable) = tokio::task::spawn_blocking(move || collect_records(store.as_ref()))
            .await
            .map_err(|err| VaultError::ExecutionError(format!("retention scan: {}", err)))??;

        let mut report = RetentionReport {
            scanned: records.len() + unreadable,
            failed: unreadable,
            ..RetentionReport::default()
        };

        for meta in records {
            let key = meta.key;
            if manager.sessions().is_open(&key)? {
                report.skipped_open += 1;
                continue;
            }
            if meta.modified > cutoff {
                report.skipped_fresh += 1;
                continue;
            }

            let store = manager.store().clone();
            let sessions = manager.sessions().clone();
            let sweep_key = key.clone();
            let outcome = manager
                .sequencer()
                .submit(key.owner_id(), move || {
                    let span = info_span!("vault.retention", key = %sweep_key);
                    let _enter = span.enter();
                    if sessions.is_open(&sweep_key)? {
                        return Ok(SweepOutcome::Open);
                    }
                    if store.stat(&sweep_key)?.modified > cutoff {
                        return Ok(SweepOutcome::Fresh);
                    }
                    store.delete(&sweep_key)?;
                    Ok(SweepOutcome::Deleted)
                })
                .await;

            match outcome {
                Ok(SweepOutcome::Deleted) => {
                    report.deleted += 1;
                    event!(Level::INFO, key = %key, "stale vault purged");
                    manager.notify(VaultEvent::Deleted { key });
                }
                Ok(SweepOutcome::Open) => report.skipped_open += 1,
                Ok(SweepOutcome::Fresh) => report.skipped_fresh += 1,
                // Removed by someone else between the scan and the delete.
                Err(VaultError::NotFound(_)) => {}
                Err(err) => {
                    report.failed += 1;
                    event!(Level::WARN, key = %key, error = %err, "stale vault could not be purged");
                }
            }
        }

        event!(
            Level::INFO,
            scanned = report.scanned,
            deleted = report.deleted,
            skipped_open = report.skipped_open,
            skipped_fresh = report.skipped_fresh,
            failed = report.failed,
            "retention sweep finished"
        );
        manager.notify(VaultEvent::RetentionReport(report.clone()));
        Ok(report)
    }
}

fn collect_records(store: &dyn crate::storage::RecordStore) -> Result<(Vec<RecordMeta>, usize)> {
    let mut records = Vec::new();
    let mut unreadable = 0;
    for owner in store.list_owners()? {
        let indices = match store.list_indices(&owner) {
            Ok(indices) => indices,
            Err(err) => {
                unreadable += 1;
                event!(Level::WARN, owner = %owner, error = %err, "cannot list owner vaults");
                continue;
            }
        };
        for index in indices {
            let key = VaultKey::new(owner.as_str(), index)?;
            match store.stat(&key) {
                Ok(meta) => records.push(meta),
                Err(VaultError::NotFound(_)) => {}
                Err(err) => {
                    unreadable += 1;
                    event!(Level::WARN, key = %key, error = %err, "cannot stat vault record");
                }
            }
        }
    }
    Ok((records, unreadable))
}

/// Runs a sweep every `policy.interval_secs`.
pub fn spawn_retention_worker(
    manager: Arc<VaultManager>,
    policy: &PurgePolicy,
) -> Result<BackgroundWorker> {
    if !policy.enabled {
        return Err(VaultError::Config(
            "purge.enabled must be set to start the retention worker".to_string(),
        ));
    }
    let job = RetentionJob::from_policy(policy);
    Ok(BackgroundWorker::spawn(
        "retention",
        policy.interval(),
        move || {
            let manager = manager.clone();
            let job = job.clone();
            async move { job.sweep(&manager).await.map(|_| ()) }
        },
    ))
}
