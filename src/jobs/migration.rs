//! Moves vaults out of the per-identity legacy layout.
//!
//! ```text
//! <legacy_dir>/<legacy identity>/vault<N>.json   ->   <data_dir>/vaults/<owner>/<N>.vault
//! ```
//!
//! Every source goes through `Converting` and `Verifying` on the owner's
//! sequencer lane. A verified source is renamed to `*.json.migrated`, so a
//! second run finds nothing left to do.

use crate::codec;
use crate::core::{Result, VaultError, VaultKey};
use crate::manager::{VaultEvent, VaultManager};
use crate::session::SessionTable;
use crate::storage::RecordStore;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event, info_span};
use uuid::Uuid;

lazy_static! {
    static ref LEGACY_FILE_PATTERN: Regex = Regex::new(r"^vault(\d+)\.json$").unwrap();
}

pub const ARCHIVE_SUFFIX: &str = "migrated";

/// Maps the directory name of the legacy layout to a current owner id.
pub trait IdentityMapper: Send + Sync {
    fn map(&self, legacy_identity: &str) -> Option<String>;
}

/// Accepts any textual UUID form and yields the lowercase hyphenated one.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdentityMapper;

impl IdentityMapper for UuidIdentityMapper {
    fn map(&self, legacy_identity: &str) -> Option<String> {
        Uuid::parse_str(legacy_identity)
            .ok()
            .map(|uuid| uuid.hyphenated().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Scanning,
    Converting(VaultKey),
    Verifying(VaultKey),
    Done,
    Failed { key: VaultKey, cause: String },
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scanning => write!(f, "scanning"),
            Self::Converting(key) => write!(f, "converting {}", key),
            Self::Verifying(key) => write!(f, "verifying {}", key),
            Self::Done => write!(f, "done"),
            Self::Failed { key, cause } => write!(f, "failed {}: {}", key, cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub source: PathBuf,
    pub key: Option<VaultKey>,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub total: usize,
    pub migrated: usize,
    pub already_present: usize,
    pub skipped_open: usize,
    pub unmapped: usize,
    pub failures: Vec<MigrationFailure>,
}

/// One legacy file waiting to be converted.
#[derive(Debug, Clone)]
struct LegacySource {
    path: PathBuf,
    key: VaultKey,
}

enum Outcome {
    Migrated,
    AlreadyPresent,
    Open,
}

pub struct MigrationJob {
    mapper: Arc<dyn IdentityMapper>,
}

impl Default for MigrationJob {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationJob {
    pub fn new() -> Self {
        Self::with_mapper(Arc::new(UuidIdentityMapper))
    }

    pub fn with_mapper(mapper: Arc<dyn IdentityMapper>) -> Self {
        Self { mapper }
    }

    /// Converts every legacy vault not yet present in the record store.
    ///
    /// Fails only if another migration is running or the legacy directory
    /// itself cannot be listed; unreadable identity directories and per-vault
    /// problems end up in the report.
    pub async fn run(&self, manager: &VaultManager) -> Result<MigrationReport> {
        let _running = manager.begin_migration()?;
        let legacy_dir = manager.config().legacy_dir();
        let mut report = MigrationReport::default();

        let state = MigrationState::Scanning;
        event!(Level::INFO, state = %state, dir = %legacy_dir.display(), "migration started");
        let mapper = self.mapper.clone();
        let scan_dir = legacy_dir.clone();
        let scan = tokio::task::spawn_blocking(move || scan_legacy(&scan_dir, mapper.as_ref()))
            .await
            .map_err(|err| VaultError::ExecutionError(format!("legacy scan: {}", err)))??;

        report.unmapped = scan.unmapped;
        report.failures = scan.failures;
        report.total = scan.sources.len();
        let rows = manager.config().default_rows;

        for (done, source) in scan.sources.into_iter().enumerate() {
            let key = source.key.clone();
            if manager.sessions().is_open(&key)? {
                report.skipped_open += 1;
            } else {
                let store = manager.store().clone();
                let sessions = manager.sessions().clone();
                let path = source.path.clone();
                let outcome = manager
                    .sequencer()
                    .submit(key.owner_id(), move || {
                        migrate_one(store.as_ref(), sessions.as_ref(), &source, rows)
                    })
                    .await;

                match outcome {
                    Ok(Outcome::Migrated) => report.migrated += 1,
                    Ok(Outcome::AlreadyPresent) => report.already_present += 1,
                    Ok(Outcome::Open) => report.skipped_open += 1,
                    Err(err) => {
                        let state = MigrationState::Failed {
                            key: key.clone(),
                            cause: err.to_string(),
                        };
                        event!(Level::WARN, state = %state, source = %path.display(), "legacy vault not migrated");
                        report.failures.push(MigrationFailure {
                            source: path,
                            key: Some(key),
                            cause: err.to_string(),
                        });
                    }
                }
            }

            manager.notify(VaultEvent::MigrationProgress {
                done: done + 1,
                total: report.total,
            });
        }

        let state = MigrationState::Done;
        event!(
            Level::INFO,
            state = %state,
            total = report.total,
            migrated = report.migrated,
            already_present = report.already_present,
            skipped_open = report.skipped_open,
            failed = report.failures.len(),
            "migration finished"
        );
        Ok(report)
    }
}

struct LegacyScan {
    sources: Vec<LegacySource>,
    unmapped: usize,
    failures: Vec<MigrationFailure>,
}

fn scan_legacy(legacy_dir: &Path, mapper: &dyn IdentityMapper) -> Result<LegacyScan> {
    let mut scan = LegacyScan {
        sources: Vec::new(),
        unmapped: 0,
        failures: Vec::new(),
    };

    let identities = match fs::read_dir(legacy_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => {
            return Err(VaultError::io(
                format!("list legacy dir {}", legacy_dir.display()),
                e,
            ));
        }
    };

    for identity in identities.flatten() {
        if identity.file_type().is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        let dir = identity.path();
        let identity = identity.file_name().to_string_lossy().into_owned();
        let Some(owner_id) = mapper.map(&identity) else {
            event!(Level::WARN, identity = %identity, "legacy identity has no owner mapping, skipped");
            scan.unmapped += 1;
            continue;
        };

        let files = match fs::read_dir(&dir) {
            Ok(files) => files,
            Err(err) => {
                event!(Level::WARN, dir = %dir.display(), error = %err, "legacy identity directory unreadable, skipped");
                scan.failures.push(MigrationFailure {
                    cause: VaultError::io(format!("list legacy vaults in {}", dir.display()), err)
                        .to_string(),
                    source: dir,
                    key: None,
                });
                continue;
            }
        };
        for file in files.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(captures) = LEGACY_FILE_PATTERN.captures(&name) else {
                continue;
            };
            let path = file.path();
            let key = captures[1]
                .parse::<u32>()
                .map_err(|e| VaultError::CorruptData(format!("legacy index: {}", e)))
                .and_then(|index| VaultKey::new(owner_id.as_str(), index));
            match key {
                Ok(key) => scan.sources.push(LegacySource { path, key }),
                Err(err) => scan.failures.push(MigrationFailure {
                    source: path,
                    key: None,
                    cause: err.to_string(),
                }),
            }
        }
    }

    scan.sources.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(scan)
}

fn migrate_one(
    store: &dyn RecordStore,
    sessions: &SessionTable,
    source: &LegacySource,
    rows: u8,
) -> Result<Outcome> {
    let key = &source.key;
    let span = info_span!("vault.migrate", key = %key);
    let _enter = span.enter();

    if sessions.is_open(key)? {
        return Ok(Outcome::Open);
    }
    if store.exists(key) {
        event!(Level::DEBUG, key = %key, "already migrated, source left in place");
        return Ok(Outcome::AlreadyPresent);
    }

    let state = MigrationState::Converting(key.clone());
    event!(Level::DEBUG, state = %state, "reading legacy source");
    let legacy = fs::read(&source.path)
        .map_err(|e| VaultError::io(format!("read {}", source.path.display()), e))?;
    let container = codec::decode_legacy(&legacy, rows)?;
    store.write(key, &codec::encode(&container)?)?;

    let state = MigrationState::Verifying(key.clone());
    event!(Level::DEBUG, state = %state, "reading back migrated record");
    let verified = store
        .read(key)
        .and_then(|blob| codec::decode(&blob, rows))
        .map(|written| written.same_contents(&container));
    match verified {
        Ok(true) => {}
        Ok(false) => {
            discard_unverified(store, key);
            return Err(VaultError::CorruptData(
                "written record does not match legacy contents".to_string(),
            ));
        }
        Err(err) => {
            discard_unverified(store, key);
            return Err(err);
        }
    }

    let archived = archive_path(&source.path);
    if let Err(err) = fs::rename(&source.path, &archived) {
        // The record is verified; the next run reports the source as already present.
        event!(Level::WARN, key = %key, error = %err, "legacy source could not be archived");
    }
    event!(Level::INFO, key = %key, "legacy vault migrated");
    Ok(Outcome::Migrated)
}

fn discard_unverified(store: &dyn RecordStore, key: &VaultKey) {
    if let Err(err) = store.delete(key) {
        event!(Level::ERROR, key = %key, error = %err, "unverified migrated record could not be removed");
    }
}

fn archive_path(path: &Path) -> PathBuf {
    let mut archived = path.as_os_str().to_owned();
    archived.push(".");
    archived.push(ARCHIVE_SUFFIX);
    PathBuf::from(archived)
}
