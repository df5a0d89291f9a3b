//! In-memory table of vaults currently open for editing.
//!
//! Each owner may have at most one session at a time, whichever index it is
//! for. Nothing here survives a restart.

use crate::core::{Container, Result, VaultError, VaultKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type SessionHandle = Arc<Session>;

/// Where a session is in its life. A claimed slot stays `Loading` until the
/// stored contents have been read on the owner's lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Loading,
    Open,
    Closed,
}

#[derive(Debug)]
struct SessionState {
    container: Container,
    phase: SessionPhase,
    dirty: bool,
    revision: u64,
}

/// A vault open for live editing.
#[derive(Debug)]
pub struct Session {
    id: u64,
    key: VaultKey,
    opened_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: u64, key: VaultKey, placeholder: Container) -> Self {
        Self {
            id,
            key,
            opened_at: Utc::now(),
            state: Mutex::new(SessionState {
                container: placeholder,
                phase: SessionPhase::Loading,
                dirty: false,
                revision: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &VaultKey {
        &self.key
    }

    pub fn owner_id(&self) -> &str {
        self.key.owner_id()
    }

    pub fn index(&self) -> u32 {
        self.key.index()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn phase(&self) -> Result<SessionPhase> {
        Ok(self.state.lock()?.phase)
    }

    pub fn is_loading(&self) -> Result<bool> {
        Ok(self.phase()? == SessionPhase::Loading)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(self.state.lock()?.dirty)
    }

    fn ensure_open(&self, state: &SessionState) -> Result<()> {
        match state.phase {
            SessionPhase::Open => Ok(()),
            SessionPhase::Loading => Err(VaultError::StillLoading(self.key.clone())),
            SessionPhase::Closed => Err(VaultError::NotOpen(self.owner_id().to_string())),
        }
    }

    pub fn mark_dirty(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        self.ensure_open(&state)?;
        state.dirty = true;
        state.revision += 1;
        Ok(())
    }

    /// Runs `f` against the live container and marks the session dirty.
    ///
    /// Refused until the load has finished and after the session was released.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Container) -> R) -> Result<R> {
        let mut state = self.state.lock()?;
        self.ensure_open(&state)?;
        let out = f(&mut state.container);
        state.dirty = true;
        state.revision += 1;
        Ok(out)
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Result<Container> {
        let state = self.state.lock()?;
        if state.phase == SessionPhase::Loading {
            return Err(VaultError::StillLoading(self.key.clone()));
        }
        Ok(state.container.clone())
    }

    /// Contents plus the revision they correspond to, if there is anything to save.
    pub(crate) fn pending_snapshot(&self) -> Result<Option<(Container, u64)>> {
        let state = self.state.lock()?;
        if state.phase != SessionPhase::Open || !state.dirty {
            return Ok(None);
        }
        Ok(Some((state.container.clone(), state.revision)))
    }

    /// Clears the dirty flag unless an edit landed after `revision` was taken.
    pub(crate) fn mark_saved(&self, revision: u64) -> Result<bool> {
        let mut state = self.state.lock()?;
        if state.revision == revision {
            state.dirty = false;
            return Ok(true);
        }
        Ok(false)
    }

    /// Installs the stored contents and moves the session to `Open`.
    pub(crate) fn load(&self, container: Container, dirty: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.phase != SessionPhase::Loading {
            return Err(VaultError::OpenCancelled(self.key.clone()));
        }
        state.phase = SessionPhase::Open;
        state.container = container;
        state.dirty = dirty;
        if dirty {
            state.revision += 1;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.state.lock()?.phase = SessionPhase::Closed;
        Ok(())
    }
}

/// Owner id → open session.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_id: AtomicU64,
    placeholder_rows: u8,
}

impl SessionTable {
    pub fn new(placeholder_rows: u8) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            placeholder_rows,
        }
    }

    /// Claims the owner's single session slot for `index`.
    ///
    /// `max_allowed` comes from the permission lookup for this call and is
    /// never cached here.
    pub fn try_open(&self, owner_id: &str, index: u32, max_allowed: u32) -> Result<SessionHandle> {
        if index == 0 || index > max_allowed {
            return Err(VaultError::IndexOutOfRange {
                index,
                max: max_allowed,
            });
        }
        let key = VaultKey::new(owner_id, index)?;
        let placeholder = Container::new(self.placeholder_rows)?;

        let mut sessions = self.sessions.lock()?;
        if let Some(existing) = sessions.get(owner_id) {
            return Err(VaultError::AlreadyOpenElsewhere {
                owner_id: owner_id.to_string(),
                open_index: existing.index(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, key, placeholder));
        sessions.insert(owner_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, owner_id: &str) -> Result<Option<SessionHandle>> {
        Ok(self.sessions.lock()?.get(owner_id).cloned())
    }

    /// Whether `key` holds the owner's slot, loaded or not.
    pub fn is_open(&self, key: &VaultKey) -> Result<bool> {
        Ok(self
            .sessions
            .lock()?
            .get(key.owner_id())
            .is_some_and(|session| session.key() == key))
    }

    /// Fails with `StillLoading` while the owner's vault is being read.
    pub fn mark_dirty(&self, owner_id: &str) -> Result<bool> {
        match self.get(owner_id)? {
            Some(session) => {
                session.mark_dirty()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes `session` if it is still the owner's current one.
    pub fn release(&self, session: &Session) -> Result<bool> {
        let mut sessions = self.sessions.lock()?;
        match sessions.get(session.owner_id()) {
            Some(current) if current.id() == session.id() => {
                sessions.remove(session.owner_id());
                session.close()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn open_sessions(&self) -> Result<Vec<SessionHandle>> {
        Ok(self.sessions.lock()?.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.sessions.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
