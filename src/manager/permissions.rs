use crate::core::Result;
use std::collections::HashMap;
use std::sync::RwLock;

/// Answers "how many vaults may this owner open right now".
///
/// Consulted on every open; grants can change between calls.
pub trait PermissionSource: Send + Sync {
    fn max_allowed(&self, owner_id: &str) -> Result<u32>;
}

/// Base limit from configuration plus per-owner grants.
pub struct StaticPermissions {
    base: u32,
    overrides: RwLock<HashMap<String, u32>>,
}

impl StaticPermissions {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn grant(&self, owner_id: impl Into<String>, max: u32) -> Result<()> {
        self.overrides.write()?.insert(owner_id.into(), max);
        Ok(())
    }

    pub fn revoke(&self, owner_id: &str) -> Result<Option<u32>> {
        Ok(self.overrides.write()?.remove(owner_id))
    }
}

impl PermissionSource for StaticPermissions {
    fn max_allowed(&self, owner_id: &str) -> Result<u32> {
        Ok(self
            .overrides
            .read()?
            .get(owner_id)
            .copied()
            .unwrap_or(self.base))
    }
}
