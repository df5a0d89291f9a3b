use super::{Result, VaultError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref OWNER_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
}

/// Returns an error unless `owner_id` is usable as a single path component.
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    if OWNER_ID_PATTERN.is_match(owner_id) {
        Ok(())
    } else {
        Err(VaultError::InvalidOwner(owner_id.to_string()))
    }
}

/// Identifies one vault: the owner's stable id plus a 1-based index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultKey {
    owner_id: String,
    index: u32,
}

impl VaultKey {
    pub fn new(owner_id: impl Into<String>, index: u32) -> Result<Self> {
        let owner_id = owner_id.into();
        validate_owner_id(&owner_id)?;
        if index == 0 {
            return Err(VaultError::IndexOutOfRange { index, max: 0 });
        }
        Ok(Self { owner_id, index })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner_id, self.index)
    }
}
