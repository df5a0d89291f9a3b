pub mod error;
pub mod item;
pub mod types;

pub use error::{Result, VaultError};
pub use item::{AttributeModifier, AttributeOperation, Container, ItemMeta, ItemStack, MAX_ROWS, SLOTS_PER_ROW};
pub use types::{VaultKey, validate_owner_id};
