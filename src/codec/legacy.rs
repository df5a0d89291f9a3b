use super::{MAX_SLOTS, validate_item};
use crate::core::{Container, ItemMeta, ItemStack, Result, SLOTS_PER_ROW, VaultError};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct LegacyVault {
    #[serde(default)]
    size: Option<usize>,
    #[serde(default)]
    items: BTreeMap<String, LegacyItem>,
}

#[derive(Debug, Deserialize)]
struct LegacyItem {
    #[serde(rename = "type")]
    material: String,
    #[serde(default = "default_amount")]
    amount: u8,
    #[serde(default)]
    durability: u16,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    lore: Vec<String>,
    #[serde(default)]
    enchants: BTreeMap<String, u16>,
}

fn default_amount() -> u8 {
    1
}

impl From<LegacyItem> for ItemStack {
    fn from(item: LegacyItem) -> Self {
        Self {
            material: item.material,
            amount: item.amount,
            damage: item.durability,
            meta: ItemMeta {
                display_name: item.name,
                lore: item.lore,
                enchantments: item.enchants,
                ..ItemMeta::default()
            },
        }
    }
}

/// Converts a JSON blob from the per-identity layout into a container.
pub fn decode_legacy(blob: &[u8], rows: u8) -> Result<Container> {
    if blob.len() > super::MAX_PAYLOAD_BYTES {
        return Err(VaultError::CorruptData("legacy blob too large".to_string()));
    }
    let vault: LegacyVault = serde_json::from_slice(blob)
        .map_err(|e| VaultError::CorruptData(format!("legacy json: {}", e)))?;

    let mut items = Vec::with_capacity(vault.items.len());
    for (slot, item) in vault.items {
        let slot = slot
            .parse::<usize>()
            .map_err(|_| VaultError::CorruptData(format!("legacy slot '{}' is not a number", slot)))?;
        if slot >= MAX_SLOTS {
            return Err(VaultError::CorruptData(format!("legacy slot {} out of range", slot)));
        }
        let item = ItemStack::from(item);
        validate_item(slot, &item)?;
        items.push((slot, item));
    }

    let declared_rows = vault
        .size
        .map(|size| size.div_ceil(SLOTS_PER_ROW).min(MAX_SLOTS / SLOTS_PER_ROW) as u8)
        .unwrap_or(0);
    let needed = items
        .iter()
        .map(|(slot, _)| Container::rows_for_slot(*slot))
        .max()
        .unwrap_or(1);

    let mut container = Container::new(rows.max(declared_rows).max(needed))?;
    for (slot, item) in items {
        container.set(slot, Some(item))?;
    }
    Ok(container)
}
