//! Binary encoding of vault contents.
//!
//! A current blob is a fixed header followed by a MessagePack payload:
//!
//! ```text
//! +--------+---------+------+-------------+------------------+
//! | "PVLT" | version | rows | payload len | payload          |
//! | 4 B    | 1 B     | 1 B  | u32 LE      | rmp (named) list |
//! +--------+---------+------+-------------+------------------+
//! ```
//!
//! The payload is a sparse list of `(slot, item)` entries. Blobs written by the
//! old per-identity layout are JSON; [`decode`] reports them as
//! [`VaultError::LegacyFormat`] and [`decode_legacy`] converts them.

mod legacy;

pub use legacy::decode_legacy;

use crate::core::{Container, ItemStack, MAX_ROWS, Result, SLOTS_PER_ROW, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const MAGIC: [u8; 4] = *b"PVLT";
pub const FORMAT_VERSION: u8 = 2;
pub const HEADER_LEN: usize = 10;
pub const MAX_PAYLOAD_BYTES: usize = 1 << 20;

const MAX_SLOTS: usize = MAX_ROWS as usize * SLOTS_PER_ROW;
const MAX_TEXT_LEN: usize = 1024;
const MAX_LIST_LEN: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    slot: u16,
    item: ItemStack,
}

pub fn encode(container: &Container) -> Result<Vec<u8>> {
    let entries = container
        .occupied()
        .map(|(slot, item)| WireEntry {
            slot: slot as u16,
            item: item.clone(),
        })
        .collect::<Vec<_>>();

    let payload = rmp_serde::to_vec_named(&entries)
        .map_err(|e| VaultError::ExecutionError(format!("Failed to encode vault: {}", e)))?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(VaultError::ExecutionError(format!(
            "Encoded vault exceeds {} bytes",
            MAX_PAYLOAD_BYTES
        )));
    }

    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(&MAGIC);
    blob.push(FORMAT_VERSION);
    blob.push(container.rows());
    blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Decodes a current-format blob into a container of at least `rows` rows.
///
/// The container grows beyond `rows` when the blob holds items past the
/// requested size, so a lowered default never drops contents.
pub fn decode(blob: &[u8], rows: u8) -> Result<Container> {
    if is_legacy(blob) {
        return Err(VaultError::LegacyFormat);
    }
    let payload = checked_payload(blob)?;

    let entries: Vec<WireEntry> = rmp_serde::from_slice(payload)
        .map_err(|e| VaultError::CorruptData(format!("payload: {}", e)))?;

    let mut seen = HashSet::with_capacity(entries.len());
    for entry in &entries {
        let slot = entry.slot as usize;
        if slot >= MAX_SLOTS {
            return Err(VaultError::CorruptData(format!("slot {} out of range", slot)));
        }
        if !seen.insert(slot) {
            return Err(VaultError::CorruptData(format!("duplicate slot {}", slot)));
        }
        validate_item(slot, &entry.item)?;
    }

    let needed = entries
        .iter()
        .map(|entry| Container::rows_for_slot(entry.slot as usize))
        .max()
        .unwrap_or(1);
    let mut container = Container::new(rows.max(needed))?;
    for entry in entries {
        container.set(entry.slot as usize, Some(entry.item))?;
    }
    Ok(container)
}

/// Reads the stored row count without decoding the payload.
pub fn peek_rows(blob: &[u8]) -> Result<u8> {
    if is_legacy(blob) {
        return Err(VaultError::LegacyFormat);
    }
    checked_payload(blob)?;
    Ok(blob[5])
}

/// True when the blob is JSON written by the legacy layout.
pub fn is_legacy(blob: &[u8]) -> bool {
    blob.iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'{')
}

fn checked_payload(blob: &[u8]) -> Result<&[u8]> {
    if blob.len() < HEADER_LEN {
        return Err(VaultError::CorruptData(format!(
            "truncated header ({} bytes)",
            blob.len()
        )));
    }
    if blob[..4] != MAGIC {
        return Err(VaultError::CorruptData("bad magic".to_string()));
    }
    if blob[4] != FORMAT_VERSION {
        return Err(VaultError::CorruptData(format!(
            "unsupported format version {}",
            blob[4]
        )));
    }
    let stored_rows = blob[5];
    if stored_rows == 0 || stored_rows > MAX_ROWS {
        return Err(VaultError::CorruptData(format!(
            "stored row count {} out of range",
            stored_rows
        )));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&blob[6..HEADER_LEN]);
    let declared = u32::from_le_bytes(len_bytes) as usize;
    let actual = blob.len() - HEADER_LEN;
    if declared > MAX_PAYLOAD_BYTES {
        return Err(VaultError::CorruptData(format!(
            "declared payload of {} bytes exceeds limit",
            declared
        )));
    }
    if declared != actual {
        return Err(VaultError::CorruptData(format!(
            "declared payload of {} bytes but {} present",
            declared, actual
        )));
    }
    Ok(&blob[HEADER_LEN..])
}

pub(crate) fn validate_item(slot: usize, item: &ItemStack) -> Result<()> {
    let corrupt = |what: &str| VaultError::CorruptData(format!("slot {}: {}", slot, what));

    if item.material.is_empty() || item.material.len() > MAX_TEXT_LEN {
        return Err(corrupt("invalid material"));
    }
    if item.amount == 0 {
        return Err(corrupt("zero amount"));
    }

    let meta = &item.meta;
    let long_text = meta
        .display_name
        .iter()
        .chain(meta.lore.iter())
        .chain(meta.custom_data.keys())
        .chain(meta.custom_data.values())
        .chain(meta.enchantments.keys())
        .any(|text| text.len() > MAX_TEXT_LEN);
    if long_text {
        return Err(corrupt("text field too long"));
    }
    if meta.lore.len() > MAX_LIST_LEN
        || meta.enchantments.len() > MAX_LIST_LEN
        || meta.attributes.len() > MAX_LIST_LEN
        || meta.custom_data.len() > MAX_LIST_LEN
    {
        return Err(corrupt("too many metadata entries"));
    }
    if meta.attributes.iter().any(|attr| !attr.amount.is_finite()) {
        return Err(corrupt("non-finite attribute amount"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttributeOperation;

    fn sample() -> Container {
        let mut container = Container::new(3).unwrap();
        container
            .set(
                0,
                Some(
                    ItemStack::new("DIAMOND_SWORD", 1)
                        .with_display_name("Edge")
                        .with_lore("forged in spawn")
                        .with_enchantment("SHARPNESS", 5)
                        .with_attribute("generic.attack_damage", 2.5, AttributeOperation::AddNumber)
                        .with_custom_data("owner", "u1"),
                ),
            )
            .unwrap();
        container.set(26, Some(ItemStack::new("COBBLESTONE", 64))).unwrap();
        container
    }

    #[test]
    fn test_encode_decode_preserves_slots_and_meta() {
        let container = sample();
        let blob = encode(&container).unwrap();
        let decoded = decode(&blob, 3).unwrap();
        assert_eq!(decoded, container);
        assert_eq!(peek_rows(&blob).unwrap(), 3);
    }

    #[test]
    fn test_decode_grows_to_fit_items() {
        let blob = encode(&sample()).unwrap();
        let decoded = decode(&blob, 1).unwrap();
        assert_eq!(decoded.rows(), 3);
        assert!(decoded.same_contents(&sample()));
    }

    #[test]
    fn test_decode_rejects_truncation_at_every_length() {
        let blob = encode(&sample()).unwrap();
        for len in 0..blob.len() {
            let err = decode(&blob[..len], 3).unwrap_err();
            assert!(matches!(err, VaultError::CorruptData(_)), "len {}: {:?}", len, err);
        }
    }

    #[test]
    fn test_decode_rejects_oversized_length_prefix() {
        let mut blob = encode(&sample()).unwrap();
        blob[6..10].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&blob, 3), Err(VaultError::CorruptData(_))));
    }

    #[test]
    fn test_decode_rejects_garbage_payload() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&MAGIC);
        blob.push(FORMAT_VERSION);
        blob.push(1);
        let garbage = [0xc1u8, 0xff, 0x00, 0x13, 0x37];
        blob.extend_from_slice(&(garbage.len() as u32).to_le_bytes());
        blob.extend_from_slice(&garbage);
        assert!(matches!(decode(&blob, 1), Err(VaultError::CorruptData(_))));
    }

    #[test]
    fn test_decode_rejects_out_of_range_slot() {
        let entries = vec![WireEntry {
            slot: 54,
            item: ItemStack::new("STONE", 1),
        }];
        let payload = rmp_serde::to_vec_named(&entries).unwrap();
        let mut blob = Vec::new();
        blob.extend_from_slice(&MAGIC);
        blob.push(FORMAT_VERSION);
        blob.push(6);
        blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        blob.extend_from_slice(&payload);
        assert!(matches!(decode(&blob, 6), Err(VaultError::CorruptData(_))));
    }

    #[test]
    fn test_decode_flags_legacy_json() {
        let blob = br#"  {"size": 9, "items": {}}"#;
        assert!(matches!(decode(blob, 1), Err(VaultError::LegacyFormat)));
    }
}
