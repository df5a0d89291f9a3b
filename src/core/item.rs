use super::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SLOTS_PER_ROW: usize = 9;
pub const MAX_ROWS: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeOperation {
    AddNumber,
    AddScalar,
    MultiplyScalar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeModifier {
    pub attribute: String,
    pub amount: f64,
    pub operation: AttributeOperation,
}

/// Display and enchantment data attached to a stack.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemMeta {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub lore: Vec<String>,
    #[serde(default)]
    pub enchantments: BTreeMap<String, u16>,
    #[serde(default)]
    pub attributes: Vec<AttributeModifier>,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
}

impl ItemMeta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStack {
    pub material: String,
    pub amount: u8,
    #[serde(default)]
    pub damage: u16,
    #[serde(default)]
    pub meta: ItemMeta,
}

impl ItemStack {
    pub fn new(material: impl Into<String>, amount: u8) -> Self {
        Self {
            material: material.into(),
            amount,
            damage: 0,
            meta: ItemMeta::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.meta.display_name = Some(name.into());
        self
    }

    pub fn with_lore(mut self, line: impl Into<String>) -> Self {
        self.meta.lore.push(line.into());
        self
    }

    pub fn with_enchantment(mut self, name: impl Into<String>, level: u16) -> Self {
        self.meta.enchantments.insert(name.into(), level);
        self
    }

    pub fn with_attribute(
        mut self,
        attribute: impl Into<String>,
        amount: f64,
        operation: AttributeOperation,
    ) -> Self {
        self.meta.attributes.push(AttributeModifier {
            attribute: attribute.into(),
            amount,
            operation,
        });
        self
    }

    pub fn with_custom_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.custom_data.insert(key.into(), value.into());
        self
    }
}

/// The live contents of one vault: `rows * 9` slots, each empty or holding a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    rows: u8,
    slots: Vec<Option<ItemStack>>,
}

impl Container {
    pub fn new(rows: u8) -> Result<Self> {
        if rows == 0 || rows > MAX_ROWS {
            return Err(VaultError::InvalidRows {
                rows,
                max: MAX_ROWS,
            });
        }
        Ok(Self {
            rows,
            slots: vec![None; rows as usize * SLOTS_PER_ROW],
        })
    }

    /// Smallest row count able to hold `slot`.
    pub fn rows_for_slot(slot: usize) -> u8 {
        (slot / SLOTS_PER_ROW + 1) as u8
    }

    pub fn rows(&self) -> u8 {
        self.rows
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<&ItemStack> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Places `item` into `slot`, returning whatever was there before.
    pub fn set(&mut self, slot: usize, item: Option<ItemStack>) -> Result<Option<ItemStack>> {
        let size = self.size();
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(VaultError::SlotOutOfRange { slot, size })?;
        Ok(std::mem::replace(entry, item))
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ItemStack)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, item)| item.as_ref().map(|item| (slot, item)))
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied().count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied_count() == 0
    }

    /// Slot-by-slot equality of contents, ignoring trailing empty rows.
    pub fn same_contents(&self, other: &Container) -> bool {
        self.occupied().eq(other.occupied())
    }
}
