//! Logical to physical partition mapping.

use serde::{Deserialize, Serialize};

use super::traits::PartitionType;

/// How a logical partition is banked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Banking {
    /// Single bank, kept erased between upgrades (DFU loader image).
    SingleKeepErased,
    /// Two banks, not mounted by the filesystem.
    DoubleUnmounted,
    /// Two banks, mounted by the filesystem.
    DoubleMounted,
    /// Single bank, erased when an upgrade starts.
    SingleEraseToUpdate,
}

impl Banking {
    pub fn is_double(&self) -> bool {
        matches!(self, Banking::DoubleUnmounted | Banking::DoubleMounted)
    }
}

/// One upgradable logical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradablePartition {
    pub bank1: u16,
    pub bank2: u16,
    pub banking: Banking,
    pub kind: PartitionType,
}

impl UpgradablePartition {
    pub fn double(bank1: u16, bank2: u16, kind: PartitionType) -> Self {
        Self {
            bank1,
            bank2,
            banking: Banking::DoubleUnmounted,
            kind,
        }
    }

    pub fn single(bank: u16, banking: Banking, kind: PartitionType) -> Self {
        Self {
            bank1: bank,
            bank2: bank,
            banking,
            kind,
        }
    }
}

/// Table indexed by logical partition number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionTable {
    entries: Vec<UpgradablePartition>,
}

impl PartitionTable {
    pub fn new(entries: Vec<UpgradablePartition>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, logical: u16) -> Option<&UpgradablePartition> {
        self.entries.get(logical as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &UpgradablePartition)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i as u16, entry))
    }

    /// Bank currently running for a logical partition.
    pub fn active_physical(&self, logical: u16, bitmap: u16) -> Option<u16> {
        let entry = self.get(logical)?;
        if entry.banking.is_double() && bit_set(bitmap, logical) {
            Some(entry.bank2)
        } else {
            Some(entry.bank1)
        }
    }

    /// Bank an upgrade writes to: the inactive one for double-banked
    /// partitions, the only one otherwise.
    pub fn physical_for_write(&self, logical: u16, bitmap: u16) -> Option<u16> {
        let entry = self.get(logical)?;
        if !entry.banking.is_double() {
            return Some(entry.bank1);
        }
        if bit_set(bitmap, logical) {
            Some(entry.bank1)
        } else {
            Some(entry.bank2)
        }
    }

    /// Banks an erase clears: every inactive double bank and every
    /// single-banked partition.
    pub fn erase_targets(&self, bitmap: u16) -> Vec<u16> {
        self.iter()
            .filter_map(|(logical, _)| self.physical_for_write(logical, bitmap))
            .collect()
    }

    /// Bitmap after swapping every partition written during the upgrade.
    pub fn committed_bitmap(&self, bitmap: u16, pending: u16) -> u16 {
        let double_mask = self
            .iter()
            .filter(|(_, entry)| entry.banking.is_double())
            .fold(0u16, |mask, (logical, _)| mask | bit(logical));
        bitmap ^ (pending & double_mask)
    }
}

pub(crate) fn bit(logical: u16) -> u16 {
    1u16.checked_shl(u32::from(logical)).unwrap_or(0)
}

fn bit_set(bitmap: u16, logical: u16) -> bool {
    bitmap & bit(logical) != 0
}
