use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Coarse occupancy of one index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotState {
    NotRunning,
    Deleted,
    Creating,
    Running,
}

impl SlotState {
    pub fn is_reusable(self) -> bool {
        matches!(self, SlotState::NotRunning | SlotState::Deleted)
    }
}

/// Index slots of a node group with the highest index handed out so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LedgerRecord", into = "LedgerRecord")]
pub struct IndexLedger {
    slots: BTreeMap<u32, SlotState>,
    high_water_mark: u32,
}

/// Stored form of the ledger. Slots are kept as a list since integer map keys do not survive
/// a load through a flattened parent.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LedgerRecord {
    slots: Vec<SlotRecord>,
    high_water_mark: u32,
}

#[derive(Serialize, Deserialize)]
struct SlotRecord {
    index: u32,
    state: SlotState,
}

impl From<LedgerRecord> for IndexLedger {
    fn from(record: LedgerRecord) -> Self {
        let slots: BTreeMap<u32, SlotState> = record
            .slots
            .into_iter()
            .map(|slot| (slot.index, slot.state))
            .collect();
        let high_water_mark = slots
            .keys()
            .copied()
            .max()
            .unwrap_or_default()
            .max(record.high_water_mark);
        Self {
            slots,
            high_water_mark,
        }
    }
}

impl From<IndexLedger> for LedgerRecord {
    fn from(ledger: IndexLedger) -> Self {
        Self {
            slots: ledger
                .slots
                .into_iter()
                .map(|(index, state)| SlotRecord { index, state })
                .collect(),
            high_water_mark: ledger.high_water_mark,
        }
    }
}

impl IndexLedger {
    /// Reserves the lowest reusable index in `1..=max_size`, or mints a new one past the
    /// high-water mark. The slot is marked `Creating`.
    ///
    /// Returns `None` when no index is left.
    pub fn allocate(&mut self, max_size: u32) -> Option<u32> {
        match (1..=max_size)
            .find(|index| self.slots.get(index).is_none_or(|state| state.is_reusable()))
        {
            Some(index) => {
                self.set(index, SlotState::Creating);
                Some(index)
            }
            None => self.mint(),
        }
    }

    /// Mints an index past the high-water mark without reusing free slots.
    pub fn mint(&mut self) -> Option<u32> {
        let index = self.high_water_mark.checked_add(1)?;
        self.set(index, SlotState::Creating);
        Some(index)
    }

    pub fn set(&mut self, index: u32, state: SlotState) {
        self.slots.insert(index, state);
        self.high_water_mark = self.high_water_mark.max(index);
    }

    pub fn get(&self, index: u32) -> Option<SlotState> {
        self.slots.get(&index).copied()
    }

    pub fn is_occupied(&self, index: u32) -> bool {
        self.get(index).is_some_and(|state| !state.is_reusable())
    }

    pub fn high_water_mark(&self) -> u32 {
        self.high_water_mark
    }

    pub fn slots(&self) -> impl Iterator<Item = (u32, SlotState)> + '_ {
        self.slots.iter().map(|(index, state)| (*index, *state))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.high_water_mark = 0;
    }
}

/// `{group}-{prefix}-{index}` with the index zero-padded to two digits.
pub fn node_name(group: &str, prefix: &str, index: u32) -> String {
    format!("{group}-{prefix}-{index:02}")
}
