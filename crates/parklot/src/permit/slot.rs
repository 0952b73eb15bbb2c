//! Physical slot identity and the occupancy table.
//!
//! The table is plain data; locking is the pool's job. Every method here
//! assumes the caller already holds the pool's occupancy lock.

use serde::{Deserialize, Serialize};

/// Index of a physical parking slot, `0..capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-size occupied/free table, one entry per physical slot.
#[derive(Debug, Clone)]
pub(crate) struct Occupancy {
    slots: Vec<bool>,
    peak: usize,
}

impl Occupancy {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity],
            peak: 0,
        }
    }

    /// Mark the lowest free slot occupied and return it.
    pub fn claim_lowest(&mut self) -> Option<SlotIndex> {
        let index = self.slots.iter().position(|occupied| !occupied)?;
        self.slots[index] = true;
        self.peak = self.peak.max(self.occupied());
        Some(SlotIndex(index))
    }

    /// Mark `slot` free. Returns `false` if it was not occupied (or out of range).
    pub fn free(&mut self, slot: SlotIndex) -> bool {
        match self.slots.get_mut(slot.0) {
            Some(entry) if *entry => {
                *entry = false;
                true
            }
            _ => false,
        }
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|occupied| **occupied).count()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_lowest_free_index() {
        let mut table = Occupancy::new(3);
        assert_eq!(table.claim_lowest(), Some(SlotIndex::new(0)));
        assert_eq!(table.claim_lowest(), Some(SlotIndex::new(1)));
        assert_eq!(table.claim_lowest(), Some(SlotIndex::new(2)));

        assert!(table.free(SlotIndex::new(1)));
        assert_eq!(table.as_slice(), &[true, false, true]);
        assert_eq!(table.claim_lowest(), Some(SlotIndex::new(1)));
    }

    #[test]
    fn full_table_has_nothing_to_claim() {
        let mut table = Occupancy::new(1);
        assert!(table.claim_lowest().is_some());
        assert!(table.claim_lowest().is_none());
    }

    #[test]
    fn freeing_a_free_slot_is_rejected() {
        let mut table = Occupancy::new(2);
        assert!(!table.free(SlotIndex::new(0)));
        assert!(!table.free(SlotIndex::new(5)));
    }

    #[test]
    fn peak_tracks_highest_occupancy() {
        let mut table = Occupancy::new(4);
        let a = table.claim_lowest().unwrap();
        let _b = table.claim_lowest().unwrap();
        table.free(a);
        assert_eq!(table.occupied(), 1);
        assert_eq!(table.peak(), 2);
    }
}
