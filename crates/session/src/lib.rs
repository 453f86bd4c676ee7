//! Setu Session - double-buffered session table
//!
//! An open-addressed hash table over two fixed entry arrays plus a pair
//! of epoch sequence counters. Eviction is a logical sweep: `swap()`
//! retires the current epoch into the previous one, and entries older
//! than two swaps simply stop matching any live sequence. An entry
//! therefore survives at least one and at most two swap intervals, with
//! no per-entry timers and no allocator work after construction.
//!
//! Each table is exclusively owned by one worker; there is no interior
//! locking.

use setu_common::{hash_address, Address};

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Address,
    value: u32,
    sequence: u64,
}

const EMPTY_ENTRY: Entry = Entry {
    key: Address::None,
    value: 0,
    sequence: 0,
};

pub struct SessionTable {
    // entries[current] is the current epoch, entries[current ^ 1] the previous
    entries: [Vec<Entry>; 2],
    current: usize,
    current_sequence: u64,
    previous_sequence: u64,
    mask: u64,
}

impl SessionTable {
    /// Create a table with `capacity` entries per epoch. Capacity must
    /// be a power of two; keep the live key count under half of it.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        Self {
            entries: [vec![EMPTY_ENTRY; capacity], vec![EMPTY_ENTRY; capacity]],
            current: 0,
            current_sequence: 1,
            previous_sequence: 0,
            mask: (capacity - 1) as u64,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries[0].len()
    }

    /// Insert a key assumed absent from the current epoch. Linear-probes
    /// past live entries and claims the first dead slot. On a full
    /// epoch (which configured slot counts cannot reach) the insert is
    /// silently dropped after one sweep.
    pub fn insert(&mut self, key: Address, value: u32) {
        debug_assert!(key.is_ipv4());
        let sequence = self.current_sequence;
        let mask = self.mask;
        let mut index = hash_address(&key) & mask;
        let table = &mut self.entries[self.current];
        for _ in 0..table.len() {
            let entry = &mut table[index as usize];
            if entry.sequence != sequence || !entry.key.is_ipv4() {
                *entry = Entry {
                    key,
                    value,
                    sequence,
                };
                return;
            }
            index = (index + 1) & mask;
        }
    }

    /// Look up a key. A hit in the previous epoch is re-inserted into
    /// the current one so a live session keeps renewing itself across
    /// swaps.
    pub fn get(&mut self, key: &Address) -> Option<u32> {
        if let Some(value) = self.probe(self.current, self.current_sequence, key) {
            return Some(value);
        }
        let value = self.probe(self.current ^ 1, self.previous_sequence, key)?;
        self.insert(*key, value);
        Some(value)
    }

    /// Insert `value` if `key` is not already present in either epoch.
    /// Returns true when the key was newly inserted.
    pub fn update(&mut self, key: Address, value: u32) -> bool {
        if self.get(&key).is_some() {
            return false;
        }
        self.insert(key, value);
        true
    }

    /// Retire the current epoch. Entries inserted before this call stay
    /// visible to `get` until the next swap; entries from before the
    /// previous swap are gone.
    pub fn swap(&mut self) {
        self.current ^= 1;
        self.previous_sequence = self.current_sequence;
        self.current_sequence += 1;
    }

    fn probe(&self, table_index: usize, sequence: u64, key: &Address) -> Option<u32> {
        let table = &self.entries[table_index];
        let mask = self.mask;
        let mut index = hash_address(key) & mask;
        for _ in 0..table.len() {
            let entry = &table[index as usize];
            if entry.sequence != sequence || !entry.key.is_ipv4() {
                return None;
            }
            if entry.key == *key {
                return Some(entry.value);
            }
            index = (index + 1) & mask;
        }
        None
    }
}
