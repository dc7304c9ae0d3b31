//! Slotted mutex: per-key mutual exclusion without per-key allocation

use std::sync::{Mutex, MutexGuard};

use crate::common::lock_slot;

/// Default slot count. Large enough to keep hash-collision serialization
/// between unrelated keys unlikely.
pub const DEFAULT_SLOTS: usize = 256;

/// A fixed table of mutexes indexed by a hash of the key. Two writers on
/// keys in different slots proceed in parallel; writers on the same slot
/// (same key or hash collision) serialize.
pub struct SlottedMutex {
    slots: Vec<Mutex<()>>,
}

impl SlottedMutex {
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_SLOTS)
    }

    /// `slots` must be a power of two.
    pub fn with_slots(slots: usize) -> Self {
        assert!(slots.is_power_of_two(), "slot count must be a power of two");
        Self {
            slots: (0..slots).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquire the slot lock for `key`; the guard brackets the entire
    /// read-modify-write critical section.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let slot = lock_slot(key, self.slots.len());
        self.slots[slot].lock().expect("lock poisoned")
    }
}

impl Default for SlottedMutex {
    fn default() -> Self {
        Self::new()
    }
}
