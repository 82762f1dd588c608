//! Hazard pointers protecting in-use pages from eviction.
//!
//! A reader publishes the serial of the page it is about to use, then
//! re-checks the page is still resident; an evictor first moves the
//! reference out of the resident state, then scans for serials. Every
//! operation on a slot is sequentially consistent, so the reader's
//! publish-then-recheck and the evictor's lock-then-scan cannot both
//! miss each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Serial value marking a free slot.
const FREE: u64 = 0;

struct HazardSlot {
    serial: AtomicU64,
}

/// Table of published hazard pointers, one slot per concurrently pinned
/// page. Slots are reused after release; the table only grows.
pub struct HazardTable {
    slots: RwLock<Vec<Arc<HazardSlot>>>,
}

impl HazardTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Publishes `serial` and returns a guard that keeps it published.
    ///
    /// Page serials are never zero, so claiming a slot is a compare and
    /// swap from the free marker.
    pub fn pin(&self, serial: u64) -> HazardGuard {
        debug_assert_ne!(serial, FREE);
        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                if slot
                    .serial
                    .compare_exchange(FREE, serial, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return HazardGuard {
                        slot: Arc::clone(slot),
                    };
                }
            }
        }
        let slot = Arc::new(HazardSlot {
            serial: AtomicU64::new(serial),
        });
        self.slots.write().push(Arc::clone(&slot));
        HazardGuard { slot }
    }

    /// Whether any thread currently has `serial` published.
    pub fn is_pinned(&self, serial: u64) -> bool {
        self.slots
            .read()
            .iter()
            .any(|slot| slot.serial.load(Ordering::SeqCst) == serial)
    }

    /// Number of currently published hazards.
    pub fn active(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.serial.load(Ordering::SeqCst) != FREE)
            .count()
    }
}

impl Default for HazardTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one hazard published; dropping it frees the slot.
pub struct HazardGuard {
    slot: Arc<HazardSlot>,
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.slot.serial.store(FREE, Ordering::SeqCst);
    }
}
