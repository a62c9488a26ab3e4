use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::backend::KvBackend;
use crate::keys;

/// Reference counts for locked slots, keyed by `(volume, index)`.
pub(crate) type LockTable = Arc<Mutex<HashMap<(u32, u64), usize>>>;

/// A reference-counted read lock on a sector slot. While any lock on a
/// slot is live, the sector cannot be removed or migrated away.
///
/// `release` is idempotent; dropping an unreleased lock releases it.
pub struct SectorLock {
    table: LockTable,
    backend: Arc<dyn KvBackend>,
    slot: (u32, u64),
    released: AtomicBool,
}

impl std::fmt::Debug for SectorLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorLock")
            .field("slot", &self.slot)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl SectorLock {
    pub(crate) fn acquire(table: LockTable, backend: Arc<dyn KvBackend>, slot: (u32, u64)) -> Self {
        {
            let mut locks = table.lock().expect("lock table poisoned");
            *locks.entry(slot).or_insert(0) += 1;
        }
        // Crash diagnostics only; the table is cleared on startup.
        if let Err(err) = backend.put(&keys::locked_key(slot.0, slot.1), &[]) {
            warn!(volume = slot.0, index = slot.1, %err, "failed to record slot lock");
        }
        Self {
            table,
            backend,
            slot,
            released: AtomicBool::new(false),
        }
    }

    /// Returns whether the slot is still pinned by any lock.
    pub(crate) fn is_locked(table: &LockTable, slot: (u32, u64)) -> bool {
        let locks = table.lock().expect("lock table poisoned");
        locks.get(&slot).copied().unwrap_or(0) > 0
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let fully_released = {
            let mut locks = self.table.lock().expect("lock table poisoned");
            match locks.get_mut(&self.slot) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    locks.remove(&self.slot);
                    true
                }
                None => true,
            }
        };
        if fully_released {
            if let Err(err) = self.backend.delete(&keys::locked_key(self.slot.0, self.slot.1)) {
                warn!(
                    volume = self.slot.0,
                    index = self.slot.1,
                    %err,
                    "failed to clear slot lock record"
                );
            }
        }
    }
}

impl Drop for SectorLock {
    fn drop(&mut self) {
        self.release();
    }
}
