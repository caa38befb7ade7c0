//! Per-offset record locks.

use parking_lot::{Mutex, MutexGuard};

use nexus_common::constants::OFFSET_LOCK_COUNT;

/// Guard serializing header mutations of every record in one bucket.
pub type OffsetGuard<'a> = MutexGuard<'a, ()>;

/// A fixed bank of mutexes selected by `offset % OFFSET_LOCK_COUNT`.
///
/// Two records whose offsets fall in different buckets never contend.
pub struct OffsetLocks {
    buckets: Vec<Mutex<()>>,
}

impl OffsetLocks {
    /// Creates the bank.
    pub fn new() -> Self {
        Self {
            buckets: (0..OFFSET_LOCK_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Returns the bucket index for `offset`.
    pub fn bucket(offset: u64) -> usize {
        (offset % OFFSET_LOCK_COUNT as u64) as usize
    }

    /// Locks the bucket of `offset`.
    pub fn lock(&self, offset: u64) -> OffsetGuard<'_> {
        self.buckets[Self::bucket(offset)].lock()
    }

    /// Tries to lock the bucket of `offset` without blocking.
    pub fn try_lock(&self, offset: u64) -> Option<OffsetGuard<'_>> {
        self.buckets[Self::bucket(offset)].try_lock()
    }
}

impl Default for OffsetLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OffsetLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetLocks")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
