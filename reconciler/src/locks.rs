//! Per-owner serialisation of reconciliation cycles
//!
//! A reconciliation reads the owner's rows, asks the oracle, computes and
//! writes. Two such cycles for the same owner must not interleave, or the
//! second would plan against rows the first is about to rewrite. Different
//! owners proceed in parallel.
//!
//! Entries live only while someone holds or waits for them; the last guard
//! to drop removes the owner from the map.

use dashmap::DashMap;
use deposit_ledger::OwnerKey;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of async mutexes keyed by owner
#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: DashMap<OwnerKey, Arc<Mutex<()>>>,
}

/// Exclusive access to one owner, released on drop
#[derive(Debug)]
pub struct OwnerGuard<'a> {
    locks: &'a OwnerLocks,
    owner: OwnerKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so our own Arc no longer counts
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.owner, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl OwnerLocks {
    /// Create empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `owner`
    pub async fn acquire(&self, owner: &OwnerKey) -> OwnerGuard<'_> {
        // Clone the Arc out so the shard lock is released before awaiting
        let lock = self
            .locks
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        OwnerGuard {
            locks: self,
            owner: owner.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Owners currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no owner is locked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
