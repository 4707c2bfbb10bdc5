//! Concurrent registry of live share-producing identities.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::clock::Clock;
use crate::types::{Share, WorkerKey};
use crate::worker::WorkerShares;

struct RegistryInner {
    workers: HashMap<WorkerKey, Arc<WorkerShares>>,
    total_worker_count: u64,
    total_user_count: u64,
    user_worker_count: HashMap<i32, u64>,
}

/// Read-mostly map from identity key to its accumulator.
///
/// Identities appear on their first share and disappear when evicted after a
/// full idle window. Entries are handed out as shared handles so readers can
/// snapshot them after the registry lock is released, even if the entry is
/// concurrently evicted.
pub struct Registry {
    clock: Arc<dyn Clock>,
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(RegistryInner {
                workers: HashMap::new(),
                total_worker_count: 0,
                total_user_count: 0,
                user_worker_count: HashMap::new(),
            }),
        }
    }

    /// Fold a share into the entry for `key`, creating the entry on first
    /// sight.
    ///
    /// The common path takes the shared lock only to clone the handle; the
    /// accumulator's own mutex orders the update. First sight builds the
    /// entry outside any lock, then re-checks under the exclusive lock: if
    /// another writer got there first, the duplicate is dropped and the share
    /// applied to the surviving entry, so the live counters move exactly once
    /// per key.
    pub fn insert_or_update(&self, key: WorkerKey, share: &Share) {
        let existing = {
            let inner = self.inner.read().unwrap();
            inner.workers.get(&key).cloned()
        };
        if let Some(worker) = existing {
            worker.process_share(share);
            return;
        }

        let fresh = Arc::new(WorkerShares::new(
            key.worker_id,
            key.user_id,
            self.clock.clone(),
        ));
        fresh.process_share(share);

        let race_winner = {
            let mut inner = self.inner.write().unwrap();
            let winner = match inner.workers.entry(key) {
                Entry::Occupied(occupied) => Some(Arc::clone(occupied.get())),
                Entry::Vacant(vacant) => {
                    vacant.insert(fresh);
                    None
                }
            };
            if winner.is_none() {
                if key.is_aggregate() {
                    inner.total_user_count += 1;
                } else {
                    inner.total_worker_count += 1;
                    *inner.user_worker_count.entry(key.user_id).or_insert(0) += 1;
                }
            }
            winner
        };

        if let Some(winner) = race_winner {
            winner.process_share(share);
        }
    }

    /// Sweep out identities idle for longer than the window. Returns how many
    /// entries were removed.
    pub fn evict_expired(&self) -> usize {
        let mut inner = self.inner.write().unwrap();

        let expired: Vec<WorkerKey> = inner
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_expired())
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            inner.workers.remove(key);
            if key.is_aggregate() {
                inner.total_user_count -= 1;
            } else {
                inner.total_worker_count -= 1;
                if let Entry::Occupied(mut count) = inner.user_worker_count.entry(key.user_id) {
                    *count.get_mut() -= 1;
                    if *count.get() == 0 {
                        count.remove();
                    }
                }
            }
        }

        expired.len()
    }

    /// Resolve all keys to handles in one pass under the shared lock.
    /// Missing keys yield `None`; callers snapshot the handles afterwards.
    pub fn batch_lookup(&self, keys: &[WorkerKey]) -> Vec<Option<Arc<WorkerShares>>> {
        let inner = self.inner.read().unwrap();
        keys.iter().map(|key| inner.workers.get(key).cloned()).collect()
    }

    /// Number of live real workers for one user.
    pub fn user_worker_count(&self, user_id: i32) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.user_worker_count.get(&user_id).copied().unwrap_or(0)
    }

    /// Live (worker, user-aggregate) entry counts.
    pub fn total_counts(&self) -> (u64, u64) {
        let inner = self.inner.read().unwrap();
        (inner.total_worker_count, inner.total_user_count)
    }
}
