//! One-job-per-device enforcement, standing in for the generic block-job
//! layer's device ownership in the original implementation.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Tracks which devices currently have a job running on them.
///
/// The commit engine itself never locks anything (see the concurrency model
/// in `SPEC_FULL.md` §5) — this registry is the one piece of shared state
/// that *does* need a lock, and it is only ever held for the duration of a
/// single `HashSet` insert/remove.
pub struct JobRegistry<K> {
    busy: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash + Clone> JobRegistry<K> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// Claim `key` for the duration of the returned guard, or `None` if a
    /// job already owns it.
    pub fn try_acquire(self: &Arc<Self>, key: K) -> Option<DeviceLease<K>> {
        let mut busy = self.busy.lock().expect("job registry lock poisoned");
        if !busy.insert(key.clone()) {
            return None;
        }
        drop(busy);
        Some(DeviceLease {
            registry: self.clone(),
            key,
        })
    }
}

impl<K: Eq + Hash + Clone> Default for JobRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its device key from the registry on drop.
pub struct DeviceLease<K: Eq + Hash + Clone> {
    registry: Arc<JobRegistry<K>>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for DeviceLease<K> {
    fn drop(&mut self) {
        let mut busy = self.registry.busy.lock().expect("job registry lock poisoned");
        busy.remove(&self.key);
    }
}
