//! Per-key serialization shared by the Elasticsearch and dormant controllers
//!
//! The controller runtime already deduplicates reconciles of one object, but
//! an Elasticsearch object and its dormant record share a `namespace/name`
//! key and are reconciled by different controllers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by `namespace/name`
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `namespace/name`
    pub async fn lock(&self, namespace: &str, name: &str) -> OwnedMutexGuard<()> {
        let key = format!("{}/{}", namespace, name);
        // Clone the Arc out so the map shard is not held across the await
        let mutex = self.locks.entry(key).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drop the entry for a key nobody holds
    pub fn forget(&self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        self.locks
            .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
