use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by client identity.
///
/// Serializes refresh, admission and usage bookkeeping for one client while
/// leaving other clients unaffected.
#[derive(Default)]
pub struct ClientLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ClientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(identity.to_string())
            .or_default()
            .clone();

        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
