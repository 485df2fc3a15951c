//! Cache refresh from the ledger of record
//!
//! Every path that republishes a balance (cache miss, top-up, repair, sweep)
//! goes through [`Reconciler::refresh`]. Admitted deductions whose USAGE row is
//! still in the write-behind queue are tracked as pending usage and subtracted
//! from the ledger sum, so a refresh never hands spent credit back.

use crate::cache::{balance_key, CacheStore};
use crate::errors::{BalanceError, Result};
use crate::ledger::LedgerStore;
use crate::locks::ClientLocks;
use crate::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error};

pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn CacheStore>,
    locks: ClientLocks,
    pending: DashMap<String, i64>,
    ttl: Duration,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            ledger,
            cache,
            locks: ClientLocks::new(),
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Exclusive access to one client's balance bookkeeping
    pub async fn lock(&self, identity: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(identity).await
    }

    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Recompute the balance from the ledger and publish it to the cache.
    ///
    /// Idempotent: with no intervening ledger change, repeated calls publish the
    /// same value.
    pub async fn refresh(&self, identity: &str) -> Result<i64> {
        let _guard = self.lock(identity).await;

        let ledger_balance = self.ledger.compute_balance(identity).await.map_err(|e| {
            error!(identity, operation = "compute_balance", "Ledger read failed: {}", e);
            BalanceError::from(e)
        })?;

        let balance = ledger_balance - self.pending_usage(identity);

        self.cache
            .set(&balance_key(identity), balance, self.ttl)
            .await
            .map_err(|e| {
                error!(identity, operation = "cache_set", "Cache write failed: {}", e);
                BalanceError::from(e)
            })?;

        debug!(identity, ledger_balance, balance, "Balance refreshed from ledger");
        Ok(balance)
    }

    /// Admitted usage not yet durable in the ledger
    pub fn pending_usage(&self, identity: &str) -> i64 {
        self.pending.get(identity).map(|entry| *entry).unwrap_or(0)
    }

    /// Caller must hold the client's lock
    pub(crate) fn add_pending(&self, identity: &str, magnitude: i64) {
        *self.pending.entry(identity.to_string()).or_insert(0) += magnitude;
        metrics::PENDING_USAGE.add(magnitude);
    }

    /// Caller must hold the client's lock
    pub(crate) fn settle_pending(&self, identity: &str, magnitude: i64) {
        if let Some(mut entry) = self.pending.get_mut(identity) {
            *entry -= magnitude;
        }
        self.pending.remove_if(identity, |_, outstanding| *outstanding <= 0);
        metrics::PENDING_USAGE.sub(magnitude);
    }
}
