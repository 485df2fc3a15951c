//! Balance coordinator
//!
//! Single external contract over the ledger of record and the balance cache:
//!
//! - top-ups are durable before they are visible,
//! - deductions are admitted against the cache with an atomic conditional
//!   decrement and persisted through the usage write-behind queue,
//! - balance reads are served from the cache and rebuilt from the ledger on a
//!   miss.

use crate::cache::{balance_key, CacheStore, Decrement};
use crate::config::CreditConfig;
use crate::errors::{BalanceError, Result};
use crate::ledger::LedgerStore;
use crate::metrics;
use crate::models::{TransactionKind, UsageRecord};
use crate::reconcile::Reconciler;
use crate::repair::{spawn_repair_worker, RepairQueue};
use crate::write_behind::{spawn_usage_writer, UsageQueue};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Attempts at the conditional decrement when the entry expires under us
const ADMISSION_ATTEMPTS: usize = 2;

#[derive(Clone)]
pub struct BalanceCoordinator {
    reconciler: Arc<Reconciler>,
    usage: UsageQueue,
    repair: RepairQueue,
    cost: i64,
}

/// Handles of the coordinator's background tasks
pub struct BackgroundTasks {
    usage_shutdown: watch::Sender<bool>,
    usage_writer: JoinHandle<()>,
    repair_shutdown: watch::Sender<bool>,
    repair_worker: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Stop the usage writer (draining its queue) and then the repair worker,
    /// so repairs scheduled by the drain still run.
    pub async fn shutdown(self) {
        let _ = self.usage_shutdown.send(true);
        if let Err(e) = self.usage_writer.await {
            error!("Usage writer task failed: {}", e);
        }

        let _ = self.repair_shutdown.send(true);
        if let Err(e) = self.repair_worker.await {
            error!("Repair worker task failed: {}", e);
        }
    }
}

impl BalanceCoordinator {
    /// Build the coordinator over the given stores and start its background
    /// tasks. Must be called from within a tokio runtime.
    pub fn spawn(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn CacheStore>,
        config: &CreditConfig,
    ) -> (Self, BackgroundTasks) {
        let reconciler = Arc::new(Reconciler::new(ledger, cache, config.cache_ttl()));

        let (repair_shutdown, repair_rx) = watch::channel(false);
        let (repair, repair_worker) = spawn_repair_worker(
            reconciler.clone(),
            config.repair_queue_capacity,
            config.sweep_interval(),
            repair_rx,
        );

        let (usage_shutdown, usage_rx) = watch::channel(false);
        let (usage, usage_writer) = spawn_usage_writer(
            reconciler.clone(),
            repair.clone(),
            config.retry.clone(),
            config.usage_queue_capacity,
            config.backpressure,
            usage_rx,
        );

        info!(
            "Balance coordinator ready (cost per call: {}, backpressure: {:?})",
            config.cost_per_call, config.backpressure
        );

        let coordinator = Self {
            reconciler,
            usage,
            repair,
            cost: config.cost_per_call,
        };

        let tasks = BackgroundTasks {
            usage_shutdown,
            usage_writer,
            repair_shutdown,
            repair_worker,
        };

        (coordinator, tasks)
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    /// Current balance; served from the cache, rebuilt from the ledger on a miss
    pub async fn get_balance(&self, identity: &str) -> Result<i64> {
        let key = balance_key(identity);

        if let Some(balance) = self.read_cache(identity, &key).await? {
            metrics::CACHE_HITS.inc();
            return Ok(balance);
        }

        metrics::CACHE_MISSES.inc();
        let refreshed = self.reconciler.refresh(identity).await?;

        // The entry can expire or be invalidated between the write and this read
        Ok(self.read_cache(identity, &key).await?.unwrap_or(refreshed))
    }

    /// Record a purchase durably, then republish the balance.
    ///
    /// The work runs on its own task so a caller that goes away mid-call cannot
    /// leave a committed purchase with an unrefreshed cache entry.
    pub async fn add_tokens(&self, identity: &str, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(BalanceError::Validation(
                "amount must be greater than 0".to_string(),
            ));
        }

        let coordinator = self.clone();
        let identity = identity.to_string();

        tokio::spawn(async move { coordinator.record_purchase(&identity, amount).await })
            .await
            .map_err(|e| BalanceError::Internal(format!("top-up task failed: {}", e)))?
    }

    async fn record_purchase(&self, identity: &str, amount: i64) -> Result<()> {
        self.reconciler
            .ledger()
            .append(identity, amount, TransactionKind::Purchase)
            .await
            .map_err(|e| {
                error!(identity, operation = "append_purchase", "Ledger write failed: {}", e);
                BalanceError::from(e)
            })?;

        metrics::TOKENS_PURCHASED.inc_by(amount as u64);
        info!(identity, amount, "Tokens purchased");

        if let Err(e) = self.reconciler.refresh(identity).await {
            warn!(identity, "Purchase recorded but balance refresh failed: {}", e);
            self.repair.enqueue(identity);
            return Err(e);
        }

        Ok(())
    }

    /// Charge one metered call.
    ///
    /// Admission is decided by the cache; the USAGE row is persisted by the
    /// write-behind queue and its failure never reaches the caller.
    pub async fn deduct_tokens(&self, identity: &str) -> Result<()> {
        let available = self.get_balance(identity).await?;
        if available < self.cost {
            return Err(self.reject(identity, available));
        }

        let permit = self.usage.reserve().await?;
        let key = balance_key(identity);

        for _ in 0..ADMISSION_ATTEMPTS {
            let guard = self.reconciler.lock(identity).await;

            let outcome = self
                .reconciler
                .cache()
                .decrement_if_at_least(&key, self.cost, self.reconciler.ttl())
                .await
                .map_err(|e| {
                    error!(identity, operation = "cache_decrement", "Cache write failed: {}", e);
                    BalanceError::from(e)
                })?;

            match outcome {
                Decrement::Applied(remaining) => {
                    self.reconciler.add_pending(identity, self.cost);
                    permit.send(UsageRecord {
                        identity: identity.to_string(),
                        magnitude: self.cost,
                    });
                    drop(guard);

                    metrics::DEDUCTIONS_ADMITTED.inc();
                    debug!(identity, remaining, "Deduction admitted");
                    return Ok(());
                }
                Decrement::Insufficient(available) => {
                    drop(guard);
                    return Err(self.reject(identity, available));
                }
                Decrement::Missing => {
                    drop(guard);
                    debug!(identity, "Balance expired during admission, refreshing");
                    self.reconciler.refresh(identity).await?;
                }
            }
        }

        error!(identity, operation = "cache_decrement", "Balance missing from cache after refresh");
        Err(BalanceError::Internal(
            "balance unavailable in cache".to_string(),
        ))
    }

    /// Recompute one client's balance from the ledger right now
    pub async fn repair_now(&self, identity: &str) -> Result<i64> {
        self.reconciler.refresh(identity).await
    }

    /// Hand a client to the repair worker without waiting
    pub fn schedule_repair(&self, identity: &str) -> bool {
        self.repair.enqueue(identity)
    }

    /// Admitted usage still waiting in the write-behind queue
    pub fn pending_usage(&self, identity: &str) -> i64 {
        self.reconciler.pending_usage(identity)
    }

    async fn read_cache(&self, identity: &str, key: &str) -> Result<Option<i64>> {
        self.reconciler.cache().get(key).await.map_err(|e| {
            error!(identity, operation = "cache_get", "Cache read failed: {}", e);
            BalanceError::from(e)
        })
    }

    fn reject(&self, identity: &str, available: i64) -> BalanceError {
        metrics::DEDUCTIONS_REJECTED.inc();
        debug!(identity, available, required = self.cost, "Deduction rejected");
        BalanceError::InsufficientCredit {
            required: self.cost,
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryCache, MockCacheStore};
    use crate::errors::{CacheError, LedgerError};
    use crate::ledger::{InMemoryLedger, MockLedgerStore};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Ledger whose appends stall until released
    struct GatedLedger {
        inner: InMemoryLedger,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl LedgerStore for GatedLedger {
        async fn append(
            &self,
            identity: &str,
            magnitude: i64,
            kind: TransactionKind,
        ) -> std::result::Result<(), LedgerError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.append(identity, magnitude, kind).await
        }

        async fn compute_balance(&self, identity: &str) -> std::result::Result<i64, LedgerError> {
            self.inner.compute_balance(identity).await
        }

        async fn list_clients(&self) -> std::result::Result<Vec<String>, LedgerError> {
            self.inner.list_clients().await
        }
    }

    fn test_config() -> CreditConfig {
        let mut config = CreditConfig::default();
        config.sweep_interval_secs = 0;
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config
    }

    #[tokio::test]
    async fn test_add_tokens_rejects_non_positive_amount() {
        let mut ledger = MockLedgerStore::new();
        ledger.expect_append().never();

        let (coordinator, tasks) = BalanceCoordinator::spawn(
            Arc::new(ledger),
            Arc::new(InMemoryCache::new()),
            &test_config(),
        );

        for amount in [0, -5] {
            assert!(matches!(
                coordinator.add_tokens("tok1", amount).await,
                Err(BalanceError::Validation(_))
            ));
        }

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_top_up_still_commits_and_refreshes() {
        let inner = InMemoryLedger::new();
        inner.create_client("tok1").await;
        let cache = InMemoryCache::new();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let ledger = GatedLedger {
            inner: inner.clone(),
            entered: entered.clone(),
            release: release.clone(),
        };
        let (coordinator, tasks) =
            BalanceCoordinator::spawn(Arc::new(ledger), Arc::new(cache.clone()), &test_config());

        // The caller goes away while the append is in flight
        tokio::select! {
            _ = coordinator.add_tokens("tok1", 10) => panic!("append should still be stalled"),
            _ = entered.notified() => {}
        }
        release.notify_one();

        let mut refreshed = false;
        for _ in 0..100 {
            if cache.get(&balance_key("tok1")).await.unwrap() == Some(10) {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(refreshed, "purchase should be refreshed into the cache");
        assert_eq!(inner.compute_balance("tok1").await.unwrap(), 10);
        assert_eq!(inner.transactions("tok1").await.len(), 1);

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_read_failure_is_internal() {
        let mut cache = MockCacheStore::new();
        cache
            .expect_get()
            .returning(|_| Err(CacheError::StorageUnavailable("connection reset".to_string())));

        let (coordinator, tasks) = BalanceCoordinator::spawn(
            Arc::new(InMemoryLedger::new()),
            Arc::new(cache),
            &test_config(),
        );

        assert!(matches!(
            coordinator.get_balance("tok1").await,
            Err(BalanceError::Internal(_))
        ));
        assert!(matches!(
            coordinator.deduct_tokens("tok1").await,
            Err(BalanceError::Internal(_))
        ));

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_purchase_survives_refresh_failure() {
        let ledger = InMemoryLedger::new();
        ledger.create_client("tok1").await;

        let mut cache = MockCacheStore::new();
        cache
            .expect_set()
            .returning(|_, _, _| Err(CacheError::StorageUnavailable("down".to_string())));

        let (coordinator, tasks) = BalanceCoordinator::spawn(
            Arc::new(ledger.clone()),
            Arc::new(cache),
            &test_config(),
        );

        assert!(matches!(
            coordinator.add_tokens("tok1", 10).await,
            Err(BalanceError::Internal(_))
        ));
        assert_eq!(ledger.compute_balance("tok1").await.unwrap(), 10);

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_purchase_for_unknown_client() {
        let mut ledger = MockLedgerStore::new();
        ledger
            .expect_append()
            .times(1)
            .returning(|identity, _, _| Err(LedgerError::UnknownClient(identity.to_string())));

        let mut cache = MockCacheStore::new();
        cache.expect_set().never();

        let (coordinator, tasks) =
            BalanceCoordinator::spawn(Arc::new(ledger), Arc::new(cache), &test_config());

        assert_eq!(
            coordinator.add_tokens("no-such-token", 10).await,
            Err(BalanceError::ClientNotFound)
        );

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_entry_expiring_during_admission_is_refreshed() {
        let ledger = InMemoryLedger::new();
        ledger.create_client("tok1").await;
        ledger.append("tok1", 5, TransactionKind::Purchase).await.unwrap();

        let mut cache = MockCacheStore::new();
        cache.expect_get().returning(|_| Ok(Some(5)));
        cache
            .expect_set()
            .withf(|key, value, _| key.ends_with("tok1") && *value == 5)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut decrements = 0;
        cache
            .expect_decrement_if_at_least()
            .times(2)
            .returning(move |_, cost, _| {
                decrements += 1;
                if decrements == 1 {
                    Ok(Decrement::Missing)
                } else {
                    Ok(Decrement::Applied(5 - cost))
                }
            });

        let (coordinator, tasks) = BalanceCoordinator::spawn(
            Arc::new(ledger.clone()),
            Arc::new(cache),
            &test_config(),
        );

        coordinator.deduct_tokens("tok1").await.unwrap();
        tasks.shutdown().await;

        assert_eq!(ledger.compute_balance("tok1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_insufficient_at_decrement_does_not_queue_usage() {
        let mut cache = MockCacheStore::new();
        cache.expect_get().returning(|_| Ok(Some(1)));
        cache
            .expect_decrement_if_at_least()
            .times(1)
            .returning(|_, _, _| Ok(Decrement::Insufficient(0)));

        let mut ledger = MockLedgerStore::new();
        ledger.expect_append().never();

        let (coordinator, tasks) =
            BalanceCoordinator::spawn(Arc::new(ledger), Arc::new(cache), &test_config());

        assert_eq!(
            coordinator.deduct_tokens("tok1").await,
            Err(BalanceError::InsufficientCredit {
                required: 1,
                available: 0
            })
        );
        assert_eq!(coordinator.pending_usage("tok1"), 0);

        tasks.shutdown().await;
    }
}
