//! Usage write-behind
//!
//! Admitted deductions are acknowledged once the cache has been decremented; the
//! USAGE row is appended to the ledger here, off the request path. Records that
//! cannot be persisted within the retry budget are forgiven: the pending count is
//! dropped, the cache entry is invalidated and the client is handed to the
//! repair worker, so the ledger stays the source of truth.

use crate::cache::balance_key;
use crate::config::{BackpressurePolicy, RetryConfig};
use crate::errors::{BalanceError, LedgerError, Result};
use crate::metrics;
use crate::models::{TransactionKind, UsageRecord};
use crate::reconcile::Reconciler;
use crate::repair::RepairQueue;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Sending side of the usage queue
#[derive(Clone)]
pub struct UsageQueue {
    sender: mpsc::Sender<UsageRecord>,
    policy: BackpressurePolicy,
}

/// Reserved queue slot. Holding one guarantees the record can be handed off
/// without waiting, so admission never mutates the cache and then stalls.
pub struct UsagePermit {
    permit: mpsc::OwnedPermit<UsageRecord>,
}

impl UsagePermit {
    pub fn send(self, record: UsageRecord) {
        self.permit.send(record);
    }
}

impl UsageQueue {
    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Reserve capacity for one record according to the backpressure policy
    pub async fn reserve(&self) -> Result<UsagePermit> {
        let sender = self.sender.clone();

        let permit = match self.policy {
            BackpressurePolicy::Block => sender
                .reserve_owned()
                .await
                .map_err(|_| BalanceError::Internal("usage queue closed".to_string()))?,
            BackpressurePolicy::Reject => match sender.try_reserve_owned() {
                Ok(permit) => permit,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Usage queue full, rejecting deduction");
                    return Err(BalanceError::Internal("usage queue full".to_string()));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(BalanceError::Internal("usage queue closed".to_string()));
                }
            },
        };

        Ok(UsagePermit { permit })
    }
}

pub struct UsageWriter {
    reconciler: Arc<Reconciler>,
    repair: RepairQueue,
    retry: RetryPolicy,
    mailbox: mpsc::Receiver<UsageRecord>,
    shutdown: watch::Receiver<bool>,
}

impl UsageWriter {
    pub fn new(
        reconciler: Arc<Reconciler>,
        repair: RepairQueue,
        retry: RetryConfig,
        mailbox: mpsc::Receiver<UsageRecord>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            repair,
            retry: RetryPolicy::new(retry),
            mailbox,
            shutdown,
        }
    }

    /// Run the writer event loop. On shutdown, stop accepting records and
    /// drain what is already queued.
    pub async fn run(mut self) {
        info!("Usage writer started");

        loop {
            tokio::select! {
                Some(record) = self.mailbox.recv() => {
                    self.persist(record).await;
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }

                else => break,
            }
        }

        self.mailbox.close();
        let mut drained = 0usize;
        while let Some(record) = self.mailbox.recv().await {
            self.persist(record).await;
            drained += 1;
        }

        info!("Usage writer stopped ({} queued records drained)", drained);
    }

    async fn persist(&self, record: UsageRecord) {
        let identity = record.identity.as_str();
        let magnitude = record.magnitude;

        let result = self
            .retry
            .execute_with_retry(
                || self.append_once(identity, magnitude),
                "usage_append",
                |e: &LedgerError| matches!(e, LedgerError::StorageUnavailable(_)),
            )
            .await;

        match result {
            Ok(()) => debug!(identity, magnitude, "Usage recorded"),
            Err(e) => self.abandon(identity, magnitude, e).await,
        }
    }

    async fn append_once(&self, identity: &str, magnitude: i64) -> std::result::Result<(), LedgerError> {
        let _guard = self.reconciler.lock(identity).await;

        self.reconciler
            .ledger()
            .append(identity, magnitude, TransactionKind::Usage)
            .await?;
        self.reconciler.settle_pending(identity, magnitude);

        Ok(())
    }

    async fn abandon(&self, identity: &str, magnitude: i64, err: LedgerError) {
        metrics::USAGE_WRITE_FAILURES.inc();
        error!(
            identity,
            magnitude,
            operation = "append_usage",
            "Usage could not be recorded, invalidating cached balance: {}",
            err
        );

        {
            let _guard = self.reconciler.lock(identity).await;
            self.reconciler.settle_pending(identity, magnitude);

            if let Err(e) = self.reconciler.cache().invalidate(&balance_key(identity)).await {
                error!(identity, operation = "cache_invalidate", "Cache invalidation failed: {}", e);
            }
        }

        self.repair.enqueue(identity);
    }
}

/// Spawn the usage writer
pub fn spawn_usage_writer(
    reconciler: Arc<Reconciler>,
    repair: RepairQueue,
    retry: RetryConfig,
    capacity: usize,
    policy: BackpressurePolicy,
    shutdown: watch::Receiver<bool>,
) -> (UsageQueue, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let writer = UsageWriter::new(reconciler, repair, retry, rx, shutdown);

    let handle = tokio::spawn(async move {
        writer.run().await;
    });

    (UsageQueue { sender: tx, policy }, handle)
}
