//! Repair worker
//!
//! Drains a bounded queue of client identities whose cached balance can no
//! longer be trusted and republishes each balance from the ledger. A periodic
//! sweep over every client re-drives repairs that were dropped on a full queue.
//!
//! ```text
//!  usage writer / coordinator
//!            │ try_send (never blocks, drops on full)
//!            ▼
//!   mpsc::channel(capacity)          interval(sweep)
//!            │                              │
//!            └──────────► RepairWorker ◄────┘
//!                              │
//!                              ▼
//!                  Reconciler::refresh(identity)
//! ```

use crate::metrics;
use crate::reconcile::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Sending side of the repair queue
#[derive(Clone)]
pub struct RepairQueue {
    sender: mpsc::Sender<String>,
}

impl RepairQueue {
    pub(crate) fn from_sender(sender: mpsc::Sender<String>) -> Self {
        Self { sender }
    }

    /// Schedule a repair without waiting. Returns false when the request was
    /// dropped; the next sweep covers it.
    pub fn enqueue(&self, identity: &str) -> bool {
        match self.sender.try_send(identity.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(identity, "Repair queue full, dropping repair request");
                metrics::REPAIRS_DROPPED.inc();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(identity, "Repair worker stopped, dropping repair request");
                metrics::REPAIRS_DROPPED.inc();
                false
            }
        }
    }
}

pub struct RepairWorker {
    reconciler: Arc<Reconciler>,
    mailbox: mpsc::Receiver<String>,
    sweep_interval: Option<Duration>,
    shutdown: watch::Receiver<bool>,
}

impl RepairWorker {
    pub fn new(
        reconciler: Arc<Reconciler>,
        mailbox: mpsc::Receiver<String>,
        sweep_interval: Option<Duration>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            mailbox,
            sweep_interval,
            shutdown,
        }
    }

    /// Run the worker event loop
    pub async fn run(mut self) {
        let mut sweep = self.sweep_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(
            "Repair worker started (sweep interval: {:?})",
            self.sweep_interval
        );

        loop {
            tokio::select! {
                Some(identity) = self.mailbox.recv() => {
                    self.repair(&identity, "queue").await;
                }

                _ = next_sweep(&mut sweep) => {
                    self.sweep().await;
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
        while let Some(identity) = self.mailbox.recv().await {
            self.repair(&identity, "queue").await;
            drained += 1;
        }

        info!("Repair worker stopped ({} queued repairs drained)", drained);
    }

    async fn repair(&self, identity: &str, trigger: &str) {
        match self.reconciler.refresh(identity).await {
            Ok(balance) => {
                debug!(identity, balance, trigger, "Cache repaired");
                metrics::REPAIRS.with_label_values(&[trigger, "ok"]).inc();
            }
            Err(e) => {
                error!(identity, trigger, "Cache repair failed: {}", e);
                metrics::REPAIRS.with_label_values(&[trigger, "failed"]).inc();
            }
        }
    }

    /// Republish every client's balance
    async fn sweep(&self) {
        let clients = match self.reconciler.ledger().list_clients().await {
            Ok(clients) => clients,
            Err(e) => {
                error!("Reconciliation sweep could not list clients: {}", e);
                return;
            }
        };

        info!("Reconciliation sweep started for {} clients", clients.len());

        for identity in &clients {
            self.repair(identity, "sweep").await;
        }

        let pruned = self.reconciler.prune_locks();
        info!(
            "Reconciliation sweep complete: {} clients processed, {} idle locks pruned",
            clients.len(),
            pruned
        );
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Spawn the repair worker
pub fn spawn_repair_worker(
    reconciler: Arc<Reconciler>,
    capacity: usize,
    sweep_interval: Option<Duration>,
    shutdown: watch::Receiver<bool>,
) -> (RepairQueue, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let worker = RepairWorker::new(reconciler, rx, sweep_interval, shutdown);

    let handle = tokio::spawn(async move {
        worker.run().await;
    });

    (RepairQueue::from_sender(tx), handle)
}
