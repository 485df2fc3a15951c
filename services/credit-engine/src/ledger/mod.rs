//! Ledger of record
//!
//! Append-only transaction log per client. The balance is always derived by
//! aggregation, never stored: `Σ PURCHASE − Σ USAGE`.

pub mod memory;
pub mod postgres;

use crate::errors::LedgerError;
use crate::models::TransactionKind;
use async_trait::async_trait;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert one immutable transaction for the client owning `identity`.
    ///
    /// Fails with `UnknownClient` when no client matches. The write is a single
    /// statement, so it is either fully committed or absent.
    async fn append(
        &self,
        identity: &str,
        magnitude: i64,
        kind: TransactionKind,
    ) -> Result<(), LedgerError>;

    /// Signed sum over every committed transaction of the client.
    async fn compute_balance(&self, identity: &str) -> Result<i64, LedgerError>;

    /// Identities of every known client, used by the reconciliation sweep.
    async fn list_clients(&self) -> Result<Vec<String>, LedgerError>;
}
