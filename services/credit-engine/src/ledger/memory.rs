use super::LedgerStore;
use crate::errors::LedgerError;
use crate::models::{Client, Transaction, TransactionKind};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Default)]
struct LedgerState {
    clients: HashMap<String, Client>,
    transactions: Vec<Transaction>,
}

/// In-process ledger for tests and local development.
///
/// Can simulate a storage outage so the write-behind and repair paths can be
/// exercised without a database.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_client(&self, identity: &str) -> Client {
        let mut state = self.state.write().await;
        let next_id = state.clients.len() as i64 + 1;

        state
            .clients
            .entry(identity.to_string())
            .or_insert_with(|| Client {
                id: next_id,
                identity: identity.to_string(),
                created_at: Utc::now(),
            })
            .clone()
    }

    /// Toggle a simulated outage; every call fails with `StorageUnavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        if unavailable {
            warn!("In-memory ledger entering simulated outage");
        }
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every recorded transaction of the client, in append order
    pub async fn transactions(&self, identity: &str) -> Vec<Transaction> {
        let state = self.state.read().await;
        let Some(client) = state.clients.get(identity) else {
            return Vec::new();
        };

        state
            .transactions
            .iter()
            .filter(|tx| tx.client_id == client.id)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::StorageUnavailable(
                "simulated ledger outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn append(
        &self,
        identity: &str,
        magnitude: i64,
        kind: TransactionKind,
    ) -> Result<(), LedgerError> {
        self.check_available()?;

        let mut state = self.state.write().await;
        let client_id = state
            .clients
            .get(identity)
            .map(|client| client.id)
            .ok_or_else(|| LedgerError::UnknownClient(identity.to_string()))?;

        let id = state.transactions.len() as i64 + 1;
        state.transactions.push(Transaction {
            id,
            client_id,
            magnitude,
            kind,
            created_at: Utc::now(),
        });

        Ok(())
    }

    async fn compute_balance(&self, identity: &str) -> Result<i64, LedgerError> {
        self.check_available()?;

        let state = self.state.read().await;
        let client_id = state
            .clients
            .get(identity)
            .map(|client| client.id)
            .ok_or_else(|| LedgerError::UnknownClient(identity.to_string()))?;

        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.client_id == client_id)
            .map(|tx| tx.kind.signed(tx.magnitude))
            .sum())
    }

    async fn list_clients(&self) -> Result<Vec<String>, LedgerError> {
        self.check_available()?;

        let state = self.state.read().await;
        let mut clients: Vec<&Client> = state.clients.values().collect();
        clients.sort_by_key(|client| client.id);

        Ok(clients.into_iter().map(|client| client.identity.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_balance_is_signed_sum() {
        let ledger = InMemoryLedger::new();
        ledger.create_client("tok1").await;

        ledger.append("tok1", 100, TransactionKind::Purchase).await.unwrap();
        ledger.append("tok1", 1, TransactionKind::Usage).await.unwrap();
        ledger.append("tok1", 25, TransactionKind::Purchase).await.unwrap();

        assert_eq!(ledger.compute_balance("tok1").await.unwrap(), 124);
        assert_eq!(ledger.transactions("tok1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let ledger = InMemoryLedger::new();
        ledger.create_client("tok1").await;
        ledger.create_client("tok2").await;

        ledger.append("tok1", 10, TransactionKind::Purchase).await.unwrap();

        assert_eq!(ledger.compute_balance("tok1").await.unwrap(), 10);
        assert_eq!(ledger.compute_balance("tok2").await.unwrap(), 0);
        assert_eq!(ledger.list_clients().await.unwrap(), vec!["tok1", "tok2"]);
    }

    #[tokio::test]
    async fn test_create_client_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let first = ledger.create_client("tok1").await;
        let second = ledger.create_client("tok1").await;
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_unknown_client() {
        let ledger = InMemoryLedger::new();

        assert_eq!(
            ledger.append("ghost", 1, TransactionKind::Purchase).await,
            Err(LedgerError::UnknownClient("ghost".to_string()))
        );
        assert_eq!(
            ledger.compute_balance("ghost").await,
            Err(LedgerError::UnknownClient("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let ledger = InMemoryLedger::new();
        ledger.create_client("tok1").await;
        ledger.set_unavailable(true);

        assert!(matches!(
            ledger.append("tok1", 1, TransactionKind::Purchase).await,
            Err(LedgerError::StorageUnavailable(_))
        ));

        ledger.set_unavailable(false);
        assert!(ledger.append("tok1", 1, TransactionKind::Purchase).await.is_ok());
        assert_eq!(ledger.compute_balance("tok1").await.unwrap(), 1);
    }
}
