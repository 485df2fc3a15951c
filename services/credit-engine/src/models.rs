use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Account holder, identified by its authentication token
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub id: i64,
    #[sqlx(rename = "auth_token")]
    pub identity: String,
    pub created_at: DateTime<Utc>,
}

/// Ledger row kind; the sign of a transaction comes from here, never from the amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Purchase,
    Usage,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "PURCHASE",
            TransactionKind::Usage => "USAGE",
        }
    }

    /// Contribution of `magnitude` to the balance
    pub fn signed(&self, magnitude: i64) -> i64 {
        match self {
            TransactionKind::Purchase => magnitude,
            TransactionKind::Usage => -magnitude,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub client_id: i64,
    pub magnitude: i64,
    pub kind: TransactionKind,
    pub created_at: DateTime<Utc>,
}

/// Usage that has been admitted against the cache but is not yet durable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub identity: String,
    pub magnitude: i64,
}

/// Top-up request
#[derive(Debug, Deserialize, Serialize, validator::Validate)]
pub struct AddTokensRequest {
    #[validate(length(min = 1))]
    pub auth_token: String,
    #[validate(range(min = 1))]
    pub amount: i64,
}

/// Balance response
#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: i64,
}
