//! Balance cache
//!
//! Read-through / write-through accelerator in front of the ledger. Entries are
//! integer balance snapshots that expire after a fixed horizon, so a stale entry
//! heals itself even if no repair ever runs.

pub mod memory;
pub mod redis;

use crate::errors::CacheError;
use async_trait::async_trait;
use std::time::Duration;

pub use self::memory::InMemoryCache;
pub use self::redis::RedisCache;

/// Namespace of every balance key
pub const KEY_PREFIX: &str = "token_balance:";

/// Cache key for a client. The fixed prefix plus the raw identity keeps keys of
/// different clients distinct.
pub fn balance_key(identity: &str) -> String {
    format!("{}{}", KEY_PREFIX, identity)
}

/// Outcome of an atomic conditional decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// The cost was taken; carries the new balance
    Applied(i64),
    /// Balance below the cost; nothing was written
    Insufficient(i64),
    /// No live entry for the key
    Missing,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Cached balance, `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError>;

    /// Overwrite the value and reset its expiration to `ttl` from now.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError>;

    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;

    /// Take `cost` from the entry only if it holds at least `cost`, as one atomic
    /// step. A successful decrement resets the expiration to `ttl`.
    async fn decrement_if_at_least(
        &self,
        key: &str,
        cost: i64,
        ttl: Duration,
    ) -> Result<Decrement, CacheError>;
}
