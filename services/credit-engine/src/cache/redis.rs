use super::{CacheStore, Decrement};
use crate::errors::CacheError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::info;

/// Check-and-decrement executed server side, so concurrent callers cannot both
/// observe the same balance. Returns `{status, balance}` where status is
/// 0 = missing, 1 = insufficient, 2 = applied.
const DECREMENT_IF_AT_LEAST: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return {0, 0}
end
current = tonumber(current)
local cost = tonumber(ARGV[1])
if current < cost then
    return {1, current}
end
local updated = current - cost
redis.call('SET', KEYS[1], updated, 'EX', ARGV[2])
return {2, updated}
"#;

/// Redis-backed balance cache
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
    decrement: Script,
}

impl RedisCache {
    pub fn new(redis: ConnectionManager) -> Self {
        RedisCache {
            redis,
            decrement: Script::new(DECREMENT_IF_AT_LEAST),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        info!("Connected to Redis cache");

        Ok(Self::new(manager))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let value: Option<i64> = self.redis.clone().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        let _: () = self.redis.clone().set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let _: () = self.redis.clone().del(key).await?;
        Ok(())
    }

    async fn decrement_if_at_least(
        &self,
        key: &str,
        cost: i64,
        ttl: Duration,
    ) -> Result<Decrement, CacheError> {
        let mut conn = self.redis.clone();
        let (status, balance): (i64, i64) = self
            .decrement
            .key(key)
            .arg(cost)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(match status {
            2 => Decrement::Applied(balance),
            1 => Decrement::Insufficient(balance),
            _ => Decrement::Missing,
        })
    }
}
