use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub credit: CreditConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// What admission does when the usage write-behind queue is full
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for queue capacity before admitting
    Block,
    /// Refuse the deduction without touching the cache
    Reject,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CreditConfig {
    /// Units charged per metered call
    pub cost_per_call: i64,
    pub cache_ttl_secs: u64,
    pub repair_queue_capacity: usize,
    /// Full reconciliation sweep period; 0 disables the sweep
    pub sweep_interval_secs: u64,
    pub usage_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub retry: RetryConfig,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            cost_per_call: 1,
            cache_ttl_secs: 24 * 60 * 60,
            repair_queue_capacity: 100,
            sweep_interval_secs: 15 * 60,
            usage_queue_capacity: 1000,
            backpressure: BackpressurePolicy::Block,
            retry: RetryConfig::default(),
        }
    }
}

impl CreditConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cost_per_call < 1 {
            return Err("Cost per call must be at least 1".to_string());
        }

        if self.cache_ttl_secs == 0 {
            return Err("Cache TTL cannot be 0".to_string());
        }

        if self.repair_queue_capacity == 0 {
            return Err("Repair queue capacity cannot be 0".to_string());
        }

        if self.usage_queue_capacity == 0 {
            return Err("Usage queue capacity cannot be 0".to_string());
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err("Retry backoff multiplier must be at least 1.0".to_string());
        }

        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let credit = CreditConfig::default();

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("redis.url", "")?
            .set_default("credit.cost_per_call", credit.cost_per_call)?
            .set_default("credit.cache_ttl_secs", credit.cache_ttl_secs)?
            .set_default("credit.repair_queue_capacity", credit.repair_queue_capacity as u64)?
            .set_default("credit.sweep_interval_secs", credit.sweep_interval_secs)?
            .set_default("credit.usage_queue_capacity", credit.usage_queue_capacity as u64)?
            .set_default("credit.backpressure", "block")?
            .set_default("credit.retry.max_retries", credit.retry.max_retries)?
            .set_default("credit.retry.initial_delay_ms", credit.retry.initial_delay_ms)?
            .set_default("credit.retry.max_delay_ms", credit.retry.max_delay_ms)?
            .set_default("credit.retry.backoff_multiplier", credit.retry.backoff_multiplier)?
            .set_default("credit.retry.jitter_factor", credit.retry.jitter_factor)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(Environment::with_prefix("CREDIT_ENGINE").separator("__"));

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("redis.url", redis_url)?;
        }

        if let Ok(port) = env::var("CREDIT_ENGINE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.server.workers == 0 {
            return Err("Server workers cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL is required".to_string());
        }

        self.credit.validate()
    }
}
