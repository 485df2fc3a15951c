pub mod cache;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod handlers;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod repair;
pub mod retry;
pub mod write_behind;

pub use config::Config;
pub use coordinator::{BackgroundTasks, BalanceCoordinator};
pub use errors::{BalanceError, CacheError, LedgerError, Result};
