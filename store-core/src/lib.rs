//! Sokoni transactional store core
//!
//! Foundation crate for the financial-integrity engines:
//!
//! - **Pool bootstrap**: embedded SQLite datafile owned by this process,
//!   WAL journal, bounded busy-timeout
//! - **Schema**: store-level CHECK constraints, partial unique indexes and
//!   immutability triggers
//! - **Transaction executor**: write transactions with conflict detection
//!   and bounded retry (exponential backoff + jitter)
//! - **Shared error taxonomy** for all engine crates

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod schema;
pub mod telemetry;
pub mod types;

// Re-exports
pub use config::{RetryConfig, StoreConfig};
pub use db::DbPool;
pub use error::{CoreError, Result};
pub use executor::{TxExecutor, TxOptions};
pub use metrics::StoreMetrics;
pub use types::{OrderId, RetailerId, WholesalerId};
