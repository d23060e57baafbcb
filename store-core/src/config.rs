//! Configuration for the store and the transaction executor

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite datafile
    pub db_path: PathBuf,

    /// Maximum pooled connections
    pub max_connections: u32,

    /// How long a connection waits on the writer lock before reporting
    /// a conflict (milliseconds)
    pub busy_timeout_ms: u64,

    /// Create the datafile if it does not exist
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/core.db"),
            max_connections: 8,
            busy_timeout_ms: 5_000,
            create_if_missing: true,
        }
    }
}

/// Retry behavior for conflicted transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum conflict retries (0 = single attempt, no retries)
    pub max_retries: u32,

    /// Base delay before the first retry (milliseconds)
    pub base_delay_ms: u64,

    /// Delay cap (milliseconds)
    pub max_delay_ms: u64,

    /// Jitter factor: each delay is scaled by a random value in
    /// [1 - jitter, 1 + jitter]. 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 10,
            max_delay_ms: 2_000,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// Exponential backoff `base * 2^attempt` capped at `max_delay_ms`,
    /// then jittered so that simultaneous losers do not stampede the
    /// writer lock in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20));
        let capped_ms = exponential_ms.min(self.max_delay_ms);

        let jittered_ms = if self.jitter > 0.0 {
            use rand::Rng;
            let factor: f64 = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            (capped_ms as f64 * factor).max(0.0) as u64
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms)
    }
}

/// Top-level configuration for the financial core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Store settings
    pub store: StoreConfig,

    /// Transaction retry settings
    pub retry: RetryConfig,
}

impl CoreConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::CoreError::Config(format!("Failed to read config: {}", e)))?;
        let config: CoreConfig = toml::from_str(&content)
            .map_err(|e| crate::CoreError::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load defaults, then apply environment overrides
    pub fn from_env() -> crate::Result<Self> {
        let mut config = CoreConfig::default();

        if let Ok(path) = std::env::var("CORE_DB_PATH") {
            config.store.db_path = PathBuf::from(path);
        }

        if let Ok(raw) = std::env::var("CORE_MAX_CONNECTIONS") {
            config.store.max_connections = raw
                .parse()
                .map_err(|_| crate::CoreError::Config(format!("bad CORE_MAX_CONNECTIONS '{}'", raw)))?;
        }

        if let Ok(raw) = std::env::var("CORE_TX_MAX_RETRIES") {
            config.retry.max_retries = raw
                .parse()
                .map_err(|_| crate::CoreError::Config(format!("bad CORE_TX_MAX_RETRIES '{}'", raw)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.store.max_connections, 8);
        assert_eq!(config.retry.max_retries, 10);
        assert!(config.store.create_if_missing);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay_ms: 10,
            max_delay_ms: 500,
            jitter: 0.0,
        };

        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(80));
        // Capped
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(500));
        // Huge attempt numbers do not overflow
        assert_eq!(retry.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 100,
            jitter: 0.25,
        };

        for attempt in 0..50 {
            let d = retry.delay_for_attempt(attempt).as_millis() as u64;
            assert!((75..=125).contains(&d), "delay {} out of band", d);
        }
    }
}
