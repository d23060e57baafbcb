//! Database pool bootstrap
//!
//! The core owns its SQLite datafile the way an embedded store owns a data
//! directory: WAL journal for concurrent readers, a bounded busy-timeout so
//! writers waiting on the lock either proceed or surface a conflict the
//! executor can retry.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::schema;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::info;

/// Connection pool type
pub type DbPool = Pool<Sqlite>;

/// Create the connection pool and verify connectivity.
pub async fn create_pool(config: &StoreConfig) -> Result<DbPool> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::CoreError::Config(format!("cannot create data dir: {}", e)))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(config.create_if_missing)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    info!(path = %config.db_path.display(), "store pool created");

    Ok(pool)
}

/// Create the pool and apply the schema in one step.
pub async fn connect_and_init(config: &StoreConfig) -> Result<DbPool> {
    let pool = create_pool(config).await?;
    schema::init(&pool).await?;
    Ok(pool)
}
