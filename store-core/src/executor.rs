//! Serializable transaction executor
//!
//! Wraps a unit of work in a store transaction, classifies store-detected
//! write conflicts, and retries the whole closure with exponential backoff
//! plus jitter until it commits or the retry budget is spent.
//!
//! Write transactions open with `BEGIN IMMEDIATE`, taking the writer lock
//! up-front: conflicting writers either wait (inside the busy-timeout) or
//! surface a conflict this executor retries. That is the embedded-store
//! equivalent of `SELECT ... FOR UPDATE` under a serializable isolation
//! level; reads made inside the closure hold the lock until commit.
//!
//! # Side effects
//!
//! The closure must stay free of external side effects (messages, webhooks):
//! it can run several times. Anything that must happen exactly once belongs
//! in the closure's *return value*, dispatched by the caller after `run`
//! comes back Ok. By then the decision is committed and will not be
//! replayed.
//!
//! ```no_run
//! # use store_core::{TxExecutor, Result};
//! # async fn demo(executor: &TxExecutor) -> Result<()> {
//! let outcome = executor
//!     .run(|conn| {
//!         Box::pin(async move {
//!             sqlx::query("UPDATE wholesaler_profiles SET open_capacity = open_capacity - 1")
//!                 .execute(&mut *conn)
//!                 .await?;
//!             Ok("notify-after-commit")
//!         })
//!     })
//!     .await?;
//! // committed; dispatch `outcome` to the messaging layer here
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::db::DbPool;
use crate::error::{classify_db_error, CoreError, Result};
use crate::metrics::StoreMetrics;
use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Sqlite, SqliteConnection};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-call overrides for a transaction run
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    /// Wall-clock limit for the closure on each attempt
    pub timeout: Option<Duration>,

    /// Override the configured conflict-retry budget
    pub max_retries: Option<u32>,
}

/// Predicate deciding whether an error is a retryable conflict
pub type ConflictClassifier = fn(&CoreError) -> bool;

fn default_classifier(err: &CoreError) -> bool {
    err.is_serialization_conflict()
}

/// Transaction executor with bounded conflict retry
pub struct TxExecutor {
    pool: DbPool,
    retry: RetryConfig,
    classify: ConflictClassifier,
    metrics: StoreMetrics,
}

impl TxExecutor {
    /// Create an executor over a pool
    pub fn new(pool: DbPool, retry: RetryConfig) -> Self {
        Self {
            pool,
            retry,
            classify: default_classifier,
            metrics: StoreMetrics::default(),
        }
    }

    /// Replace the conflict classifier
    pub fn with_classifier(mut self, classify: ConflictClassifier) -> Self {
        self.classify = classify;
        self
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// The underlying pool, for plain reads outside any engine transaction
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Executor metrics
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Run a write transaction with the configured retry budget.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.run_with(TxOptions::default(), work).await
    }

    /// Run a write transaction with per-call overrides.
    pub async fn run_with<T, F>(&self, opts: TxOptions, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.run_inner("BEGIN IMMEDIATE", opts, work).await
    }

    /// Run read-only work inside a deferred transaction, for a consistent
    /// snapshot across several queries. Never takes the writer lock.
    pub async fn run_read<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.run_inner("BEGIN", TxOptions::default(), work).await
    }

    async fn run_inner<T, F>(&self, begin_sql: &str, opts: TxOptions, mut work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let max_retries = opts.max_retries.unwrap_or(self.retry.max_retries);
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();

            match self.attempt(begin_sql, opts.timeout, &mut work).await {
                Ok(value) => {
                    self.metrics.commits.inc();
                    self.metrics
                        .commit_duration
                        .observe(started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Err(err) if (self.classify)(&err) => {
                    self.metrics.conflicts.inc();
                    if attempt >= max_retries {
                        self.metrics.exhausted.inc();
                        return Err(CoreError::MaxRetriesExceeded {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transaction conflicted, retrying"
                    );
                    self.metrics.retries.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One attempt: begin, run the closure, commit or roll back.
    async fn attempt<T, F>(
        &self,
        begin_sql: &str,
        timeout: Option<Duration>,
        work: &mut F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut conn = self.pool.acquire().await.map_err(classify_db_error)?;

        sqlx::query(begin_sql)
            .execute(&mut *conn)
            .await
            .map_err(classify_db_error)?;

        let worked = match timeout {
            Some(limit) => match tokio::time::timeout(limit, work(&mut *conn)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout),
            },
            None => work(&mut *conn).await,
        };

        match worked {
            Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(value),
                Err(err) => {
                    let err = classify_db_error(err);
                    Self::abort(conn).await;
                    Err(err)
                }
            },
            Err(err) => {
                Self::abort(conn).await;
                Err(err)
            }
        }
    }

    /// Best-effort rollback. A connection that cannot roll back is
    /// discarded instead of being returned to the pool mid-transaction.
    async fn abort(mut conn: PoolConnection<Sqlite>) {
        if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            warn!(error = %err, "rollback failed, discarding connection");
            let _ = conn.detach().close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::create_pool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn test_executor(retry: RetryConfig) -> (tempfile::TempDir, TxExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("core.db"),
            ..StoreConfig::default()
        };
        let pool = create_pool(&config).await.unwrap();
        sqlx::query("CREATE TABLE scratch (id INTEGER PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        (dir, TxExecutor::new(pool, retry))
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_commit_persists_work() {
        let (_dir, executor) = test_executor(quick_retry()).await;

        executor
            .run(|conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO scratch (value) VALUES ('committed')")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scratch")
            .fetch_one(executor.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
        assert_eq!(executor.metrics().commits.get(), 1);
    }

    #[tokio::test]
    async fn test_error_rolls_back_work() {
        let (_dir, executor) = test_executor(quick_retry()).await;

        let result: Result<()> = executor
            .run(|conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO scratch (value) VALUES ('doomed')")
                        .execute(&mut *conn)
                        .await?;
                    Err(CoreError::InvalidState("abort on purpose".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(CoreError::InvalidState(_))));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scratch")
            .fetch_one(executor.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_conflict_retries_then_succeeds() {
        let (_dir, executor) = test_executor(quick_retry()).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let value = executor
            .run(move |_conn| {
                let counter = counter.clone();
                Box::pin(async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(CoreError::SerializationConflict("synthetic".to_string()))
                    } else {
                        Ok(n)
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(executor.metrics().retries.get(), 2);
    }

    #[tokio::test]
    async fn test_business_error_does_not_retry() {
        let (_dir, executor) = test_executor(quick_retry()).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = executor
            .run(move |_conn| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::InvalidState("not a conflict".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(CoreError::InvalidState(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let (_dir, executor) = test_executor(RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        })
        .await;

        let result: Result<()> = executor
            .run(|_conn| {
                Box::pin(async move {
                    Err(CoreError::SerializationConflict("always".to_string()))
                })
            })
            .await;

        match result {
            Err(CoreError::MaxRetriesExceeded { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.contains("always"));
            }
            other => panic!("expected MaxRetriesExceeded, got {:?}", other.err()),
        }
        assert_eq!(executor.metrics().exhausted.get(), 1);
    }

    #[tokio::test]
    async fn test_per_call_timeout() {
        let (_dir, executor) = test_executor(quick_retry()).await;

        let opts = TxOptions {
            timeout: Some(Duration::from_millis(20)),
            max_retries: None,
        };
        let result: Result<()> = executor
            .run_with(opts, |_conn| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(CoreError::Timeout)));
    }

    #[tokio::test]
    async fn test_read_snapshot() {
        let (_dir, executor) = test_executor(quick_retry()).await;

        sqlx::query("INSERT INTO scratch (value) VALUES ('a'), ('b')")
            .execute(executor.pool())
            .await
            .unwrap();

        let count = executor
            .run_read(|conn| {
                Box::pin(async move {
                    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scratch")
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok(row.0)
                })
            })
            .await
            .unwrap();

        assert_eq!(count, 2);
    }
}
