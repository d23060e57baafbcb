//! Balance reconciliation sweep

use chrono::{DateTime, Utc};
use credit_engine::accounts::active_accounts;
use ledger_core::{balance_of, verify_chain};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store_core::{CoreError, Result, RetailerId, TxExecutor, WholesalerId};

/// Auditor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorConfig {
    /// Largest cache drift tolerated before an account is flagged
    /// (in currency units)
    pub epsilon: Decimal,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            epsilon: Decimal::new(1, 2), // 0.01
        }
    }
}

/// One account whose cache drifted from the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Retailer side of the account
    pub retailer_id: RetailerId,

    /// Wholesaler side of the account
    pub wholesaler_id: WholesalerId,

    /// Balance recomputed from the ledger
    pub calculated: Decimal,

    /// The advisory cache value found on the account
    pub cached: Decimal,

    /// Absolute drift
    pub delta: Decimal,
}

/// One scope whose ledger failed re-derivation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainFault {
    /// Retailer side of the scope
    pub retailer_id: RetailerId,

    /// Wholesaler side of the scope
    pub wholesaler_id: WholesalerId,

    /// What failed
    pub detail: String,
}

/// Result of one reconciliation sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// When the sweep ran
    pub run_at: DateTime<Utc>,

    /// Active accounts examined
    pub accounts_checked: usize,

    /// Accounts whose cache drifted beyond epsilon
    pub discrepancies: Vec<Discrepancy>,

    /// Scopes with broken hash chains or balance laws
    pub chain_faults: Vec<ChainFault>,
}

impl ReconciliationReport {
    /// Whether the books reconciled with nothing to report
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty() && self.chain_faults.is_empty()
    }
}

/// Reconciliation auditor
pub struct ReconAuditor {
    executor: Arc<TxExecutor>,
    config: AuditorConfig,
}

impl ReconAuditor {
    /// Create an auditor over an executor
    pub fn new(executor: Arc<TxExecutor>, config: AuditorConfig) -> Self {
        Self { executor, config }
    }

    /// Run one read-only sweep over every active account.
    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        let epsilon = self.config.epsilon;

        let report = self
            .executor
            .run_read(move |conn| {
                Box::pin(async move {
                    let accounts = active_accounts(conn).await?;
                    let accounts_checked = accounts.len();

                    let mut discrepancies = Vec::new();
                    let mut chain_faults = Vec::new();

                    for account in &accounts {
                        let scope = Some(account.wholesaler_id);

                        match balance_of(conn, account.retailer_id, scope).await {
                            Ok(calculated) => {
                                // The cache clamps overpaid balances at
                                // zero, so that is what it is compared to
                                let expected_cache = calculated.max(Decimal::ZERO);
                                let delta = (expected_cache - account.used_credit).abs();
                                if delta > epsilon {
                                    discrepancies.push(Discrepancy {
                                        retailer_id: account.retailer_id,
                                        wholesaler_id: account.wholesaler_id,
                                        calculated,
                                        cached: account.used_credit,
                                        delta,
                                    });
                                }
                            }
                            Err(CoreError::IntegrityFault { detail, .. }) => {
                                chain_faults.push(ChainFault {
                                    retailer_id: account.retailer_id,
                                    wholesaler_id: account.wholesaler_id,
                                    detail,
                                });
                                continue;
                            }
                            Err(err) => return Err(err),
                        }

                        match verify_chain(conn, account.retailer_id, scope).await {
                            Ok(()) => {}
                            Err(CoreError::IntegrityFault { detail, .. }) => {
                                chain_faults.push(ChainFault {
                                    retailer_id: account.retailer_id,
                                    wholesaler_id: account.wholesaler_id,
                                    detail,
                                });
                            }
                            Err(err) => return Err(err),
                        }
                    }

                    Ok(ReconciliationReport {
                        run_at: Utc::now(),
                        accounts_checked,
                        discrepancies,
                        chain_faults,
                    })
                })
            })
            .await?;

        if report.is_clean() {
            tracing::info!(accounts = report.accounts_checked, "reconciliation clean");
        } else {
            tracing::warn!(
                accounts = report.accounts_checked,
                discrepancies = report.discrepancies.len(),
                chain_faults = report.chain_faults.len(),
                "reconciliation found drift"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_engine::{CreditEngine, CreditOptions, NewCreditAccount};
    use store_core::config::{RetryConfig, StoreConfig};
    use store_core::db::connect_and_init;
    use store_core::OrderId;

    async fn fixture() -> (
        tempfile::TempDir,
        Arc<TxExecutor>,
        CreditEngine,
        ReconAuditor,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("core.db"),
            ..StoreConfig::default()
        };
        let pool = connect_and_init(&config).await.unwrap();
        let executor = Arc::new(TxExecutor::new(pool, RetryConfig::default()));
        let engine = CreditEngine::new(executor.clone());
        let auditor = ReconAuditor::new(executor.clone(), AuditorConfig::default());
        (dir, executor, engine, auditor)
    }

    async fn relationship(engine: &CreditEngine) -> (RetailerId, WholesalerId) {
        let retailer = RetailerId::generate();
        let wholesaler = WholesalerId::generate();
        engine
            .create_account(NewCreditAccount {
                retailer_id: retailer,
                wholesaler_id: wholesaler,
                credit_limit: Decimal::from(1_000),
                terms_days: 30,
            })
            .await
            .unwrap();
        (retailer, wholesaler)
    }

    #[tokio::test]
    async fn test_clean_books_produce_empty_report() {
        let (_dir, _executor, engine, auditor) = fixture().await;
        let (retailer, wholesaler) = relationship(&engine).await;

        engine
            .acquire_and_validate_credit(
                OrderId::generate(),
                retailer,
                wholesaler,
                Decimal::from(250),
                CreditOptions::default(),
            )
            .await
            .unwrap();
        engine
            .record_payment(retailer, wholesaler, Decimal::from(100), "ops".to_string())
            .await
            .unwrap();

        let report = auditor.run_once().await.unwrap();
        assert_eq!(report.accounts_checked, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_skewed_cache_is_flagged() {
        let (_dir, executor, engine, auditor) = fixture().await;
        let (retailer, wholesaler) = relationship(&engine).await;

        engine
            .acquire_and_validate_credit(
                OrderId::generate(),
                retailer,
                wholesaler,
                Decimal::from(250),
                CreditOptions::default(),
            )
            .await
            .unwrap();

        // Skew the advisory cache behind the engine's back
        sqlx::query("UPDATE credit_accounts SET used_credit = '175' WHERE retailer_id = ?")
            .bind(retailer.to_string())
            .execute(executor.pool())
            .await
            .unwrap();

        let report = auditor.run_once().await.unwrap();
        assert_eq!(report.discrepancies.len(), 1);

        let drift = &report.discrepancies[0];
        assert_eq!(drift.calculated, Decimal::from(250));
        assert_eq!(drift.cached, Decimal::from(175));
        assert_eq!(drift.delta, Decimal::from(75));
        assert!(report.chain_faults.is_empty());
    }

    #[tokio::test]
    async fn test_drift_within_epsilon_tolerated() {
        let (_dir, executor, engine, auditor) = fixture().await;
        let (retailer, wholesaler) = relationship(&engine).await;

        engine
            .acquire_and_validate_credit(
                OrderId::generate(),
                retailer,
                wholesaler,
                Decimal::from(250),
                CreditOptions::default(),
            )
            .await
            .unwrap();

        // A rounding-sized nudge stays under the 0.01 epsilon
        sqlx::query("UPDATE credit_accounts SET used_credit = '250.005' WHERE retailer_id = ?")
            .bind(retailer.to_string())
            .execute(executor.pool())
            .await
            .unwrap();

        let report = auditor.run_once().await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_tampered_chain_is_reported_not_fatal() {
        let (_dir, executor, engine, auditor) = fixture().await;
        let (retailer, wholesaler) = relationship(&engine).await;
        let (other_retailer, other_wholesaler) = relationship(&engine).await;

        engine
            .acquire_and_validate_credit(
                OrderId::generate(),
                retailer,
                wholesaler,
                Decimal::from(250),
                CreditOptions::default(),
            )
            .await
            .unwrap();
        engine
            .acquire_and_validate_credit(
                OrderId::generate(),
                other_retailer,
                other_wholesaler,
                Decimal::from(90),
                CreditOptions::default(),
            )
            .await
            .unwrap();

        // Simulate tampering on one scope only
        sqlx::query("DROP TRIGGER ledger_entries_no_update")
            .execute(executor.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE ledger_entries SET amount = '9999' WHERE retailer_id = ?")
            .bind(retailer.to_string())
            .execute(executor.pool())
            .await
            .unwrap();

        let report = auditor.run_once().await.unwrap();
        assert_eq!(report.accounts_checked, 2);
        assert!(!report.chain_faults.is_empty());
        assert!(report
            .chain_faults
            .iter()
            .all(|fault| fault.retailer_id == retailer));
    }
}
