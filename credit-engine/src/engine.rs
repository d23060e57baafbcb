//! Credit reservation engine
//!
//! A reservation is one write transaction: the executor's up-front writer
//! lock plays the role of the exclusive account-row lock, the balance is
//! recomputed from the ledger (never from the cache), and the DEBIT is
//! appended in the same transaction that validated it. Two concurrent
//! reservations for the same relationship therefore serialize, and the
//! second one evaluates against the first one's committed balance.

use crate::accounts::{
    self, account_for, insert_account, refresh_used_credit, CreditAccount, NewCreditAccount,
};
use chrono::{Duration, Utc};
use ledger_core::{append_entry, balance_of, entry_by_id, find_by_order, EntryKind, LedgerEntry, NewLedgerEntry};
use rust_decimal::Decimal;
use std::sync::Arc;
use store_core::{CoreError, OrderId, Result, RetailerId, TxExecutor, TxOptions, WholesalerId};
use uuid::Uuid;

/// Identity recorded on entries this engine writes
const ENGINE_IDENTITY: &str = "credit-engine";

/// Per-call options for a reservation
#[derive(Debug, Clone, Copy, Default)]
pub struct CreditOptions {
    /// Override the executor's conflict-retry budget
    pub max_retries: Option<u32>,

    /// Wall-clock limit per transaction attempt
    pub timeout: Option<std::time::Duration>,
}

impl From<CreditOptions> for TxOptions {
    fn from(opts: CreditOptions) -> Self {
        TxOptions {
            timeout: opts.timeout,
            max_retries: opts.max_retries,
        }
    }
}

/// A committed (or idempotently replayed) reservation
#[derive(Debug, Clone)]
pub struct CreditReservation {
    /// The DEBIT entry backing the reservation
    pub ledger_entry_id: Uuid,

    /// Balance after the debit
    pub new_balance: Decimal,

    /// Credit still available under the limit
    pub available_credit: Decimal,

    /// True when a prior reservation for the same order was returned
    pub reused: bool,
}

/// A committed (or idempotently replayed) release
#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    /// The REVERSAL entry backing the release
    pub reversal_entry_id: Uuid,

    /// Balance after the reversal
    pub new_balance: Decimal,

    /// True when the order was already released
    pub reused: bool,
}

/// Credit reservation engine
pub struct CreditEngine {
    executor: Arc<TxExecutor>,
}

impl CreditEngine {
    /// Create an engine over an executor
    pub fn new(executor: Arc<TxExecutor>) -> Self {
        Self { executor }
    }

    /// Establish a credit relationship
    pub async fn create_account(&self, input: NewCreditAccount) -> Result<CreditAccount> {
        self.executor
            .run(move |conn| {
                let input = input.clone();
                Box::pin(async move { insert_account(conn, input).await })
            })
            .await
    }

    /// Load an account
    pub async fn account(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
    ) -> Result<Option<CreditAccount>> {
        self.executor
            .run_read(move |conn| {
                Box::pin(async move { account_for(conn, retailer_id, wholesaler_id).await })
            })
            .await
    }

    /// Block new reservations on an account
    pub async fn block_account(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
        reason: String,
    ) -> Result<()> {
        self.executor
            .run(move |conn| {
                let reason = reason.clone();
                Box::pin(async move {
                    accounts::set_blocked(conn, retailer_id, wholesaler_id, Some(reason)).await
                })
            })
            .await
    }

    /// Re-enable reservations on an account
    pub async fn unblock_account(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
    ) -> Result<()> {
        self.executor
            .run(move |conn| {
                Box::pin(async move {
                    accounts::set_blocked(conn, retailer_id, wholesaler_id, None).await
                })
            })
            .await
    }

    /// Change an account's credit limit
    pub async fn set_credit_limit(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
        credit_limit: Decimal,
    ) -> Result<()> {
        self.executor
            .run(move |conn| {
                Box::pin(async move {
                    accounts::set_credit_limit(conn, retailer_id, wholesaler_id, credit_limit)
                        .await
                })
            })
            .await
    }

    /// Atomically validate a prospective debit against the limit and, if it
    /// fits, commit it to the ledger.
    ///
    /// Idempotent per order: a repeat call with an order that already has a
    /// DEBIT returns the prior reservation unchanged.
    pub async fn acquire_and_validate_credit(
        &self,
        order_id: OrderId,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
        amount: Decimal,
        opts: CreditOptions,
    ) -> Result<CreditReservation> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::InvalidAmount(amount));
        }

        let reservation = self
            .executor
            .run_with(opts.into(), move |conn| {
                Box::pin(async move {
                    reserve_in_tx(conn, order_id, retailer_id, wholesaler_id, amount).await
                })
            })
            .await?;

        if reservation.reused {
            tracing::debug!(
                order = %order_id,
                entry = %reservation.ledger_entry_id,
                "reservation replayed for already-debited order"
            );
        } else {
            tracing::info!(
                order = %order_id,
                retailer = %retailer_id,
                wholesaler = %wholesaler_id,
                amount = %amount,
                new_balance = %reservation.new_balance,
                "credit reserved"
            );
        }

        Ok(reservation)
    }

    /// Undo a reservation by appending a REVERSAL of equal amount.
    ///
    /// The original DEBIT stays in the ledger untouched. Idempotent per
    /// order: releasing twice returns the first reversal.
    pub async fn release_credit_lock(
        &self,
        ledger_entry_id: Uuid,
        reason: &str,
    ) -> Result<ReleaseOutcome> {
        let outcome = self
            .executor
            .run(move |conn| {
                Box::pin(async move { release_in_tx(conn, ledger_entry_id).await })
            })
            .await?;

        tracing::info!(
            entry = %ledger_entry_id,
            reversal = %outcome.reversal_entry_id,
            reused = outcome.reused,
            reason,
            "credit reservation released"
        );

        Ok(outcome)
    }

    /// Record a payment from the retailer (CREDIT entry).
    pub async fn record_payment(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
        amount: Decimal,
        recorded_by: String,
    ) -> Result<LedgerEntry> {
        self.append_and_refresh(retailer_id, wholesaler_id, EntryKind::Credit, amount, recorded_by)
            .await
    }

    /// Record an administrator-only balance adjustment (ADJUSTMENT entry).
    ///
    /// Adjustments sit outside the concurrent reservation gate: they are an
    /// operator tool, pre-validated by the operator surface, and the limit
    /// check does not apply to them.
    pub async fn record_adjustment(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
        amount: Decimal,
        recorded_by: String,
    ) -> Result<LedgerEntry> {
        self.append_and_refresh(
            retailer_id,
            wholesaler_id,
            EntryKind::Adjustment,
            amount,
            recorded_by,
        )
        .await
    }

    async fn append_and_refresh(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: WholesalerId,
        entry_kind: EntryKind,
        amount: Decimal,
        recorded_by: String,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::InvalidAmount(amount));
        }

        self.executor
            .run(move |conn| {
                let recorded_by = recorded_by.clone();
                Box::pin(async move {
                    let entry = append_entry(
                        conn,
                        NewLedgerEntry {
                            retailer_id,
                            wholesaler_id: Some(wholesaler_id),
                            order_ref: None,
                            entry_kind,
                            amount,
                            created_by: recorded_by,
                            due_date: None,
                        },
                    )
                    .await?;

                    refresh_used_credit(conn, retailer_id, wholesaler_id, entry.balance_after)
                        .await?;

                    Ok(entry)
                })
            })
            .await
    }
}

async fn reserve_in_tx(
    conn: &mut sqlx::SqliteConnection,
    order_id: OrderId,
    retailer_id: RetailerId,
    wholesaler_id: WholesalerId,
    amount: Decimal,
) -> Result<CreditReservation> {
    // Idempotency: an order debits at most once, and the caller gets the
    // original outcome back
    if let Some(prior) = find_by_order(conn, order_id, EntryKind::Debit).await? {
        let account = account_for(conn, retailer_id, wholesaler_id)
            .await?
            .ok_or(CoreError::AccountNotFound {
                retailer_id: retailer_id.as_uuid(),
                wholesaler_id: wholesaler_id.as_uuid(),
            })?;
        return Ok(CreditReservation {
            ledger_entry_id: prior.entry_id,
            new_balance: prior.balance_after,
            available_credit: account.credit_limit - prior.balance_after,
            reused: true,
        });
    }

    // This read happens inside the write transaction: the writer lock is
    // already held, so the account state and the balance below cannot move
    // under us before commit
    let account = account_for(conn, retailer_id, wholesaler_id)
        .await?
        .ok_or(CoreError::AccountNotFound {
            retailer_id: retailer_id.as_uuid(),
            wholesaler_id: wholesaler_id.as_uuid(),
        })?;

    if !account.active || account.blocked_reason.is_some() {
        return Err(CoreError::CreditBlocked {
            reason: account
                .blocked_reason
                .unwrap_or_else(|| "account inactive".to_string()),
        });
    }

    let current_balance = balance_of(conn, retailer_id, Some(wholesaler_id)).await?;
    let projected = current_balance + amount;

    if projected > account.credit_limit {
        return Err(CoreError::InsufficientCredit {
            available_credit: (account.credit_limit - current_balance).max(Decimal::ZERO),
            projected_balance: projected,
            credit_limit: account.credit_limit,
        });
    }

    let entry = append_entry(
        conn,
        NewLedgerEntry {
            retailer_id,
            wholesaler_id: Some(wholesaler_id),
            order_ref: Some(order_id),
            entry_kind: EntryKind::Debit,
            amount,
            created_by: ENGINE_IDENTITY.to_string(),
            due_date: Some(Utc::now() + Duration::days(account.terms_days)),
        },
    )
    .await?;

    refresh_used_credit(conn, retailer_id, wholesaler_id, entry.balance_after).await?;

    Ok(CreditReservation {
        ledger_entry_id: entry.entry_id,
        new_balance: entry.balance_after,
        available_credit: account.credit_limit - entry.balance_after,
        reused: false,
    })
}

async fn release_in_tx(
    conn: &mut sqlx::SqliteConnection,
    ledger_entry_id: Uuid,
) -> Result<ReleaseOutcome> {
    let original = entry_by_id(conn, ledger_entry_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("ledger entry {}", ledger_entry_id)))?;

    if original.entry_kind != EntryKind::Debit {
        return Err(CoreError::InvalidState(format!(
            "entry {} is {}, only DEBIT reservations can be released",
            ledger_entry_id, original.entry_kind
        )));
    }

    let order_ref = original.order_ref.ok_or_else(|| {
        CoreError::InvalidState(format!(
            "entry {} has no order reference to release against",
            ledger_entry_id
        ))
    })?;

    if let Some(prior) = find_by_order(conn, order_ref, EntryKind::Reversal).await? {
        return Ok(ReleaseOutcome {
            reversal_entry_id: prior.entry_id,
            new_balance: prior.balance_after,
            reused: true,
        });
    }

    let reversal = append_entry(
        conn,
        NewLedgerEntry {
            retailer_id: original.retailer_id,
            wholesaler_id: original.wholesaler_id,
            order_ref: Some(order_ref),
            entry_kind: EntryKind::Reversal,
            amount: original.amount,
            created_by: ENGINE_IDENTITY.to_string(),
            due_date: None,
        },
    )
    .await?;

    if let Some(wholesaler_id) = original.wholesaler_id {
        refresh_used_credit(conn, original.retailer_id, wholesaler_id, reversal.balance_after)
            .await?;
    }

    Ok(ReleaseOutcome {
        reversal_entry_id: reversal.entry_id,
        new_balance: reversal.balance_after,
        reused: false,
    })
}
