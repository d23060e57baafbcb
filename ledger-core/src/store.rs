//! Ledger persistence
//!
//! Connection-level operations compose into a caller's transaction (the
//! credit engine appends inside its own reservation transaction);
//! [`LedgerStore`] wraps them for callers that want a self-contained
//! transaction per call.
//!
//! There is intentionally no update or delete anywhere in this module.

use crate::hash::{from_hex, to_hex, GENESIS_HASH};
use crate::types::{EntryKind, LedgerEntry, NewLedgerEntry};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use store_core::types::{
    decimal_to_db, fmt_timestamp, parse_decimal, parse_timestamp, parse_uuid,
};
use store_core::{
    CoreError, OrderId, Result, RetailerId, TxExecutor, WholesalerId,
};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "entry_id, retailer_id, wholesaler_id, order_ref, entry_kind, \
                             amount, balance_after, created_by, due_date, created_at, \
                             entry_hash, previous_hash";

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    let entry_id: String = row.try_get("entry_id")?;
    let retailer_id: String = row.try_get("retailer_id")?;
    let wholesaler_id: Option<String> = row.try_get("wholesaler_id")?;
    let order_ref: Option<String> = row.try_get("order_ref")?;
    let entry_kind: String = row.try_get("entry_kind")?;
    let amount: String = row.try_get("amount")?;
    let balance_after: String = row.try_get("balance_after")?;
    let created_by: String = row.try_get("created_by")?;
    let due_date: Option<String> = row.try_get("due_date")?;
    let created_at: String = row.try_get("created_at")?;
    let entry_hash: String = row.try_get("entry_hash")?;
    let previous_hash: String = row.try_get("previous_hash")?;

    Ok(LedgerEntry {
        entry_id: parse_uuid(&entry_id)?,
        retailer_id: RetailerId::new(parse_uuid(&retailer_id)?),
        wholesaler_id: wholesaler_id
            .as_deref()
            .map(|raw| parse_uuid(raw).map(WholesalerId::new))
            .transpose()?,
        order_ref: order_ref
            .as_deref()
            .map(|raw| parse_uuid(raw).map(OrderId::new))
            .transpose()?,
        entry_kind: EntryKind::parse(&entry_kind)?,
        amount: parse_decimal(&amount)?,
        balance_after: parse_decimal(&balance_after)?,
        created_by,
        due_date: due_date.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        entry_hash: from_hex(&entry_hash)?,
        previous_hash: from_hex(&previous_hash)?,
    })
}

/// Most recent entry for a (retailer, wholesaler) scope, if any.
pub async fn chain_head(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: Option<WholesalerId>,
) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries \
         WHERE retailer_id = ? AND wholesaler_id IS ? \
         ORDER BY created_at DESC, entry_id DESC LIMIT 1",
        ENTRY_COLUMNS
    );

    let row = sqlx::query(&sql)
        .bind(retailer_id.to_string())
        .bind(wholesaler_id.map(|w| w.to_string()))
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Append a movement to the ledger.
///
/// Validates the amount, links the new entry to the scope's chain head,
/// derives `balance_after` from the head's running balance, and persists
/// the row with its integrity hash. Returns the persisted entry.
pub async fn append_entry(
    conn: &mut SqliteConnection,
    input: NewLedgerEntry,
) -> Result<LedgerEntry> {
    if input.amount <= Decimal::ZERO {
        return Err(CoreError::InvalidAmount(input.amount));
    }

    let head = chain_head(conn, input.retailer_id, input.wholesaler_id).await?;
    let (previous_hash, previous_balance) = match &head {
        Some(entry) => (entry.entry_hash, entry.balance_after),
        None => (GENESIS_HASH, Decimal::ZERO),
    };

    let mut entry = LedgerEntry {
        entry_id: Uuid::now_v7(),
        retailer_id: input.retailer_id,
        wholesaler_id: input.wholesaler_id,
        order_ref: input.order_ref,
        entry_kind: input.entry_kind,
        amount: input.amount,
        balance_after: previous_balance + input.entry_kind.signed(input.amount),
        created_by: input.created_by,
        due_date: input.due_date,
        created_at: Utc::now(),
        entry_hash: GENESIS_HASH, // placeholder, computed below
        previous_hash,
    };
    entry.entry_hash = entry.compute_hash();

    sqlx::query(
        "INSERT INTO ledger_entries \
         (entry_id, retailer_id, wholesaler_id, order_ref, entry_kind, amount, balance_after, \
          created_by, due_date, created_at, entry_hash, previous_hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.entry_id.to_string())
    .bind(entry.retailer_id.to_string())
    .bind(entry.wholesaler_id.map(|w| w.to_string()))
    .bind(entry.order_ref.map(|o| o.to_string()))
    .bind(entry.entry_kind.as_str())
    .bind(decimal_to_db(&entry.amount))
    .bind(decimal_to_db(&entry.balance_after))
    .bind(entry.created_by.clone())
    .bind(entry.due_date.map(fmt_timestamp))
    .bind(fmt_timestamp(entry.created_at))
    .bind(to_hex(&entry.entry_hash))
    .bind(to_hex(&entry.previous_hash))
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        entry_id = %entry.entry_id,
        kind = %entry.entry_kind,
        amount = %entry.amount,
        balance_after = %entry.balance_after,
        "ledger entry appended"
    );

    Ok(entry)
}

/// All entries for a scope, oldest first.
pub async fn entries_for(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: Option<WholesalerId>,
) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries \
         WHERE retailer_id = ? AND wholesaler_id IS ? \
         ORDER BY created_at ASC, entry_id ASC",
        ENTRY_COLUMNS
    );

    let rows = sqlx::query(&sql)
        .bind(retailer_id.to_string())
        .bind(wholesaler_id.map(|w| w.to_string()))
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Look up one entry by id.
pub async fn entry_by_id(
    conn: &mut SqliteConnection,
    entry_id: Uuid,
) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries WHERE entry_id = ?",
        ENTRY_COLUMNS
    );

    let row = sqlx::query(&sql)
        .bind(entry_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Look up the entry of a given kind tied to an order, if any.
///
/// DEBIT and REVERSAL entries are unique per order (enforced by partial
/// unique indexes), which is what makes reservation and release idempotent.
pub async fn find_by_order(
    conn: &mut SqliteConnection,
    order_ref: OrderId,
    kind: EntryKind,
) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries WHERE order_ref = ? AND entry_kind = ? \
         ORDER BY created_at ASC LIMIT 1",
        ENTRY_COLUMNS
    );

    let row = sqlx::query(&sql)
        .bind(order_ref.to_string())
        .bind(kind.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Current balance for a scope: the signed reduction over all entries.
///
/// The reduction is cross-checked against the newest entry's recorded
/// `balance_after`; disagreement means the ledger itself is inconsistent
/// and surfaces as a hard [`CoreError::IntegrityFault`].
pub async fn balance_of(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: Option<WholesalerId>,
) -> Result<Decimal> {
    let entries = entries_for(conn, retailer_id, wholesaler_id).await?;

    let Some(last) = entries.last() else {
        return Ok(Decimal::ZERO);
    };

    let total = entries
        .iter()
        .fold(Decimal::ZERO, |acc, e| acc + e.entry_kind.signed(e.amount));

    if total != last.balance_after {
        return Err(CoreError::IntegrityFault {
            retailer_id: retailer_id.as_uuid(),
            detail: format!(
                "reduction {} disagrees with last balance_after {} (entry {})",
                total, last.balance_after, last.entry_id
            ),
        });
    }

    Ok(total)
}

/// Re-derive every hash link and running balance for a scope.
///
/// Detects any tampering that slipped past the store triggers (an edited
/// field, a re-linked chain, a forged balance).
pub async fn verify_chain(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: Option<WholesalerId>,
) -> Result<()> {
    let entries = entries_for(conn, retailer_id, wholesaler_id).await?;

    let mut expected_previous = GENESIS_HASH;
    let mut running = Decimal::ZERO;

    for entry in &entries {
        if entry.previous_hash != expected_previous {
            return Err(CoreError::IntegrityFault {
                retailer_id: retailer_id.as_uuid(),
                detail: format!("entry {} does not link to its predecessor", entry.entry_id),
            });
        }

        if entry.compute_hash() != entry.entry_hash {
            return Err(CoreError::IntegrityFault {
                retailer_id: retailer_id.as_uuid(),
                detail: format!("entry {} content does not match its hash", entry.entry_id),
            });
        }

        running += entry.entry_kind.signed(entry.amount);
        if running != entry.balance_after {
            return Err(CoreError::IntegrityFault {
                retailer_id: retailer_id.as_uuid(),
                detail: format!(
                    "entry {} records balance {} but the reduction gives {}",
                    entry.entry_id, entry.balance_after, running
                ),
            });
        }

        expected_previous = entry.entry_hash;
    }

    Ok(())
}

/// Self-contained ledger API: one transaction per call.
///
/// The exported surface has no mutation or removal entry points; the store
/// triggers back that up for anything reaching the table directly.
pub struct LedgerStore {
    executor: Arc<TxExecutor>,
}

impl LedgerStore {
    /// Create a store over an executor
    pub fn new(executor: Arc<TxExecutor>) -> Self {
        Self { executor }
    }

    /// Append a movement in its own transaction
    pub async fn append(&self, input: NewLedgerEntry) -> Result<LedgerEntry> {
        self.executor
            .run(move |conn| {
                let input = input.clone();
                Box::pin(async move { append_entry(conn, input).await })
            })
            .await
    }

    /// Current balance for a scope
    pub async fn balance(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: Option<WholesalerId>,
    ) -> Result<Decimal> {
        self.executor
            .run_read(move |conn| {
                Box::pin(async move { balance_of(conn, retailer_id, wholesaler_id).await })
            })
            .await
    }

    /// All entries for a scope, oldest first
    pub async fn entries(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: Option<WholesalerId>,
    ) -> Result<Vec<LedgerEntry>> {
        self.executor
            .run_read(move |conn| {
                Box::pin(async move { entries_for(conn, retailer_id, wholesaler_id).await })
            })
            .await
    }

    /// Look up one entry by id
    pub async fn entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>> {
        self.executor
            .run_read(move |conn| Box::pin(async move { entry_by_id(conn, entry_id).await }))
            .await
    }

    /// Verify a scope's hash chain and balance law
    pub async fn verify_chain(
        &self,
        retailer_id: RetailerId,
        wholesaler_id: Option<WholesalerId>,
    ) -> Result<()> {
        self.executor
            .run_read(move |conn| {
                Box::pin(async move { verify_chain(conn, retailer_id, wholesaler_id).await })
            })
            .await
    }
}
