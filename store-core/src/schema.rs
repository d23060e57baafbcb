//! Store schema: tables, constraints, indexes, triggers
//!
//! The engines' public APIs are the primary enforcement boundary (the
//! ledger simply exports no mutate/delete operations); the constraints and
//! triggers here are the store-level backstop, so that even a raw
//! connection cannot break the invariants:
//!
//! - amounts and limits can never be negative (CHECK)
//! - ledger rows can never be updated or deleted (RAISE triggers)
//! - at most one non-null winner per routing (partial unique index)
//! - at most one response per (routing, candidate) (primary key)
//! - at most one DEBIT / one REVERSAL per order reference (partial unique)

use crate::db::DbPool;
use crate::error::Result;

/// Schema statements, executed one at a time in order.
const SCHEMA: &[&str] = &[
    // -- ledger ----------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        entry_id       TEXT PRIMARY KEY,
        retailer_id    TEXT NOT NULL,
        wholesaler_id  TEXT,
        order_ref      TEXT,
        entry_kind     TEXT NOT NULL
                       CHECK (entry_kind IN ('DEBIT','CREDIT','ADJUSTMENT','REVERSAL')),
        amount         TEXT NOT NULL CHECK (CAST(amount AS REAL) > 0.0),
        balance_after  TEXT NOT NULL,
        created_by     TEXT NOT NULL,
        due_date       TEXT,
        created_at     TEXT NOT NULL,
        entry_hash     TEXT NOT NULL,
        previous_hash  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_ledger_scope
        ON ledger_entries (retailer_id, wholesaler_id, created_at, entry_id)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_debit_per_order
        ON ledger_entries (order_ref)
        WHERE order_ref IS NOT NULL AND entry_kind = 'DEBIT'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_reversal_per_order
        ON ledger_entries (order_ref)
        WHERE order_ref IS NOT NULL AND entry_kind = 'REVERSAL'
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
    BEFORE UPDATE ON ledger_entries
    BEGIN
        SELECT RAISE(ABORT, 'ledger entries are immutable');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
    BEFORE DELETE ON ledger_entries
    BEGIN
        SELECT RAISE(ABORT, 'ledger entries are immutable');
    END
    "#,
    // -- credit accounts -------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS credit_accounts (
        retailer_id    TEXT NOT NULL,
        wholesaler_id  TEXT NOT NULL,
        credit_limit   TEXT NOT NULL CHECK (CAST(credit_limit AS REAL) >= 0.0),
        used_credit    TEXT NOT NULL DEFAULT '0' CHECK (CAST(used_credit AS REAL) >= 0.0),
        active         INTEGER NOT NULL DEFAULT 1,
        blocked_reason TEXT,
        terms_days     INTEGER NOT NULL DEFAULT 30,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL,
        PRIMARY KEY (retailer_id, wholesaler_id)
    )
    "#,
    // -- wholesaler candidate directory ----------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS wholesaler_profiles (
        wholesaler_id   TEXT PRIMARY KEY,
        active          INTEGER NOT NULL DEFAULT 1,
        service_areas   TEXT NOT NULL DEFAULT '[]',
        stock_available INTEGER NOT NULL DEFAULT 0 CHECK (stock_available >= 0),
        open_capacity   INTEGER NOT NULL DEFAULT 0 CHECK (open_capacity >= 0),
        min_order_total TEXT NOT NULL DEFAULT '0' CHECK (CAST(min_order_total AS REAL) >= 0.0),
        completion_rate REAL NOT NULL DEFAULT 0.0,
        rating          REAL NOT NULL DEFAULT 0.0,
        reliability     REAL NOT NULL DEFAULT 0.0
    )
    "#,
    // -- allocation ------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS allocation_routings (
        routing_id    TEXT PRIMARY KEY,
        order_ref     TEXT NOT NULL,
        retailer_id   TEXT NOT NULL,
        eligible_ids  TEXT NOT NULL,
        candidate_ids TEXT NOT NULL,
        locked_winner TEXT,
        locked_at     TEXT,
        version       INTEGER NOT NULL DEFAULT 0,
        status        TEXT NOT NULL DEFAULT 'BROADCAST'
                      CHECK (status IN ('BROADCAST','LOCKED','CANCELLATIONS_SENT','CLOSED')),
        created_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_routing_single_winner
        ON allocation_routings (routing_id)
        WHERE locked_winner IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS candidate_responses (
        routing_id   TEXT NOT NULL,
        candidate_id TEXT NOT NULL,
        kind         TEXT NOT NULL
                     CHECK (kind IN ('ACCEPT','REJECT','TIMEOUT','ERROR')),
        responded_at TEXT NOT NULL,
        note         TEXT,
        PRIMARY KEY (routing_id, candidate_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cancellation_records (
        routing_id   TEXT NOT NULL,
        candidate_id TEXT NOT NULL,
        reason       TEXT NOT NULL
                     CHECK (reason IN ('LOST_RACE','TIMED_OUT','NOT_SELECTED')),
        created_at   TEXT NOT NULL,
        PRIMARY KEY (routing_id, candidate_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS routing_audit (
        audit_id   TEXT PRIMARY KEY,
        routing_id TEXT NOT NULL,
        actor      TEXT NOT NULL,
        action     TEXT NOT NULL,
        note       TEXT,
        created_at TEXT NOT NULL
    )
    "#,
];

/// Apply the schema (idempotent).
pub async fn init(pool: &DbPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!("store schema initialised ({} statements)", SCHEMA.len());
    Ok(())
}
