//! Credit account rows
//!
//! One account per (retailer, wholesaler) relationship. The `used_credit`
//! column is an advisory cache maintained alongside ledger writes; gating
//! decisions always recompute from the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use store_core::types::{decimal_to_db, fmt_timestamp, parse_decimal, parse_timestamp, parse_uuid};
use store_core::{CoreError, Result, RetailerId, WholesalerId};

/// A credit relationship between a retailer and a wholesaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    /// Retailer side
    pub retailer_id: RetailerId,

    /// Wholesaler side
    pub wholesaler_id: WholesalerId,

    /// Maximum balance the retailer may carry
    pub credit_limit: Decimal,

    /// Advisory cache of the current balance (authoritative value lives
    /// in the ledger)
    pub used_credit: Decimal,

    /// Whether new reservations are allowed
    pub active: bool,

    /// Why the account is blocked, when it is
    pub blocked_reason: Option<String>,

    /// Payment terms in days (drives DEBIT due dates)
    pub terms_days: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Advisory available credit based on the cached balance
    pub fn cached_available(&self) -> Decimal {
        (self.credit_limit - self.used_credit).max(Decimal::ZERO)
    }
}

/// Input for establishing a relationship
#[derive(Debug, Clone)]
pub struct NewCreditAccount {
    /// Retailer side
    pub retailer_id: RetailerId,

    /// Wholesaler side
    pub wholesaler_id: WholesalerId,

    /// Credit limit (must be non-negative)
    pub credit_limit: Decimal,

    /// Payment terms in days
    pub terms_days: i64,
}

fn account_from_row(row: &SqliteRow) -> Result<CreditAccount> {
    let retailer_id: String = row.try_get("retailer_id")?;
    let wholesaler_id: String = row.try_get("wholesaler_id")?;
    let credit_limit: String = row.try_get("credit_limit")?;
    let used_credit: String = row.try_get("used_credit")?;
    let active: bool = row.try_get("active")?;
    let blocked_reason: Option<String> = row.try_get("blocked_reason")?;
    let terms_days: i64 = row.try_get("terms_days")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(CreditAccount {
        retailer_id: RetailerId::new(parse_uuid(&retailer_id)?),
        wholesaler_id: WholesalerId::new(parse_uuid(&wholesaler_id)?),
        credit_limit: parse_decimal(&credit_limit)?,
        used_credit: parse_decimal(&used_credit)?,
        active,
        blocked_reason,
        terms_days,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Insert a new account row.
pub async fn insert_account(
    conn: &mut SqliteConnection,
    input: NewCreditAccount,
) -> Result<CreditAccount> {
    if input.credit_limit < Decimal::ZERO {
        return Err(CoreError::InvalidState(format!(
            "credit limit {} cannot be negative",
            input.credit_limit
        )));
    }

    let now = Utc::now();
    sqlx::query(
        "INSERT INTO credit_accounts \
         (retailer_id, wholesaler_id, credit_limit, used_credit, active, blocked_reason, \
          terms_days, created_at, updated_at) \
         VALUES (?, ?, ?, '0', 1, NULL, ?, ?, ?)",
    )
    .bind(input.retailer_id.to_string())
    .bind(input.wholesaler_id.to_string())
    .bind(decimal_to_db(&input.credit_limit))
    .bind(input.terms_days)
    .bind(fmt_timestamp(now))
    .bind(fmt_timestamp(now))
    .execute(&mut *conn)
    .await?;

    Ok(CreditAccount {
        retailer_id: input.retailer_id,
        wholesaler_id: input.wholesaler_id,
        credit_limit: input.credit_limit,
        used_credit: Decimal::ZERO,
        active: true,
        blocked_reason: None,
        terms_days: input.terms_days,
        created_at: now,
        updated_at: now,
    })
}

/// Load the account for a relationship, if established.
pub async fn account_for(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: WholesalerId,
) -> Result<Option<CreditAccount>> {
    let row = sqlx::query(
        "SELECT retailer_id, wholesaler_id, credit_limit, used_credit, active, blocked_reason, \
                terms_days, created_at, updated_at \
         FROM credit_accounts WHERE retailer_id = ? AND wholesaler_id = ?",
    )
    .bind(retailer_id.to_string())
    .bind(wholesaler_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(account_from_row).transpose()
}

/// All active accounts (for the reconciliation sweep).
pub async fn active_accounts(conn: &mut SqliteConnection) -> Result<Vec<CreditAccount>> {
    let rows = sqlx::query(
        "SELECT retailer_id, wholesaler_id, credit_limit, used_credit, active, blocked_reason, \
                terms_days, created_at, updated_at \
         FROM credit_accounts WHERE active = 1 \
         ORDER BY retailer_id, wholesaler_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(account_from_row).collect()
}

/// Refresh the advisory balance cache.
pub async fn refresh_used_credit(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: WholesalerId,
    used_credit: Decimal,
) -> Result<()> {
    // The cache column carries a non-negative CHECK; an overpaid (negative)
    // balance is cached as zero.
    let cached = used_credit.max(Decimal::ZERO);

    sqlx::query(
        "UPDATE credit_accounts SET used_credit = ?, updated_at = ? \
         WHERE retailer_id = ? AND wholesaler_id = ?",
    )
    .bind(decimal_to_db(&cached))
    .bind(fmt_timestamp(Utc::now()))
    .bind(retailer_id.to_string())
    .bind(wholesaler_id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Block or unblock the account.
pub async fn set_blocked(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: WholesalerId,
    reason: Option<String>,
) -> Result<()> {
    let active = reason.is_none();
    let result = sqlx::query(
        "UPDATE credit_accounts SET active = ?, blocked_reason = ?, updated_at = ? \
         WHERE retailer_id = ? AND wholesaler_id = ?",
    )
    .bind(active)
    .bind(reason)
    .bind(fmt_timestamp(Utc::now()))
    .bind(retailer_id.to_string())
    .bind(wholesaler_id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::AccountNotFound {
            retailer_id: retailer_id.as_uuid(),
            wholesaler_id: wholesaler_id.as_uuid(),
        });
    }
    Ok(())
}

/// Change the credit limit.
pub async fn set_credit_limit(
    conn: &mut SqliteConnection,
    retailer_id: RetailerId,
    wholesaler_id: WholesalerId,
    credit_limit: Decimal,
) -> Result<()> {
    if credit_limit < Decimal::ZERO {
        return Err(CoreError::InvalidState(format!(
            "credit limit {} cannot be negative",
            credit_limit
        )));
    }

    let result = sqlx::query(
        "UPDATE credit_accounts SET credit_limit = ?, updated_at = ? \
         WHERE retailer_id = ? AND wholesaler_id = ?",
    )
    .bind(decimal_to_db(&credit_limit))
    .bind(fmt_timestamp(Utc::now()))
    .bind(retailer_id.to_string())
    .bind(wholesaler_id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::AccountNotFound {
            retailer_id: retailer_id.as_uuid(),
            wholesaler_id: wholesaler_id.as_uuid(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_available_never_negative() {
        let account = CreditAccount {
            retailer_id: RetailerId::generate(),
            wholesaler_id: WholesalerId::generate(),
            credit_limit: Decimal::from(100),
            used_credit: Decimal::from(130),
            active: true,
            blocked_reason: None,
            terms_days: 30,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(account.cached_available(), Decimal::ZERO);
    }
}
