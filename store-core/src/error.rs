//! Shared error taxonomy for the financial core

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the store and the engines built on it
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database error (sqlx)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row decoding error (stored text could not be parsed back)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Ledger amounts must be strictly positive
    #[error("Invalid amount {0}: ledger amounts must be positive")]
    InvalidAmount(Decimal),

    /// An update or delete touched a persisted ledger row
    #[error("Immutability violation: ledger entries cannot be updated or deleted")]
    ImmutabilityViolation,

    /// Derived state disagrees with the ledger (hard fault, never repaired in place)
    #[error("Ledger integrity fault for retailer {retailer_id}: {detail}")]
    IntegrityFault {
        /// Retailer scope of the broken ledger
        retailer_id: Uuid,
        /// What disagreed
        detail: String,
    },

    /// No credit account exists for the relationship
    #[error("Credit account not found for retailer {retailer_id} / wholesaler {wholesaler_id}")]
    AccountNotFound {
        /// Retailer side of the relationship
        retailer_id: Uuid,
        /// Wholesaler side of the relationship
        wholesaler_id: Uuid,
    },

    /// The credit account is inactive or blocked
    #[error("Credit account blocked: {reason}")]
    CreditBlocked {
        /// Why the account is blocked
        reason: String,
    },

    /// The prospective debit does not fit under the credit limit
    #[error("Insufficient credit: available {available_credit}, projected balance {projected_balance} over limit {credit_limit}")]
    InsufficientCredit {
        /// How much credit is still available (never negative)
        available_credit: Decimal,
        /// What the balance would have been after the debit
        projected_balance: Decimal,
        /// The relationship's credit limit
        credit_limit: Decimal,
    },

    /// No wholesaler qualified for the order
    #[error("No eligible candidates for order {order_ref}")]
    NoEligibleCandidates {
        /// Order that could not be routed
        order_ref: Uuid,
    },

    /// A candidate may respond to a routing only once
    #[error("Duplicate response from candidate {candidate_id} on routing {routing_id}")]
    DuplicateResponse {
        /// Routing being responded to
        routing_id: Uuid,
        /// Candidate that already responded
        candidate_id: Uuid,
    },

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Store-detected write conflict between concurrent transactions.
    /// Recovered internally by the executor; callers only ever see
    /// `MaxRetriesExceeded` once the retry budget is spent.
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// The retry budget was exhausted without a successful commit
    #[error("Transaction failed after {attempts} conflict retries: {last}")]
    MaxRetriesExceeded {
        /// Conflict retries performed
        attempts: u32,
        /// The last underlying conflict
        last: String,
    },

    /// Wall-clock deadline expired before the transaction committed
    #[error("Operation timed out")]
    Timeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Whether this error is a store-detected write conflict that a fresh
    /// attempt of the same transaction may resolve.
    ///
    /// Recognises both the already-classified variant and a raw `Database`
    /// error that was converted with `?`, so work closures do not need to
    /// classify every query themselves.
    pub fn is_serialization_conflict(&self) -> bool {
        match self {
            CoreError::SerializationConflict(_) => true,
            CoreError::Database(err) => is_busy_error(err),
            _ => false,
        }
    }
}

/// SQLite result codes that signal lock contention between writers.
///
/// 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED, plus their extended variants.
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517", "773"];

/// Whether a raw sqlx error is writer-lock contention.
pub fn is_busy_error(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| {
            let code = db.code().map(|c| c.to_string());
            code.as_deref().map(|c| BUSY_CODES.contains(&c)).unwrap_or(false)
                || db.message().contains("database is locked")
                || db.message().contains("database table is locked")
        })
        .unwrap_or(false)
}

/// Map a low-level sqlx error into the core taxonomy.
///
/// Lock contention becomes `SerializationConflict` (retryable); a rejected
/// write against a ledger row becomes `ImmutabilityViolation`; everything
/// else stays a `Database` error.
pub fn classify_db_error(err: sqlx::Error) -> CoreError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.message().contains("immutable") {
            return CoreError::ImmutabilityViolation;
        }
    }
    if is_busy_error(&err) {
        let message = err
            .as_database_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string());
        return CoreError::SerializationConflict(message);
    }
    CoreError::Database(err)
}

/// Whether a raw sqlx error is a unique-constraint violation.
///
/// Engines use this to map expected collisions (duplicate response rows,
/// idempotent inserts) to business outcomes instead of surfacing raw
/// database errors.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| {
            let code = db.code().map(|c| c.to_string());
            matches!(code.as_deref(), Some("1555") | Some("2067"))
                || db.message().contains("UNIQUE constraint failed")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let err = CoreError::SerializationConflict("database is locked".to_string());
        assert!(err.is_serialization_conflict());

        let err = CoreError::Timeout;
        assert!(!err.is_serialization_conflict());
    }

    #[test]
    fn test_error_display_carries_detail() {
        let err = CoreError::InsufficientCredit {
            available_credit: Decimal::new(4000, 2),
            projected_balance: Decimal::new(16000, 2),
            credit_limit: Decimal::new(10000, 2),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("40.00"));
        assert!(rendered.contains("160.00"));
        assert!(rendered.contains("100.00"));
    }
}
