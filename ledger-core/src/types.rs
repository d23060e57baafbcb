//! Ledger entry types
//!
//! Amounts are exact decimals; the sign of a movement is carried by its
//! kind, never by the amount (amounts are always positive).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use store_core::types::{decimal_to_db, fmt_timestamp};
use store_core::{CoreError, OrderId, Result, RetailerId, WholesalerId};
use uuid::Uuid;

/// Kind of financial movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Money owed increases (order placed on credit)
    Debit,
    /// Money owed decreases (payment recorded)
    Credit,
    /// Administrative correction that increases the balance
    Adjustment,
    /// Undo of a prior debit (released reservation, cancelled order)
    Reversal,
}

impl EntryKind {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Debit => "DEBIT",
            EntryKind::Credit => "CREDIT",
            EntryKind::Adjustment => "ADJUSTMENT",
            EntryKind::Reversal => "REVERSAL",
        }
    }

    /// Parse the stored representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "DEBIT" => Ok(EntryKind::Debit),
            "CREDIT" => Ok(EntryKind::Credit),
            "ADJUSTMENT" => Ok(EntryKind::Adjustment),
            "REVERSAL" => Ok(EntryKind::Reversal),
            other => Err(CoreError::Decode(format!("unknown entry kind '{}'", other))),
        }
    }

    /// Whether this kind increases the balance
    pub fn is_positive(&self) -> bool {
        matches!(self, EntryKind::Debit | EntryKind::Adjustment)
    }

    /// The movement this kind applies to a balance
    pub fn signed(&self, amount: Decimal) -> Decimal {
        if self.is_positive() {
            amount
        } else {
            -amount
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted, immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry id (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Retailer the movement belongs to
    pub retailer_id: RetailerId,

    /// Wholesaler side of the relationship (None for platform-level entries)
    pub wholesaler_id: Option<WholesalerId>,

    /// Order that caused the movement, if any
    pub order_ref: Option<OrderId>,

    /// Kind of movement
    pub entry_kind: EntryKind,

    /// Movement size (always positive; the kind carries the sign)
    pub amount: Decimal,

    /// Running balance for this scope immediately after the entry
    pub balance_after: Decimal,

    /// Who created the entry (system component or operator)
    pub created_by: String,

    /// When payment falls due, for DEBIT entries on terms
    pub due_date: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// SHA-256 over this entry's content and the previous hash
    pub entry_hash: [u8; 32],

    /// Hash of the most recent prior entry in the same scope
    /// (genesis value for the first entry)
    pub previous_hash: [u8; 32],
}

impl LedgerEntry {
    /// Compute this entry's integrity hash.
    ///
    /// Covers every field except `entry_hash` itself, including
    /// `previous_hash`, so the chain is tamper-evident: altering any field
    /// of any persisted entry breaks every later link in its scope.
    /// Variable-length fields are length-prefixed so adjacent values can
    /// never alias.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();

        hasher.update(self.entry_id.as_bytes());
        hasher.update(self.retailer_id.as_uuid().as_bytes());

        match &self.wholesaler_id {
            Some(id) => {
                hasher.update([1u8]);
                hasher.update(id.as_uuid().as_bytes());
            }
            None => hasher.update([0u8]),
        }

        match &self.order_ref {
            Some(id) => {
                hasher.update([1u8]);
                hasher.update(id.as_uuid().as_bytes());
            }
            None => hasher.update([0u8]),
        }

        hasher.update(self.entry_kind.as_str().as_bytes());

        update_text(&mut hasher, &decimal_to_db(&self.amount));
        update_text(&mut hasher, &decimal_to_db(&self.balance_after));
        update_text(&mut hasher, &self.created_by);

        match self.due_date {
            Some(due) => {
                hasher.update([1u8]);
                update_text(&mut hasher, &fmt_timestamp(due));
            }
            None => hasher.update([0u8]),
        }

        update_text(&mut hasher, &fmt_timestamp(self.created_at));
        hasher.update(self.previous_hash);

        hasher.finalize().into()
    }
}

fn update_text(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_be_bytes());
    hasher.update(text.as_bytes());
}

/// Input for appending a new entry; ids, timestamps, balance and hashes
/// are assigned by the ledger itself.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    /// Retailer the movement belongs to
    pub retailer_id: RetailerId,

    /// Wholesaler side (None for platform-level entries)
    pub wholesaler_id: Option<WholesalerId>,

    /// Order that caused the movement, if any
    pub order_ref: Option<OrderId>,

    /// Kind of movement
    pub entry_kind: EntryKind,

    /// Movement size (must be positive)
    pub amount: Decimal,

    /// Who created the entry
    pub created_by: String,

    /// Payment due date, if on terms
    pub due_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            EntryKind::Debit,
            EntryKind::Credit,
            EntryKind::Adjustment,
            EntryKind::Reversal,
        ] {
            assert_eq!(EntryKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EntryKind::parse("PAYMENT").is_err());
    }

    #[test]
    fn test_signed_movements() {
        let amount = Decimal::from(50);
        assert_eq!(EntryKind::Debit.signed(amount), Decimal::from(50));
        assert_eq!(EntryKind::Adjustment.signed(amount), Decimal::from(50));
        assert_eq!(EntryKind::Credit.signed(amount), Decimal::from(-50));
        assert_eq!(EntryKind::Reversal.signed(amount), Decimal::from(-50));
    }
}
