//! Hash chain helpers
//!
//! Entry hashes are SHA-256 digests computed field-by-field (see
//! [`crate::LedgerEntry::compute_hash`]); this module carries the genesis
//! value and the hex codec used at the store boundary.

use store_core::{CoreError, Result};

/// Previous-hash value for the first entry of a scope
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Lowercase hex rendering of a hash
pub fn to_hex(hash: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Parse a stored hex hash
pub fn from_hex(raw: &str) -> Result<[u8; 32]> {
    if raw.len() != 64 {
        return Err(CoreError::Decode(format!(
            "bad hash length {} (expected 64 hex chars)",
            raw.len()
        )));
    }

    let mut hash = [0u8; 32];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk)
            .map_err(|_| CoreError::Decode("hash is not valid utf-8".to_string()))?;
        hash[i] = u8::from_str_radix(pair, 16)
            .map_err(|_| CoreError::Decode(format!("bad hash hex '{}'", pair)))?;
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryKind, LedgerEntry};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use store_core::{OrderId, RetailerId, WholesalerId};
    use uuid::Uuid;

    #[test]
    fn test_hex_roundtrip() {
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = i as u8 * 7;
        }
        assert_eq!(from_hex(&to_hex(&hash)).unwrap(), hash);
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(from_hex("abc").is_err());
        assert!(from_hex(&"zz".repeat(32)).is_err());
    }

    fn fixture_entry() -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::from_u128(0x1111),
            retailer_id: RetailerId::new(Uuid::from_u128(0x2222)),
            wholesaler_id: Some(WholesalerId::new(Uuid::from_u128(0x3333))),
            order_ref: Some(OrderId::new(Uuid::from_u128(0x4444))),
            entry_kind: EntryKind::Debit,
            amount: Decimal::new(30000, 2),
            balance_after: Decimal::new(30000, 2),
            created_by: "credit-engine".to_string(),
            due_date: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            entry_hash: GENESIS_HASH,
            previous_hash: GENESIS_HASH,
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let entry = fixture_entry();
        assert_eq!(entry.compute_hash(), entry.compute_hash());
        assert_eq!(entry.compute_hash(), entry.clone().compute_hash());
    }

    #[test]
    fn test_hash_sensitive_to_each_field() {
        let base = fixture_entry();
        let base_hash = base.compute_hash();

        let mut changed = base.clone();
        changed.amount = Decimal::new(30001, 2);
        assert_ne!(changed.compute_hash(), base_hash);

        let mut changed = base.clone();
        changed.entry_kind = EntryKind::Adjustment;
        assert_ne!(changed.compute_hash(), base_hash);

        let mut changed = base.clone();
        changed.wholesaler_id = None;
        assert_ne!(changed.compute_hash(), base_hash);

        let mut changed = base.clone();
        changed.created_by = "credit-enginf".to_string();
        assert_ne!(changed.compute_hash(), base_hash);

        let mut changed = base.clone();
        changed.previous_hash = [7u8; 32];
        assert_ne!(changed.compute_hash(), base_hash);
    }

    #[test]
    fn test_adjacent_strings_cannot_alias() {
        // Length prefixes keep ("ab", "c") distinct from ("a", "bc")
        let mut a = fixture_entry();
        a.created_by = "ab".to_string();
        let mut b = fixture_entry();
        b.created_by = "a".to_string();
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    proptest! {
        #[test]
        fn prop_hash_deterministic(units in 1i64..1_000_000_000, scale in 0u32..4) {
            let mut entry = fixture_entry();
            entry.amount = Decimal::new(units, scale);
            entry.balance_after = entry.amount;
            prop_assert_eq!(entry.compute_hash(), entry.compute_hash());
        }

        #[test]
        fn prop_amount_changes_hash(units in 1i64..1_000_000_000) {
            let mut entry = fixture_entry();
            entry.amount = Decimal::from(units);
            let mut bumped = entry.clone();
            bumped.amount = Decimal::from(units + 1);
            prop_assert_ne!(entry.compute_hash(), bumped.compute_hash());
        }

        #[test]
        fn prop_previous_hash_changes_hash(seed in 1u8..=255) {
            let entry = fixture_entry();
            let mut relinked = entry.clone();
            relinked.previous_hash = [seed; 32];
            prop_assert_ne!(entry.compute_hash(), relinked.compute_hash());
        }
    }
}
