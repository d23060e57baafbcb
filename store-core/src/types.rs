//! Shared identifier types and text codecs for stored values
//!
//! All values cross the store boundary as text: UUIDs hyphenated, decimals
//! in canonical form, timestamps as fixed-width RFC 3339. The codecs here
//! are the single place that parsing happens, so a malformed row surfaces
//! as a `Decode` error instead of a panic.

use crate::error::{CoreError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Retailer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetailerId(Uuid);

impl RetailerId {
    /// Wrap an existing id
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Mint a fresh time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RetailerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wholesaler identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WholesalerId(Uuid);

impl WholesalerId {
    /// Wrap an existing id
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Mint a fresh time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for WholesalerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order identifier, chosen by the caller (the ordering layer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Wrap an existing id
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Mint a fresh time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a stored UUID column
pub fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CoreError::Decode(format!("bad uuid '{}': {}", raw, e)))
}

/// Canonical text form of a decimal for storage and hashing.
///
/// Normalized so that equal values always render identically
/// ("60.00" and "60" both store as "60").
pub fn decimal_to_db(value: &Decimal) -> String {
    value.normalize().to_string()
}

/// Parse a stored decimal column
pub fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| CoreError::Decode(format!("bad decimal '{}': {}", raw, e)))
}

/// Fixed-width RFC 3339 rendering (microsecond precision, UTC).
///
/// Fixed width keeps lexicographic order identical to chronological order,
/// which the ledger relies on for its ORDER BY.
pub fn fmt_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Decode(format!("bad timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_roundtrip_normalized() {
        let a = Decimal::new(6000, 2); // 60.00
        let b = Decimal::from(60);
        assert_eq!(decimal_to_db(&a), decimal_to_db(&b));
        assert_eq!(parse_decimal(&decimal_to_db(&a)).unwrap(), b);
    }

    #[test]
    fn test_timestamp_order_is_lexicographic() {
        let earlier = parse_timestamp("2024-05-01T12:00:00.123456Z").unwrap();
        let later = earlier + chrono::Duration::microseconds(1500);
        assert!(fmt_timestamp(earlier) < fmt_timestamp(later));
        assert_eq!(parse_timestamp(&fmt_timestamp(earlier)).unwrap(), earlier);
    }

    #[test]
    fn test_bad_values_decode_error() {
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_decimal("sixty").is_err());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
