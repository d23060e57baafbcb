//! Sokoni Ledger Core
//!
//! Append-only ledger of financial movements between retailers and
//! wholesalers, with tamper-evident hash chaining.
//!
//! # Invariants
//!
//! - Append-only: entries are never modified or deleted; corrections are
//!   new REVERSAL/CREDIT entries
//! - Balance law: each entry's balance_after equals the previous balance
//!   plus the entry's signed amount
//! - Hash chain: each entry's hash covers its content and the previous
//!   entry's hash for the same (retailer, wholesaler) scope
//!
//! The public surface deliberately has no update or delete operations; the
//! store's triggers reject any such attempt made behind the API's back.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod hash;
pub mod store;
pub mod types;

// Re-exports
pub use hash::{from_hex, to_hex, GENESIS_HASH};
pub use store::{
    append_entry, balance_of, chain_head, entries_for, entry_by_id, find_by_order, verify_chain,
    LedgerStore,
};
pub use types::{EntryKind, LedgerEntry, NewLedgerEntry};
