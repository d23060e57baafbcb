//! Sokoni Reconciliation Auditor
//!
//! Read-only sweep that recomputes every active account's balance from the
//! ledger and flags drift between the authoritative value and the advisory
//! cache. Also re-derives the hash chains, so out-of-band tampering
//! surfaces here even if it slipped past the store triggers.
//!
//! The auditor never mutates anything; it produces a report for the
//! reporting layer and is triggered by the external scheduler.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod auditor;

pub use auditor::{
    AuditorConfig, ChainFault, Discrepancy, ReconAuditor, ReconciliationReport,
};
