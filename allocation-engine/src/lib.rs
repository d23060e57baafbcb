//! Sokoni Allocation Engine
//!
//! Broadcast-and-select routing of an order to exactly one wholesaler.
//! Many candidates may accept simultaneously; the winner is decided by a
//! conditional update on the persisted routing row (compare-and-set on
//! `locked_winner IS NULL`), never by an in-process lock, so the guarantee
//! holds across processes and machines.
//!
//! State machine per routing: `BROADCAST -> LOCKED -> CANCELLATIONS_SENT`.
//! The only way out of a locked routing is the audited administrative
//! reset, which closes it.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod notifier;
pub mod scoring;
pub mod types;

pub use engine::AllocationEngine;
pub use notifier::{NoopNotifier, Notifier, OutboundNotice, RecordingNotifier};
pub use scoring::AllocationConfig;
pub use types::{
    AcceptReason, AcceptanceResult, AllocationRouting, CancellationReason, CancellationRecord,
    CandidateResponse, EligibilityQuery, ResponseKind, RoutingStatus, TimeoutOutcome,
    WholesalerProfile,
};
