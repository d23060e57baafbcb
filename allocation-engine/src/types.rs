//! Allocation domain types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use store_core::{CoreError, OrderId, Result, RetailerId, WholesalerId};
use uuid::Uuid;

/// Routing lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStatus {
    /// Opportunity sent to candidates, no winner yet
    Broadcast,
    /// Winner locked
    Locked,
    /// Winner locked and losers notified
    CancellationsSent,
    /// Closed by administrative reset
    Closed,
}

impl RoutingStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStatus::Broadcast => "BROADCAST",
            RoutingStatus::Locked => "LOCKED",
            RoutingStatus::CancellationsSent => "CANCELLATIONS_SENT",
            RoutingStatus::Closed => "CLOSED",
        }
    }

    /// Parse the stored representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "BROADCAST" => Ok(RoutingStatus::Broadcast),
            "LOCKED" => Ok(RoutingStatus::Locked),
            "CANCELLATIONS_SENT" => Ok(RoutingStatus::CancellationsSent),
            "CLOSED" => Ok(RoutingStatus::Closed),
            other => Err(CoreError::Decode(format!("unknown routing status '{}'", other))),
        }
    }
}

impl fmt::Display for RoutingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a candidate answered a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Candidate wants the order
    Accept,
    /// Candidate declined
    Reject,
    /// Candidate never answered within the TTL
    Timeout,
    /// Delivery or processing failure on the candidate side
    Error,
}

impl ResponseKind {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Accept => "ACCEPT",
            ResponseKind::Reject => "REJECT",
            ResponseKind::Timeout => "TIMEOUT",
            ResponseKind::Error => "ERROR",
        }
    }

    /// Parse the stored representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "ACCEPT" => Ok(ResponseKind::Accept),
            "REJECT" => Ok(ResponseKind::Reject),
            "TIMEOUT" => Ok(ResponseKind::Timeout),
            "ERROR" => Ok(ResponseKind::Error),
            other => Err(CoreError::Decode(format!("unknown response kind '{}'", other))),
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a candidate received a cancellation notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationReason {
    /// Accepted, but another candidate locked first
    LostRace,
    /// Never answered before the routing resolved
    TimedOut,
    /// Answered without accepting, or was simply not chosen
    NotSelected,
}

impl CancellationReason {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::LostRace => "LOST_RACE",
            CancellationReason::TimedOut => "TIMED_OUT",
            CancellationReason::NotSelected => "NOT_SELECTED",
        }
    }

    /// Parse the stored representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "LOST_RACE" => Ok(CancellationReason::LostRace),
            "TIMED_OUT" => Ok(CancellationReason::TimedOut),
            "NOT_SELECTED" => Ok(CancellationReason::NotSelected),
            other => Err(CoreError::Decode(format!(
                "unknown cancellation reason '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One broadcast-and-select cycle for an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRouting {
    /// Routing id
    pub routing_id: Uuid,

    /// Order being routed
    pub order_ref: OrderId,

    /// Retailer that placed the order
    pub retailer_id: RetailerId,

    /// Every wholesaler that qualified (audit record)
    pub eligible_ids: Vec<WholesalerId>,

    /// The top-K invited to compete
    pub candidate_ids: Vec<WholesalerId>,

    /// The single winner, once locked
    pub locked_winner: Option<WholesalerId>,

    /// When the winner locked
    pub locked_at: Option<DateTime<Utc>>,

    /// Bumped on every mutation of the row
    pub version: i64,

    /// Lifecycle state
    pub status: RoutingStatus,

    /// Broadcast timestamp
    pub created_at: DateTime<Utc>,
}

/// A candidate's answer to a broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateResponse {
    /// Routing answered
    pub routing_id: Uuid,

    /// Candidate answering
    pub candidate_id: WholesalerId,

    /// The answer
    pub kind: ResponseKind,

    /// When it was recorded
    pub responded_at: DateTime<Utc>,

    /// Free-form detail (e.g. why an acceptance was rewritten)
    pub note: Option<String>,
}

/// Cancellation issued to a candidate that did not win
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRecord {
    /// Routing the cancellation belongs to
    pub routing_id: Uuid,

    /// Candidate being cancelled
    pub candidate_id: WholesalerId,

    /// Why
    pub reason: CancellationReason,

    /// When it was recorded
    pub created_at: DateTime<Utc>,
}

/// A wholesaler's standing in the candidate directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WholesalerProfile {
    /// Wholesaler id
    pub wholesaler_id: WholesalerId,

    /// Whether the wholesaler takes orders at all
    pub active: bool,

    /// Areas the wholesaler delivers to
    pub service_areas: Vec<String>,

    /// Units in stock
    pub stock_available: i64,

    /// Orders the wholesaler can still take on
    pub open_capacity: i64,

    /// Smallest order total the wholesaler accepts
    pub min_order_total: Decimal,

    /// Share of past orders completed, in [0, 1]
    pub completion_rate: f64,

    /// Retailer rating, in [0, 5]
    pub rating: f64,

    /// Delivery reliability, in [0, 1]
    pub reliability: f64,
}

/// What an order needs from a candidate
#[derive(Debug, Clone)]
pub struct EligibilityQuery {
    /// Retailer's delivery area
    pub service_area: String,

    /// Units the order needs in stock
    pub units_required: i64,

    /// Order total, checked against candidate minimums
    pub order_total: Decimal,
}

impl EligibilityQuery {
    /// Whether a profile qualifies for this order
    pub fn matches(&self, profile: &WholesalerProfile) -> bool {
        profile.active
            && profile.open_capacity > 0
            && profile.stock_available >= self.units_required
            && profile.min_order_total <= self.order_total
            && profile
                .service_areas
                .iter()
                .any(|area| area == &self.service_area)
    }
}

/// Why an acceptance call resolved the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    /// This call won the race
    Locked,
    /// This candidate had already won (idempotent repeat)
    AlreadyAccepted,
    /// Another winner was already visible when the call started
    AlreadyLocked,
    /// Another caller won between this call's read and its update
    LostRace,
}

/// Outcome of an acceptance attempt. Losing is an expected result of
/// normal contention, not an error.
#[derive(Debug, Clone)]
pub struct AcceptanceResult {
    /// Whether this candidate holds the lock
    pub accepted: bool,

    /// How the outcome came about
    pub reason: AcceptReason,

    /// The current winner (this candidate when accepted)
    pub locked_candidate: Option<WholesalerId>,
}

/// Outcome of a timeout sweep
#[derive(Debug, Clone)]
pub struct TimeoutOutcome {
    /// Candidates marked TIMEOUT in this sweep
    pub timed_out: Vec<WholesalerId>,

    /// Winner chosen by auto-selection, if the sweep locked one
    pub auto_selected: Option<WholesalerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> WholesalerProfile {
        WholesalerProfile {
            wholesaler_id: WholesalerId::generate(),
            active: true,
            service_areas: vec!["nairobi-west".to_string()],
            stock_available: 100,
            open_capacity: 5,
            min_order_total: Decimal::from(50),
            completion_rate: 0.9,
            rating: 4.5,
            reliability: 0.95,
        }
    }

    fn query() -> EligibilityQuery {
        EligibilityQuery {
            service_area: "nairobi-west".to_string(),
            units_required: 10,
            order_total: Decimal::from(200),
        }
    }

    #[test]
    fn test_eligibility_matches() {
        assert!(query().matches(&profile()));
    }

    #[test]
    fn test_eligibility_filters() {
        let mut p = profile();
        p.active = false;
        assert!(!query().matches(&p));

        let mut p = profile();
        p.stock_available = 5;
        assert!(!query().matches(&p));

        let mut p = profile();
        p.open_capacity = 0;
        assert!(!query().matches(&p));

        let mut p = profile();
        p.min_order_total = Decimal::from(500);
        assert!(!query().matches(&p));

        let mut p = profile();
        p.service_areas = vec!["mombasa".to_string()];
        assert!(!query().matches(&p));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RoutingStatus::Broadcast,
            RoutingStatus::Locked,
            RoutingStatus::CancellationsSent,
            RoutingStatus::Closed,
        ] {
            assert_eq!(RoutingStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RoutingStatus::parse("OPEN").is_err());
    }
}
