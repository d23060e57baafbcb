//! Messaging collaborator seam
//!
//! The engine never talks to WhatsApp directly; it hands notices to a
//! [`Notifier`] strictly after the underlying decision has committed. A
//! failed notification is logged and dropped; it never rolls back a
//! committed allocation or cancellation.

use crate::types::CancellationReason;
use async_trait::async_trait;
use std::sync::Mutex;
use store_core::{OrderId, WholesalerId};
use uuid::Uuid;

/// A message for the excluded messaging layer to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundNotice {
    /// Invite a candidate to compete for an order
    Invitation {
        /// Routing the invitation belongs to
        routing_id: Uuid,
        /// Invited candidate
        candidate_id: WholesalerId,
        /// Order on offer
        order_ref: OrderId,
    },

    /// Tell the winner it holds the order
    WinnerConfirmation {
        /// Routing that resolved
        routing_id: Uuid,
        /// Winning candidate
        candidate_id: WholesalerId,
        /// Order won
        order_ref: OrderId,
    },

    /// Tell a loser the opportunity is gone
    Cancellation {
        /// Routing that resolved
        routing_id: Uuid,
        /// Cancelled candidate
        candidate_id: WholesalerId,
        /// Why
        reason: CancellationReason,
    },
}

/// Post-commit notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notice. Errors are the callee's problem to retry;
    /// the engine only logs them.
    async fn notify(&self, notice: OutboundNotice) -> anyhow::Result<()>;
}

/// Discards every notice (embedding layers that poll state instead)
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notice: OutboundNotice) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Captures notices in memory; used by tests and local tooling
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<OutboundNotice>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn notices(&self) -> Vec<OutboundNotice> {
        self.notices.lock().expect("notifier mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: OutboundNotice) -> anyhow::Result<()> {
        self.notices
            .lock()
            .expect("notifier mutex poisoned")
            .push(notice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_notifier_captures_in_order() {
        let notifier = RecordingNotifier::new();
        let routing_id = Uuid::now_v7();
        let candidate = WholesalerId::generate();

        notifier
            .notify(OutboundNotice::Cancellation {
                routing_id,
                candidate_id: candidate,
                reason: CancellationReason::LostRace,
            })
            .await
            .unwrap();

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert!(matches!(
            notices[0],
            OutboundNotice::Cancellation {
                reason: CancellationReason::LostRace,
                ..
            }
        ));
    }
}
