//! Human approval gate for gated tool calls.
//!
//! The gate is a capacity-1 channel between the agent loop and whatever
//! front end owns the user. At most one approval can be pending at a time;
//! the loop blocks on the decision, so tool order is preserved by
//! construction.

use tokio::sync::{mpsc, oneshot};

/// Error text recorded when the user rejects a tool call. Fed back to the
/// model verbatim, so it must stay stable.
pub const REJECTION_MESSAGE: &str = "Tool execution rejected by user";

/// What the agent wants to run.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    /// Human-readable rendering of the call, shown in the prompt.
    pub preview: String,
}

/// The user's verdict on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Run this call.
    Approved,
    /// Run this call and stop asking for the rest of the session.
    ApproveAll,
    /// Skip this call and tell the model it was rejected.
    Rejected,
    /// Skip this call and inject the given text as user guidance instead.
    Modify(String),
}

/// One request waiting on the user, handed to the front end.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    decision_tx: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    /// Deliver the verdict. Consumes the slot; a dropped `PendingApproval`
    /// reads as a rejection on the agent side.
    pub fn respond(self, decision: ApprovalDecision) {
        // The agent may have been interrupted and dropped its receiver.
        let _ = self.decision_tx.send(decision);
    }
}

/// Agent-side handle for submitting approval requests.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    tx: mpsc::Sender<PendingApproval>,
}

impl ApprovalGate {
    /// Create a gate and the front-end receiver it feeds. Capacity is one
    /// slot; a second request waits until the first is decided.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Submit a request and wait for the user's decision.
    ///
    /// A closed channel on either side means the front end is gone; that is
    /// treated as a rejection rather than an error so an in-flight turn can
    /// still complete.
    pub async fn request(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (decision_tx, decision_rx) = oneshot::channel();
        let pending = PendingApproval {
            request,
            decision_tx,
        };
        if self.tx.send(pending).await.is_err() {
            tracing::warn!("approval receiver dropped, treating as rejection");
            return ApprovalDecision::Rejected;
        }
        decision_rx.await.unwrap_or(ApprovalDecision::Rejected)
    }
}
