//! Approval store for human-in-the-loop tool gating.
//!
//! A `BeforeToolCall` hook that returns `PendingApproval` suspends the
//! calling task on a `tokio::sync::oneshot` channel until an external actor
//! calls [`ApprovalStore::resolve`] or the configured timeout elapses.
//! Timeout is treated as rejection, never as silent approval — this mirrors
//! the pipeline's fail-close default.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome of a resolved (or timed-out) approval request.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approved() -> Self {
        Self { approved: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { approved: false, reason: Some(reason.into()) }
    }
}

struct Pending {
    sender: oneshot::Sender<ApprovalDecision>,
}

/// In-memory approval store. One instance is shared across a run (or a
/// whole process) via `Arc`.
#[derive(Default)]
pub struct ApprovalStore {
    pending: Mutex<HashMap<String, Pending>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Register a pending request and suspend until `resolve` is called for
    /// `approval_id` or `timeout` elapses. Timeout resolves to a rejected
    /// decision with reason `"approval timed out"`.
    pub async fn request_approval(
        &self,
        approval_id: impl Into<String>,
        _run_id: &str,
        _user_id: Option<&str>,
        _tool_name: &str,
        _arguments: &serde_json::Value,
        timeout: Duration,
    ) -> Result<ApprovalDecision> {
        let approval_id = approval_id.into();
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().expect("approval store mutex poisoned");
            guard.insert(approval_id.clone(), Pending { sender: tx });
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().expect("approval store mutex poisoned").remove(&approval_id);

        match result {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => Err(Error::other("approval sender dropped without a decision")),
            Err(_) => Ok(ApprovalDecision::rejected("approval timed out")),
        }
    }

    /// Resolve a pending approval request. Returns `false` if no request
    /// with this id is currently pending (already resolved or timed out).
    pub fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> bool {
        let pending = self.pending.lock().expect("approval store mutex poisoned").remove(approval_id);
        match pending {
            Some(p) => p.sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, approval_id: &str) -> bool {
        self.pending.lock().expect("approval store mutex poisoned").contains_key(approval_id)
    }
}
