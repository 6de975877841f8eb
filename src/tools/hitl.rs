//! Human-in-the-loop approval gate for critical tools (spec.md §4.6 step 3).
//! Grounded on the teacher's `safety::hitl` oversight gate: an injectable
//! approver, a timeout that fails closed, and an audit trail of decisions.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Tools whose substrate impact warrants a human approval gate unless the
/// tool policy has pre-approved them (spec.md §4.6 step 3).
pub const CRITICAL_TOOLS: &[&str] = &["WriteFile", "DeleteFile", "CreateTool", "Edit", "LoadModule"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversightDecision {
    Approved,
    Rejected,
    TimedOut,
}

/// A pluggable approval source. A CLI host prompts a human; a headless host
/// might auto-approve or consult a policy file. Either way the gate itself
/// stays oblivious to where the "yes" comes from.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn request_approval(&self, tool: &str, args: &Value) -> bool;
}

/// Approves everything immediately — the default for hosts that haven't
/// wired an interactive approver, matching the teacher's "non-interactive
/// sessions auto-approve" fallback.
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn request_approval(&self, _tool: &str, _args: &Value) -> bool {
        true
    }
}

/// Denies everything; useful for hosts that want critical tools hard-gated
/// off until a human explicitly flips the tool policy to `Allow`.
pub struct AutoReject;

#[async_trait]
impl Approver for AutoReject {
    async fn request_approval(&self, _tool: &str, _args: &Value) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct HitlAuditEntry {
    pub tool: String,
    pub decision: OversightDecision,
}

pub struct HitlGate {
    approver: Box<dyn Approver>,
    timeout: Duration,
    critical: HashSet<String>,
    trail: Mutex<Vec<HitlAuditEntry>>,
}

impl HitlGate {
    pub fn new(approver: Box<dyn Approver>, timeout: Duration) -> Self {
        Self {
            approver,
            timeout,
            critical: CRITICAL_TOOLS.iter().map(|s| s.to_string()).collect(),
            trail: Mutex::new(Vec::new()),
        }
    }

    pub fn requires_approval(&self, tool: &str) -> bool {
        self.critical.contains(tool)
    }

    /// Times out to `Rejected` rather than silently proceeding — an
    /// unanswered approval request must never default to yes.
    pub async fn gate(&self, tool: &str, args: &Value) -> OversightDecision {
        let decision = match tokio::time::timeout(self.timeout, self.approver.request_approval(tool, args)).await {
            Ok(true) => OversightDecision::Approved,
            Ok(false) => OversightDecision::Rejected,
            Err(_elapsed) => OversightDecision::TimedOut,
        };
        self.trail.lock().push(HitlAuditEntry {
            tool: tool.to_string(),
            decision,
        });
        decision
    }

    pub fn trail(&self) -> Vec<HitlAuditEntry> {
        self.trail.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_tools_require_approval() {
        let gate = HitlGate::new(Box::new(AutoApprove), Duration::from_secs(1));
        assert!(gate.requires_approval("WriteFile"));
        assert!(!gate.requires_approval("ReadFile"));
    }

    #[tokio::test]
    async fn auto_approve_yields_approved_and_records_trail() {
        let gate = HitlGate::new(Box::new(AutoApprove), Duration::from_secs(1));
        let decision = gate.gate("WriteFile", &serde_json::json!({})).await;
        assert_eq!(decision, OversightDecision::Approved);
        assert_eq!(gate.trail().len(), 1);
    }

    #[tokio::test]
    async fn rejecting_approver_yields_rejected() {
        let gate = HitlGate::new(Box::new(AutoReject), Duration::from_secs(1));
        let decision = gate.gate("DeleteFile", &serde_json::json!({})).await;
        assert_eq!(decision, OversightDecision::Rejected);
    }

    struct NeverResponds;
    #[async_trait]
    impl Approver for NeverResponds {
        async fn request_approval(&self, _tool: &str, _args: &Value) -> bool {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn unanswered_request_times_out_to_rejected() {
        let gate = HitlGate::new(Box::new(NeverResponds), Duration::from_millis(20));
        let decision = gate.gate("CreateTool", &serde_json::json!({})).await;
        assert_eq!(decision, OversightDecision::TimedOut);
    }
}
