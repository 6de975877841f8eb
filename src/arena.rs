//! Arena Harness (spec.md §4.9): competitive, test-driven selection among
//! proposed mutations, plus a solo-verification path used to gate
//! self-modification of substrate paths. Grounded on the teacher's
//! `orchestrator::{Scheduler, WorkExecutor}` split — proposal generation
//! fans out the way `Scheduler` enqueues work, application stays a
//! sequential executor loop so `VFS.applyChanges` is never raced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::events::EventBus;
use crate::verification::{VerificationResult, VerificationService, VerifyOptions};
use crate::vfs::{ChangeSet, Vfs};

/// A contestant able to propose a solution for `task`. A host wires this to
/// an LLM call per competitor model/persona; the harness itself does not
/// care how a proposal is produced (spec.md §4.9).
#[async_trait]
pub trait Competitor: Send + Sync {
    fn name(&self) -> &str;
    async fn propose(&self, task: &str, context: &Value) -> Result<Value, String>;
}

/// Turns a competitor's raw solution into a `ChangeSet`. Caller-supplied,
/// per spec.md §9's open question: there is no canonical grammar for a
/// "solution".
pub type ParseChanges = Arc<dyn Fn(&Value) -> Result<ChangeSet, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompetitionStatus {
    Pass,
    Fail,
    Error,
}

/// `{competitorName, status, executionMs, tokenCount?, solution?, errors[],
/// warnings[]}` (spec.md §3).
#[derive(Debug, Clone, Serialize)]
pub struct ArenaResult {
    pub competitor_name: String,
    pub status: CompetitionStatus,
    pub execution_ms: u64,
    pub token_count: Option<u64>,
    pub solution: Option<Value>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct CompetitionRequest {
    pub task: String,
    pub context: Value,
    pub competitors: Vec<Arc<dyn Competitor>>,
    pub parse_changes: ParseChanges,
    pub timeout: Option<Duration>,
}

pub struct CompetitionOutcome {
    pub results: Vec<ArenaResult>,
    pub winner: Option<ArenaResult>,
}

pub struct ArenaHarness {
    verification: Arc<VerificationService>,
    config: ArenaConfig,
}

impl ArenaHarness {
    pub fn new(verification: Arc<VerificationService>, config: ArenaConfig) -> Self {
        Self { verification, config }
    }

    /// Snapshot → generate proposals in parallel, each bounded by a timeout
    /// (a losing proposal never blocks its peers) → sequentially restore,
    /// apply, verify each, recording PASS/FAIL/ERROR → always restore the
    /// pre-competition snapshot before returning → rank PASS > FAIL > ERROR
    /// with fastest-PASS-wins tiebreak (spec.md §4.9).
    pub async fn run_competition(&self, vfs: &Vfs, events: &EventBus, request: CompetitionRequest) -> Result<CompetitionOutcome, ArenaError> {
        if request.competitors.is_empty() {
            return Err(ArenaError::NoCompetitors);
        }
        let original = vfs.create_snapshot();
        tracing::info!(task = %request.task, competitors = request.competitors.len(), "arena competition started");
        events.emit("arena:start", serde_json::json!({"task": request.task, "competitors": request.competitors.len()}));

        let timeout = request.timeout.unwrap_or_else(|| Duration::from_secs(self.config.proposal_timeout_secs));
        let mut handles = Vec::new();
        for competitor in &request.competitors {
            let competitor = competitor.clone();
            let task = request.task.clone();
            let context = request.context.clone();
            handles.push(tokio::spawn(async move {
                let start = Instant::now();
                let outcome = tokio::time::timeout(timeout, competitor.propose(&task, &context)).await;
                (competitor.name().to_string(), outcome, start.elapsed())
            }));
        }

        let mut proposals = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((name, Ok(Ok(solution)), elapsed)) => proposals.push((name, Ok(solution), elapsed)),
                Ok((name, Ok(Err(msg)), elapsed)) => proposals.push((name, Err(msg), elapsed)),
                Ok((name, Err(_elapsed), elapsed)) => proposals.push((name, Err("proposal generation timed out".into()), elapsed)),
                Err(join_err) => proposals.push(("unknown".to_string(), Err(format!("proposal task panicked: {join_err}")), Duration::ZERO)),
            }
        }

        events.emit("arena:verifying", serde_json::json!({}));
        let mut results = Vec::new();
        for (name, proposal, elapsed) in proposals {
            let result = match proposal {
                Err(msg) => ArenaResult {
                    competitor_name: name,
                    status: CompetitionStatus::Error,
                    execution_ms: elapsed.as_millis() as u64,
                    token_count: None,
                    solution: None,
                    errors: vec![msg],
                    warnings: vec![],
                },
                Ok(solution) => {
                    vfs.restore_snapshot(&original);
                    self.verify_one(vfs, events, &name, solution, elapsed, &request.parse_changes).await
                }
            };
            results.push(result);
        }

        vfs.restore_snapshot(&original);
        let winner = rank(&results).cloned();
        events.emit(
            "arena:complete",
            serde_json::json!({"winner": winner.as_ref().map(|w| w.competitor_name.clone())}),
        );
        Ok(CompetitionOutcome { results, winner })
    }

    async fn verify_one(&self, vfs: &Vfs, events: &EventBus, name: &str, solution: Value, elapsed: Duration, parse_changes: &ParseChanges) -> ArenaResult {
        let changes = match parse_changes(&solution) {
            Ok(c) => c,
            Err(msg) => {
                return ArenaResult {
                    competitor_name: name.to_string(),
                    status: CompetitionStatus::Error,
                    execution_ms: elapsed.as_millis() as u64,
                    token_count: None,
                    solution: Some(solution),
                    errors: vec![msg],
                    warnings: vec![],
                }
            }
        };
        vfs.apply_changes(&changes);
        let verify_result = self.verification.verify_proposal(vfs, &changes, VerifyOptions::default(), events).await;
        let status = if verify_result.passed { CompetitionStatus::Pass } else { CompetitionStatus::Fail };
        ArenaResult {
            competitor_name: name.to_string(),
            status,
            execution_ms: elapsed.as_millis() as u64,
            token_count: None,
            solution: Some(solution),
            errors: verify_result.errors,
            warnings: verify_result.warnings,
        }
    }

    /// Solo variant used to gate a single self-modification (spec.md §4.9,
    /// §4.6 step 4): snapshot, apply, verify, always restore. The caller
    /// re-applies the change permanently only when `passed` is true —
    /// the VFS is otherwise left byte-equal to its pre-attempt state.
    pub async fn verify_solution(&self, vfs: &Vfs, events: &EventBus, changes: &ChangeSet) -> VerificationResult {
        let snapshot = vfs.create_snapshot();
        vfs.apply_changes(changes);
        let result = self.verification.verify_proposal(vfs, changes, VerifyOptions::default(), events).await;
        vfs.restore_snapshot(&snapshot);
        result
    }
}

/// PASS ranks before FAIL before ERROR; within a tier, the faster
/// `executionMs` wins.
fn rank(results: &[ArenaResult]) -> Option<&ArenaResult> {
    results.iter().min_by_key(|r| rank_key(r))
}

fn rank_key(result: &ArenaResult) -> (u8, u64) {
    let tier = match result.status {
        CompetitionStatus::Pass => 0,
        CompetitionStatus::Fail => 1,
        CompetitionStatus::Error => 2,
    };
    (tier, result.execution_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityMatrix;
    use crate::config::VerificationConfig;
    use crate::vfs::VfsPath;

    struct FixedCompetitor {
        label: &'static str,
        source: &'static str,
    }

    #[async_trait]
    impl Competitor for FixedCompetitor {
        fn name(&self) -> &str {
            self.label
        }
        async fn propose(&self, _task: &str, _context: &Value) -> Result<Value, String> {
            Ok(serde_json::json!({"path": "/tools/Candidate.js", "source": self.source}))
        }
    }

    struct FailingCompetitor;
    #[async_trait]
    impl Competitor for FailingCompetitor {
        fn name(&self) -> &str {
            "broken"
        }
        async fn propose(&self, _task: &str, _context: &Value) -> Result<Value, String> {
            Err("could not produce a proposal".into())
        }
    }

    fn harness() -> ArenaHarness {
        let verification = Arc::new(VerificationService::new(CapabilityMatrix::default_matrix(), VerificationConfig::default()));
        ArenaHarness::new(verification, ArenaConfig::default())
    }

    fn parse_changes() -> ParseChanges {
        Arc::new(|solution: &Value| {
            let path = solution["path"].as_str().ok_or("missing path")?;
            let source = solution["source"].as_str().ok_or("missing source")?;
            let mut changes = ChangeSet::new();
            changes.insert(
                VfsPath::new(path).map_err(|e| e.to_string())?,
                Some(Arc::from(source.as_bytes().to_vec().into_boxed_slice())),
            );
            Ok(changes)
        })
    }

    #[tokio::test]
    async fn passing_competitor_beats_failing_one_s5() {
        let vfs = Vfs::new();
        let events = EventBus::new();
        let request = CompetitionRequest {
            task: "add two numbers".into(),
            context: Value::Null,
            competitors: vec![
                Arc::new(FixedCompetitor {
                    label: "good",
                    source: "module.exports = function handler(a, b) { return a + b; };",
                }),
                Arc::new(FixedCompetitor {
                    label: "evil",
                    source: "module.exports = function handler() { eval('x'); };",
                }),
            ],
            parse_changes: parse_changes(),
            timeout: None,
        };

        let outcome = harness().run_competition(&vfs, &events, request).await.unwrap();
        assert_eq!(outcome.winner.unwrap().competitor_name, "good");
        assert!(!vfs.exists(&VfsPath::new("/tools/Candidate.js").unwrap()), "vfs must be restored after the competition");
    }

    #[tokio::test]
    async fn proposal_failure_becomes_error_without_blocking_peers() {
        let vfs = Vfs::new();
        let events = EventBus::new();
        let request = CompetitionRequest {
            task: "add two numbers".into(),
            context: Value::Null,
            competitors: vec![
                Arc::new(FailingCompetitor),
                Arc::new(FixedCompetitor {
                    label: "good",
                    source: "module.exports = function handler(a, b) { return a + b; };",
                }),
            ],
            parse_changes: parse_changes(),
            timeout: None,
        };

        let outcome = harness().run_competition(&vfs, &events, request).await.unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.winner.unwrap().competitor_name, "good");
        let broken = outcome.results.iter().find(|r| r.competitor_name == "broken").unwrap();
        assert_eq!(broken.status, CompetitionStatus::Error);
    }

    #[tokio::test]
    async fn no_competitors_is_rejected() {
        let vfs = Vfs::new();
        let events = EventBus::new();
        let request = CompetitionRequest {
            task: "noop".into(),
            context: Value::Null,
            competitors: vec![],
            parse_changes: parse_changes(),
            timeout: None,
        };
        assert!(harness().run_competition(&vfs, &events, request).await.is_err());
    }

    #[tokio::test]
    async fn verify_solution_restores_vfs_regardless_of_outcome_i2() {
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        changes.insert(
            VfsPath::new("/tools/Bad.js").unwrap(),
            Some(Arc::from(b"module.exports = function() { eval('x'); }".to_vec().into_boxed_slice())),
        );

        let result = harness().verify_solution(&vfs, &events, &changes).await;
        assert!(!result.passed);
        assert!(!vfs.exists(&VfsPath::new("/tools/Bad.js").unwrap()));
    }
}
