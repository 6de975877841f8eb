//! Crate-wide VFS invariants (spec.md §8, P1–P3). These properties are
//! stated over the VFS but only actually exercised by crossing module
//! boundaries — Tool Runner dispatch, Arena competitions — so they get an
//! integration-level home rather than living in `vfs`'s own `#[cfg(test)]`
//! module (SPEC_FULL.md §2).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use reploid::arena::{ArenaHarness, CompetitionRequest, CompetitionStatus, Competitor};
use reploid::capability::CapabilityMatrix;
use reploid::config::{ArenaConfig, VerificationConfig};
use reploid::events::{AuditLogger, EventBus};
use reploid::schema::SchemaRegistry;
use reploid::tools::hitl::{AutoApprove, HitlGate};
use reploid::tools::policy::ToolPolicyManager;
use reploid::tools::{ExecuteOptions, ToolRunner};
use reploid::verification::VerificationService;
use reploid::vfs::{ChangeSet, Vfs, VfsPath};

fn fresh_runner(vfs: Arc<Vfs>) -> ToolRunner {
    let events = Arc::new(EventBus::new());
    let audit = Arc::new(AuditLogger::new());
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.init(&vfs);
    let capabilities = CapabilityMatrix::default_matrix();
    let verification = VerificationService::new(capabilities.clone(), VerificationConfig::default());
    let policy = ToolPolicyManager::new(true);
    let hitl = HitlGate::new(Box::new(AutoApprove), Duration::from_secs(5));
    ToolRunner::new(vfs, events, audit, schemas, capabilities, verification, policy, hitl)
}

/// P1: restoring a snapshot leaves the VFS byte-equal to it, regardless of
/// how many writes/deletes happened since it was taken.
#[test]
fn p1_snapshot_restore_is_byte_exact_across_a_mutation_batch() {
    let vfs = Vfs::new();
    let a = VfsPath::new("/tools/A.js").unwrap();
    let b = VfsPath::new("/tools/B.js").unwrap();
    vfs.write(&a, b"original-a".to_vec()).unwrap();
    vfs.write(&b, b"original-b".to_vec()).unwrap();
    let snapshot = vfs.create_snapshot();

    for i in 0..50 {
        vfs.write(&a, format!("mutation-{i}").into_bytes()).unwrap();
        if i % 7 == 0 {
            vfs.delete(&b).ok();
        } else {
            vfs.write(&b, format!("b-{i}").into_bytes()).unwrap();
        }
    }

    vfs.restore_snapshot(&snapshot);
    assert_eq!(&*vfs.read(&a).unwrap(), b"original-a");
    assert_eq!(&*vfs.read(&b).unwrap(), b"original-b");
    assert_eq!(vfs.diff_snapshot(&snapshot), Default::default());
}

/// P2: when verification rejects a tool's proposed change, the VFS after
/// dispatch equals the VFS before it, byte for byte.
#[tokio::test]
async fn p2_failed_verification_leaves_vfs_unchanged() {
    let vfs = Arc::new(Vfs::new());
    let runner = fresh_runner(vfs.clone());

    let before = vfs.create_snapshot();
    let args = serde_json::json!({
        "path": "/tools/Evil.js",
        "content": "module.exports = function handler() { eval('x'); };",
    });
    let result = runner.execute("WriteFile", args, ExecuteOptions::default()).await;

    assert!(result.is_err());
    assert_eq!(vfs.diff_snapshot(&before), Default::default());
}

/// P2, positive case: a passing change does land, and the VFS after it is
/// not equal to the VFS before — the invariant only guards the failure
/// path, it does not forbid successful mutation.
#[tokio::test]
async fn p2_passing_verification_does_apply_the_change() {
    let vfs = Arc::new(Vfs::new());
    let runner = fresh_runner(vfs.clone());

    let before = vfs.create_snapshot();
    let args = serde_json::json!({
        "path": "/tools/Good.js",
        "content": "module.exports = function handler(a, b) { return a + b; };",
    });
    let result = runner.execute("WriteFile", args, ExecuteOptions::default()).await;

    assert!(result.is_ok(), "{result:?}");
    assert_ne!(vfs.diff_snapshot(&before), Default::default());
}

struct ScriptedCompetitor {
    label: &'static str,
    source: &'static str,
}

#[async_trait]
impl Competitor for ScriptedCompetitor {
    fn name(&self) -> &str {
        self.label
    }
    async fn propose(&self, _task: &str, _context: &Value) -> Result<Value, String> {
        Ok(serde_json::json!({"path": "/tools/Candidate.js", "source": self.source}))
    }
}

/// P3: the VFS after `run_competition` equals the VFS before it, whether
/// the competition produces a winner or not.
#[tokio::test]
async fn p3_arena_competition_restores_vfs_regardless_of_outcome() {
    let vfs = Vfs::new();
    let events = EventBus::new();
    let verification = Arc::new(VerificationService::new(CapabilityMatrix::default_matrix(), VerificationConfig::default()));
    let harness = ArenaHarness::new(verification, ArenaConfig::default());

    vfs.write(&VfsPath::new("/tools/Unrelated.js").unwrap(), b"untouched".to_vec()).unwrap();
    let before = vfs.create_snapshot();

    let request = CompetitionRequest {
        task: "add two numbers".into(),
        context: Value::Null,
        competitors: vec![
            Arc::new(ScriptedCompetitor {
                label: "good",
                source: "module.exports = function handler(a, b) { return a + b; };",
            }),
            Arc::new(ScriptedCompetitor {
                label: "evil",
                source: "module.exports = function handler() { eval('x'); };",
            }),
        ],
        parse_changes: Arc::new(|solution: &Value| {
            let path = solution["path"].as_str().ok_or("missing path")?;
            let source = solution["source"].as_str().ok_or("missing source")?;
            let mut changes = ChangeSet::new();
            changes.insert(
                VfsPath::new(path).map_err(|e| e.to_string())?,
                Some(Arc::from(source.as_bytes().to_vec().into_boxed_slice())),
            );
            Ok(changes)
        }),
        timeout: None,
    };

    let outcome = harness.run_competition(&vfs, &events, request).await.unwrap();
    assert_eq!(outcome.winner.unwrap().status, CompetitionStatus::Pass);
    assert_eq!(vfs.diff_snapshot(&before), Default::default());
}
