//! Persisted tool approval policy (SPEC_FULL.md §4.6), adopted as the
//! concrete mechanism behind the Tool Runner's "approval mode is not
//! autonomous" switch (spec.md §4.6 step 3). Grounded on the teacher's
//! `tool_policy::ToolPolicy` persisted-JSON pattern.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::vfs::{Vfs, VfsPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicy {
    Allow,
    Prompt,
    Deny,
}

const POLICY_PATH: &str = "/.system/tool_policy.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedPolicy {
    decisions: HashMap<String, ToolPolicy>,
}

/// Auto-allow defaults for read-only tools (spec.md §4.2's `AUTO_ALLOW`
/// convenience list, teacher: `AUTO_ALLOW_TOOLS`).
const AUTO_ALLOW: &[&str] = &["ReadFile", "ListFiles", "Grep"];

pub struct ToolPolicyManager {
    decisions: RwLock<HashMap<String, ToolPolicy>>,
    pub default_require_approval: bool,
}

impl ToolPolicyManager {
    pub fn new(default_require_approval: bool) -> Self {
        let mut decisions = HashMap::new();
        for name in AUTO_ALLOW {
            decisions.insert((*name).to_string(), ToolPolicy::Allow);
        }
        Self {
            decisions: RwLock::new(decisions),
            default_require_approval,
        }
    }

    pub fn load(&self, vfs: &Vfs) {
        if let Ok(path) = VfsPath::new(POLICY_PATH) {
            if let Ok(bytes) = vfs.read(&path) {
                if let Ok(persisted) = serde_json::from_slice::<PersistedPolicy>(&bytes) {
                    let mut guard = self.decisions.write();
                    for (name, policy) in persisted.decisions {
                        guard.insert(name, policy);
                    }
                }
            }
        }
    }

    pub fn persist(&self, vfs: &Vfs) {
        let persisted = PersistedPolicy {
            decisions: self.decisions.read().clone(),
        };
        if let (Ok(bytes), Ok(path)) = (serde_json::to_vec_pretty(&persisted), VfsPath::new(POLICY_PATH)) {
            let _ = vfs.write(&path, bytes);
        }
    }

    pub fn set(&self, tool: impl Into<String>, policy: ToolPolicy, vfs: &Vfs) {
        self.decisions.write().insert(tool.into(), policy);
        self.persist(vfs);
    }

    /// Blacklist (`Deny`) always wins over an explicit `Allow`; absent a
    /// decision, the `default_require_approval` flag decides whether the
    /// tool prompts or runs autonomously.
    pub fn resolve(&self, tool: &str) -> ToolPolicy {
        match self.decisions.read().get(tool) {
            Some(ToolPolicy::Deny) => ToolPolicy::Deny,
            Some(policy) => *policy,
            None if self.default_require_approval => ToolPolicy::Prompt,
            None => ToolPolicy::Allow,
        }
    }
}
