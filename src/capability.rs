//! Capability-scoped isolation (spec.md §3, §9).
//!
//! Model capability profiles as data, not scattered conditionals: a
//! function `caps_for(path)` and a relation `can_write_to(src, dst)`.
//! Verification and the Tool Runner both consult the same relation, as
//! spec.md §9 directs. Grounded on the teacher's `security.rs`
//! `ZeroTrustContext` pattern of per-boundary authorization data, adapted
//! from HMAC payload signing to path-prefix capability matching.

use serde::{Deserialize, Serialize};

/// Per-subtree-prefix capability record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub prefix: String,
    /// `None` means unrestricted (`*`).
    pub allowed: Option<Vec<String>>,
    pub forbidden: Vec<String>,
    pub can_network: bool,
    pub can_eval: bool,
    pub can_fs: bool,
    pub can_process: bool,
}

impl CapabilityProfile {
    fn allows_target(&self, target: &str) -> bool {
        let allowed_ok = match &self.allowed {
            None => true,
            Some(list) => list.iter().any(|p| target.starts_with(p.as_str())),
        };
        let forbidden_hit = self.forbidden.iter().any(|p| target.starts_with(p.as_str()));
        allowed_ok && !forbidden_hit
    }
}

/// Per-tool scoping: byte limits and network allow/deny lists for
/// capability-sensitive tools (SPEC_FULL.md §3.x, teacher:
/// `tool_policy::ToolConstraints`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConstraints {
    pub max_bytes: Option<usize>,
    pub allowed_url_schemes: Vec<String>,
    pub denied_hosts: Vec<String>,
}

impl ToolConstraints {
    pub fn check_bytes(&self, len: usize) -> Result<(), String> {
        match self.max_bytes {
            Some(max) if len > max => Err(format!("{len} bytes exceeds the {max} byte limit for this tool")),
            _ => Ok(()),
        }
    }

    /// Checks a single `scheme://host[:port][/path]` URL against the
    /// scheme allow-list and host deny-list. An empty `allowed_url_schemes`
    /// means no tool in the default matrix uses network URLs, so nothing is
    /// rejected on scheme grounds.
    pub fn check_url(&self, url: &str) -> Result<(), String> {
        let scheme = url.split("://").next().unwrap_or("");
        if !self.allowed_url_schemes.is_empty() && !self.allowed_url_schemes.iter().any(|s| s == scheme) {
            return Err(format!("scheme '{scheme}' is not in the allowed scheme list for this tool"));
        }
        let rest = url.splitn(2, "://").nth(1).unwrap_or(url);
        let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host);
        if self.denied_hosts.iter().any(|h| h == host) {
            return Err(format!("host '{host}' is denied for this tool"));
        }
        Ok(())
    }
}

/// Owns the capability matrix and the write-authorization relation.
///
/// The open question in spec.md §9 about whether substrate's
/// `canEval=true, canFS=true` defaults are policy-correct is resolved by
/// making the matrix fully configuration-driven (see `CapabilityMatrix::new`)
/// rather than hard-coded — see DESIGN.md.
#[derive(Debug, Clone)]
pub struct CapabilityMatrix {
    profiles: Vec<CapabilityProfile>,
}

impl CapabilityMatrix {
    pub fn new(profiles: Vec<CapabilityProfile>) -> Self {
        Self { profiles }
    }

    /// The default matrix: substrate paths are broadly capable, `/tools/`
    /// and `/apps/` are not (spec.md §3).
    pub fn default_matrix() -> Self {
        Self::new(vec![
            CapabilityProfile {
                prefix: "/core/".into(),
                allowed: None,
                forbidden: vec![],
                can_network: true,
                can_eval: true,
                can_fs: true,
                can_process: true,
            },
            CapabilityProfile {
                prefix: "/infrastructure/".into(),
                allowed: None,
                forbidden: vec![],
                can_network: true,
                can_eval: true,
                can_fs: true,
                can_process: true,
            },
            CapabilityProfile {
                prefix: "/tools/".into(),
                allowed: Some(vec!["/tools/".into(), "/apps/".into(), "/memory/".into()]),
                forbidden: vec!["/core/".into(), "/infrastructure/".into(), "/.system/".into()],
                can_network: false,
                can_eval: false,
                can_fs: false,
                can_process: false,
            },
            CapabilityProfile {
                prefix: "/apps/".into(),
                allowed: Some(vec!["/apps/".into()]),
                forbidden: vec!["/core/".into(), "/infrastructure/".into(), "/.system/".into(), "/tools/".into()],
                can_network: false,
                can_eval: false,
                can_fs: false,
                can_process: false,
            },
        ])
    }

    /// The capability profile governing `path`: the longest matching
    /// prefix, or a maximally-restrictive fallback if nothing matches.
    pub fn caps_for(&self, path: &str) -> CapabilityProfile {
        self.profiles
            .iter()
            .filter(|p| path.starts_with(p.prefix.as_str()))
            .max_by_key(|p| p.prefix.len())
            .cloned()
            .unwrap_or(CapabilityProfile {
                prefix: String::new(),
                allowed: Some(vec![]),
                forbidden: vec![],
                can_network: false,
                can_eval: false,
                can_fs: false,
                can_process: false,
            })
    }

    /// Writes from source path `S` to target path `T` require `T` to match
    /// an allowed prefix and no forbidden prefix of `S`'s profile
    /// (spec.md §3; property P6).
    pub fn can_write_to(&self, source_path: &str, target_path: &str) -> bool {
        self.caps_for(source_path).allows_target(target_path)
    }
}
