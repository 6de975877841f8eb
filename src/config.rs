//! Configuration surface for the Reploid core.
//!
//! Mirrors the teacher's `ToolPolicyConfig` pattern: a typed struct with
//! `serde(default)` fields, a `Default` impl seeded from spec.md §9's
//! resolved defaults, and an explicit override order (runtime overrides win
//! over file config, which wins over these built-in defaults).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-model token-limit triple. `compact <= warning <= hard` is an
/// invariant enforced at construction, not merely documented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub compact: usize,
    pub warning: usize,
    pub hard: usize,
}

impl Limits {
    pub fn new(compact: usize, warning: usize, hard: usize) -> Self {
        debug_assert!(compact <= warning && warning <= hard);
        Self {
            compact,
            warning,
            hard,
        }
    }
}

/// Configuration-driven model-limits table, consulted by longest-prefix
/// match (case-insensitive) per spec.md §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLimitsConfig {
    pub default: Limits,
    /// Ordered `(prefix, limits)` pairs; longer prefixes should be listed
    /// first so the first match wins without needing to sort at lookup time.
    pub table: Vec<(String, Limits)>,
}

impl Default for ModelLimitsConfig {
    fn default() -> Self {
        Self {
            default: Limits::new(100_000, 120_000, 140_000),
            table: vec![
                ("claude-3-opus".into(), Limits::new(150_000, 170_000, 190_000)),
                ("claude-3".into(), Limits::new(150_000, 170_000, 190_000)),
                ("claude-".into(), Limits::new(150_000, 170_000, 190_000)),
                ("gemini-1.5".into(), Limits::new(800_000, 900_000, 1_000_000)),
                ("gemini-".into(), Limits::new(800_000, 900_000, 1_000_000)),
                ("gpt-4o".into(), Limits::new(100_000, 115_000, 128_000)),
                ("gpt-4-turbo".into(), Limits::new(100_000, 115_000, 128_000)),
                ("gpt-4".into(), Limits::new(6_000, 7_000, 8_000)),
                ("gpt-3.5".into(), Limits::new(12_000, 14_000, 16_000)),
                ("o1".into(), Limits::new(100_000, 115_000, 128_000)),
                ("o3".into(), Limits::new(100_000, 115_000, 128_000)),
                ("o4".into(), Limits::new(100_000, 115_000, 128_000)),
                ("llama".into(), Limits::new(6_000, 7_000, 8_000)),
                ("phi".into(), Limits::new(3_000, 3_500, 4_000)),
                ("qwen".into(), Limits::new(28_000, 30_000, 32_000)),
                ("smollm".into(), Limits::new(1_500, 1_800, 2_000)),
            ],
        }
    }
}

/// Resolved defaults for the Memory Manager (spec.md §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub working_token_limit: usize,
    pub eviction_ratio: f64,
    pub base_half_life_secs: f64,
    pub access_boost: f64,
    pub min_retention: f64,
    pub max_memories: usize,
    pub prune_trigger_ratio: f64,
    pub prune_target_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_token_limit: 8_000,
            eviction_ratio: 0.25,
            base_half_life_secs: 86_400.0,
            access_boost: 1.5,
            min_retention: 0.1,
            max_memories: 5_000,
            prune_trigger_ratio: 0.8,
            prune_target_ratio: 0.7,
        }
    }
}

/// Resolved defaults for the Verification Service (spec.md §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub timeout_ms: u64,
    pub max_loc: usize,
    pub max_functions: usize,
    pub max_nesting: usize,
    pub max_long_lines: usize,
    pub long_line_chars: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_loc: 500,
            max_functions: 20,
            max_nesting: 5,
            max_long_lines: 5,
            long_line_chars: 200,
        }
    }
}

/// Resolved defaults for the Worker Manager (spec.md §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency_cap: usize,
    pub completed_cache_cap: usize,
    pub max_iterations: u32,
    pub hitl_timeout_secs: u64,
    pub single_tool_streak_threshold: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 10,
            completed_cache_cap: 100,
            max_iterations: 25,
            hitl_timeout_secs: 300,
            single_tool_streak_threshold: 3,
        }
    }
}

/// Resolved defaults for the Arena Harness (spec.md §4.9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub proposal_timeout_secs: u64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            proposal_timeout_secs: 60,
        }
    }
}

/// Resolved defaults for the Agent Loop (spec.md §5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub primary_llm_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            primary_llm_timeout_secs: 30,
        }
    }
}

/// Top-level configuration, loaded from TOML with `serde(default)` at every
/// level so a partial file still produces a fully-populated config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReploidConfig {
    pub model_limits: ModelLimitsConfig,
    pub memory: MemoryConfig,
    pub verification: VerificationConfig,
    pub worker: WorkerConfig,
    pub arena: ArenaConfig,
    pub agent: AgentConfig,
    /// Runtime overrides take precedence over everything above; set
    /// programmatically, never persisted (spec.md §9, "Global mutable
    /// state").
    #[serde(skip)]
    pub runtime_limit_override: Option<Limits>,
}

impl ReploidConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Resolve limits for a model id: runtime override wins; else the first
    /// case-insensitive prefix match in `table`; else `default`.
    pub fn limits_for_model(&self, model_id: &str) -> Limits {
        if let Some(l) = self.runtime_limit_override {
            return l;
        }
        let lower = model_id.to_ascii_lowercase();
        for (prefix, limits) in &self.model_limits.table {
            if lower.starts_with(&prefix.to_ascii_lowercase()) {
                return *limits;
            }
        }
        self.model_limits.default
    }
}

/// Worker-role model configuration (spec.md §4.7: `orchestrator`, `fast`,
/// `code`, `local`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleModelConfig {
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoles(pub HashMap<String, RoleModelConfig>);

impl Default for ModelRoles {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert(
            "orchestrator".into(),
            RoleModelConfig {
                model: "claude-3-opus".into(),
                temperature: 0.2,
            },
        );
        map.insert(
            "fast".into(),
            RoleModelConfig {
                model: "gpt-4o".into(),
                temperature: 0.3,
            },
        );
        map.insert(
            "code".into(),
            RoleModelConfig {
                model: "claude-3-opus".into(),
                temperature: 0.0,
            },
        );
        map.insert(
            "local".into(),
            RoleModelConfig {
                model: "qwen-coder".into(),
                temperature: 0.2,
            },
        );
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins_before_short_one() {
        let cfg = ReploidConfig::default();
        let limits = cfg.limits_for_model("claude-3-opus-20240229");
        assert_eq!(limits.compact, 150_000);
    }

    #[test]
    fn runtime_override_wins_over_table() {
        let mut cfg = ReploidConfig::default();
        cfg.runtime_limit_override = Some(Limits::new(1, 2, 3));
        assert_eq!(cfg.limits_for_model("claude-3-opus").hard, 3);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let cfg = ReploidConfig::default();
        let limits = cfg.limits_for_model("some-unknown-model");
        assert_eq!(limits, cfg.model_limits.default);
    }
}
