//! Verification Service (spec.md §4.5): pattern detection, structural
//! analysis, capability boundary checks, complexity heuristics, run in an
//! isolated sandbox.

pub mod patterns;
pub mod sandbox;

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::capability::{CapabilityMatrix, CapabilityProfile, ToolConstraints};
use crate::config::VerificationConfig;
use crate::events::EventBus;
use crate::vfs::{ChangeSet, Vfs, VfsPath};
use patterns::CATALOG;
use sandbox::{SandboxOutcome, SandboxRunner};

/// Bridges the pattern catalog's `requiresCap` tag (spec.md §4.5 step 2)
/// to `CapabilityProfile`'s boolean fields.
pub fn profile_grants(profile: &CapabilityProfile, cap: patterns::Capability) -> bool {
    match cap {
        patterns::Capability::CanEval => profile.can_eval,
        patterns::Capability::CanNetwork => profile.can_network,
        patterns::Capability::CanFs => profile.can_fs,
        patterns::Capability::CanProcess => profile.can_process,
    }
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub timeout: Duration,
    pub quick_mode: bool,
    /// Per-tool scoping for the call that produced `changes` (SPEC_FULL.md
    /// §3.x): byte limits and network allow/deny lists, checked alongside
    /// the path-prefix capability boundary. `None` when the originating
    /// tool has no constraints registered.
    pub tool_constraints: Option<ToolConstraints>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            quick_mode: true,
            tool_constraints: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationDetails {
    pub files_checked: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub events: Vec<String>,
    pub details: VerificationDetails,
}

static JS_LIKE_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(js|ts|mjs|cjs)$").unwrap());
static WRITE_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:VFS\.write|VFS\.delete|WriteFile|DeleteFile)\s*\(\s*["']([^"']+)["']"#).unwrap()
});
static BRACKET_DYNAMIC_WRITE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*[A-Za-z_$][\w$]*\s*\]\s*=").unwrap());
static SUSPICIOUS_IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b\w*(eval|exec)\w*\b").unwrap());
static BRACKET_FUNCTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\[\s*["']Function["']\s*\]"#).unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s"'`]+"#).unwrap());
static EXPORT_HANDLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(module\.exports|export\s+default|export\s+function\s+handler|\.call\s*=)").unwrap());
static FUNCTION_DECL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bfunction\b|=>\s*\{|=\s*\([^)]*\)\s*=>").unwrap());

const NETWORK_ALLOWLIST: &[&str] = &["localhost", "127.0.0.1", "api.anthropic.com", "api.openai.com"];

pub struct VerificationService {
    capabilities: CapabilityMatrix,
    config: VerificationConfig,
    sandbox: SandboxRunner,
}

impl VerificationService {
    pub fn new(capabilities: CapabilityMatrix, config: VerificationConfig) -> Self {
        Self {
            sandbox: SandboxRunner::new(Duration::from_millis(config.timeout_ms)),
            capabilities,
            config,
        }
    }

    /// `changes` is `map<Path, bytes|null>`; `quickMode` verifies only the
    /// changed files, else overlays them onto a snapshot of the current
    /// VFS and verifies the whole (spec.md §4.5).
    pub async fn verify_proposal(&self, vfs: &Vfs, changes: &ChangeSet, options: VerifyOptions, events: &EventBus) -> VerificationResult {
        tracing::debug!(changed_paths = changes.len(), quick_mode = options.quick_mode, "verification started");
        let files_to_check: Vec<(VfsPath, Vec<u8>)> = if options.quick_mode {
            changes
                .iter()
                .filter_map(|(path, bytes)| bytes.as_ref().map(|b| (path.clone(), b.to_vec())))
                .collect()
        } else {
            let snapshot = vfs.create_snapshot();
            let mut overlay: HashMap<VfsPath, Vec<u8>> = snapshot
                .files
                .iter()
                .map(|(p, b)| (p.clone(), b.to_vec()))
                .collect();
            for (path, value) in changes {
                match value {
                    Some(bytes) => {
                        overlay.insert(path.clone(), bytes.to_vec());
                    }
                    None => {
                        overlay.remove(path);
                    }
                }
            }
            overlay.into_iter().collect()
        };

        let mut result = VerificationResult::default();
        result.passed = true;

        let config = self.config;
        let capabilities = self.capabilities.clone();
        let tool_constraints = options.tool_constraints.clone();
        let checkable: Vec<(VfsPath, Vec<u8>)> = files_to_check
            .into_iter()
            .filter(|(path, _)| JS_LIKE_EXT.is_match(path.as_str()))
            .collect();
        result.details.files_checked = checkable.len();

        let outcome = self
            .sandbox
            .run(events, move || run_checks(&checkable, &capabilities, &config, tool_constraints.as_ref()))
            .await;

        match outcome {
            SandboxOutcome::Completed(checked) => {
                result.errors = checked.errors;
                result.warnings = checked.warnings;
                result.events = checked.events;
            }
            SandboxOutcome::TimedOut => {
                result.errors.push("verification timed out".into());
                result.events.push("verification:timeout".into());
            }
        }
        result.passed = result.errors.is_empty();
        if result.passed {
            tracing::debug!(files_checked = result.details.files_checked, "verification passed");
        } else {
            tracing::warn!(errors = ?result.errors, "verification failed");
        }

        for ev in &result.events {
            events.emit(ev, serde_json::json!({}));
        }
        result
    }
}

struct CheckOutput {
    errors: Vec<String>,
    warnings: Vec<String>,
    events: Vec<String>,
}

fn run_checks(
    files: &[(VfsPath, Vec<u8>)],
    capabilities: &CapabilityMatrix,
    config: &VerificationConfig,
    tool_constraints: Option<&ToolConstraints>,
) -> CheckOutput {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut event_log = Vec::new();

    for (path, bytes) in files {
        let Ok(text) = std::str::from_utf8(bytes) else {
            errors.push(format!("Syntax Error in {path}: non-UTF8 content"));
            event_log.push("verification:syntax_error".to_string());
            continue;
        };
        let source_profile = capabilities.caps_for(path.as_str());
        let is_privileged = path.is_substrate();

        // 1. Syntax (parse-only heuristic: balanced braces/parens/brackets).
        if let Err(msg) = check_balanced_syntax(text) {
            errors.push(format!("Syntax Error in {path}: {msg}"));
            event_log.push("verification:syntax_error".to_string());
            continue;
        }

        // 2. Dangerous pattern detection.
        for rule in CATALOG.iter() {
            if is_privileged && rule.requires_cap.is_none() {
                continue; // uncapped patterns never apply to substrate paths
            }
            if !rule.regex.is_match(text) {
                continue;
            }
            if let Some(cap) = rule.requires_cap {
                if profile_grants(&source_profile, cap) {
                    continue; // the source path's profile grants the capability: not a violation
                }
            }
            event_log.push("verification:pattern_detected".to_string());
            match rule.severity {
                patterns::Severity::Error => errors.push(format!("{}: {} ({})", path, rule.message, rule.id)),
                patterns::Severity::Warning => warnings.push(format!("{}: {} ({})", path, rule.message, rule.id)),
            }
        }

        // 3. Structural (AST-like) analysis.
        if BRACKET_DYNAMIC_WRITE_RE.is_match(text) {
            warnings.push(format!("{path}: dynamic property write with non-literal key"));
        }
        if SUSPICIOUS_IDENT_RE.is_match(text) {
            warnings.push(format!("{path}: suspicious identifier matching *eval*/*exec*"));
        }
        if BRACKET_FUNCTION_RE.is_match(text) {
            warnings.push(format!("{path}: bracket-notation access to Function"));
        }
        for url_match in URL_RE.find_iter(text) {
            let url = url_match.as_str();
            if !NETWORK_ALLOWLIST.iter().any(|allowed| url.contains(allowed)) {
                warnings.push(format!("{path}: network URL outside allowlist: {url}"));
            }
            if let Some(constraints) = tool_constraints {
                if let Err(msg) = constraints.check_url(url) {
                    errors.push(format!("{path}: {msg}"));
                    event_log.push("verification:capability_violation".to_string());
                }
            }
        }

        // 3b. Per-tool byte/scope constraints (SPEC_FULL.md §3.x).
        if let Some(constraints) = tool_constraints {
            if let Err(msg) = constraints.check_bytes(bytes.len()) {
                errors.push(format!("{path}: {msg}"));
            }
        }

        // 4. Tool shape check.
        if path.is_prefixed_by("/tools/") && !EXPORT_HANDLER_RE.is_match(text) {
            errors.push(format!("{path}: tool module does not export a handler"));
        }

        // 5. Capability boundary.
        for cap in WRITE_CALL_RE.captures_iter(text) {
            let target = &cap[1];
            if !capabilities.can_write_to(path.as_str(), target) {
                errors.push(format!("{path}: not permitted to write to {target}"));
                event_log.push("verification:capability_violation".to_string());
            }
        }

        // 6. Complexity heuristics (non-privileged only).
        if !is_privileged {
            let complexity = analyze_complexity(text, config);
            if complexity.loc > config.max_loc {
                warnings.push(format!("{path}: {} lines exceeds max {}", complexity.loc, config.max_loc));
                event_log.push("verification:complexity_warning".to_string());
            }
            if complexity.functions > config.max_functions {
                warnings.push(format!("{path}: {} functions exceeds max {}", complexity.functions, config.max_functions));
                event_log.push("verification:complexity_warning".to_string());
            }
            if complexity.max_nesting > config.max_nesting {
                warnings.push(format!("{path}: nesting depth {} exceeds max {}", complexity.max_nesting, config.max_nesting));
                event_log.push("verification:complexity_warning".to_string());
            }
            if complexity.long_lines > config.max_long_lines {
                warnings.push(format!(
                    "{path}: {} long lines exceeds max {}",
                    complexity.long_lines, config.max_long_lines
                ));
                event_log.push("verification:complexity_warning".to_string());
            }
        }
    }

    CheckOutput {
        errors,
        warnings,
        events: event_log,
    }
}

fn check_balanced_syntax(text: &str) -> Result<(), String> {
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(quote) = in_string {
            if c == '\\' {
                chars.next();
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => in_string = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return Err(format!("unbalanced '{c}'"));
                }
            }
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(format!("unclosed '{}'", stack.last().unwrap()));
    }
    Ok(())
}

struct Complexity {
    loc: usize,
    functions: usize,
    max_nesting: usize,
    long_lines: usize,
}

/// Brace-counting pass aware of strings and both comment styles
/// (spec.md §4.5 step 6).
fn analyze_complexity(text: &str, config: &VerificationConfig) -> Complexity {
    let loc = text.lines().filter(|l| !l.trim().is_empty()).count();
    let long_lines = text.lines().filter(|l| l.len() > config.long_line_chars).count();
    let functions = FUNCTION_DECL_RE.find_iter(text).count();

    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
            }
            continue;
        }
        if in_block_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block_comment = false;
            }
            continue;
        }
        if let Some(quote) = in_string {
            if c == '\\' {
                chars.next();
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => in_string = Some(c),
            '/' if chars.peek() == Some(&'/') => {
                in_line_comment = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                in_block_comment = true;
            }
            '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' => {
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }

    Complexity {
        loc,
        functions,
        max_nesting: max_depth,
        long_lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ChangeSet;
    use std::sync::Arc;

    fn service() -> VerificationService {
        VerificationService::new(CapabilityMatrix::default_matrix(), VerificationConfig::default())
    }

    #[tokio::test]
    async fn eval_in_tool_is_blocked_s4() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/Bad.js").unwrap();
        changes.insert(path, Some(Arc::from(b"module.exports = function() { eval('x'); }".to_vec().into_boxed_slice())));

        let result = svc.verify_proposal(&vfs, &changes, VerifyOptions::default(), &events).await;
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("eval")));
    }

    #[tokio::test]
    async fn clean_tool_passes() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/AddNumbers.js").unwrap();
        changes.insert(
            path,
            Some(Arc::from(
                b"module.exports = function handler(a, b) { return a + b; }".to_vec().into_boxed_slice(),
            )),
        );

        let result = svc.verify_proposal(&vfs, &changes, VerifyOptions::default(), &events).await;
        assert!(result.passed, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn uncapped_pattern_is_skipped_for_substrate_paths() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/core/agent.js").unwrap();
        changes.insert(
            path,
            Some(Arc::from(
                b"module.exports = function handler() { return obj.__proto__; }".to_vec().into_boxed_slice(),
            )),
        );

        let result = svc.verify_proposal(&vfs, &changes, VerifyOptions::default(), &events).await;
        assert!(result.passed, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn uncapped_pattern_is_still_flagged_for_non_substrate_paths() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/Evil.js").unwrap();
        changes.insert(
            path,
            Some(Arc::from(
                b"module.exports = function handler() { return obj.__proto__; }".to_vec().into_boxed_slice(),
            )),
        );

        let result = svc.verify_proposal(&vfs, &changes, VerifyOptions::default(), &events).await;
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("__proto__")));
    }

    #[tokio::test]
    async fn write_to_substrate_from_tool_fails_capability_boundary_p6() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/Escalate.js").unwrap();
        changes.insert(
            path,
            Some(Arc::from(
                b"module.exports = function handler() { VFS.write(\"/core/agent.js\", \"x\"); }"
                    .to_vec()
                    .into_boxed_slice(),
            )),
        );

        let result = svc.verify_proposal(&vfs, &changes, VerifyOptions::default(), &events).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn tool_without_handler_export_fails_shape_check() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/NoHandler.js").unwrap();
        changes.insert(path, Some(Arc::from(b"const x = 1;".to_vec().into_boxed_slice())));

        let result = svc.verify_proposal(&vfs, &changes, VerifyOptions::default(), &events).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn tool_constraints_reject_oversized_content() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/Big.js").unwrap();
        changes.insert(
            path,
            Some(Arc::from(
                b"module.exports = function handler(a, b) { return a + b; }".to_vec().into_boxed_slice(),
            )),
        );
        let options = VerifyOptions {
            tool_constraints: Some(crate::capability::ToolConstraints {
                max_bytes: Some(8),
                allowed_url_schemes: vec![],
                denied_hosts: vec![],
            }),
            ..VerifyOptions::default()
        };

        let result = svc.verify_proposal(&vfs, &changes, options, &events).await;
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("byte limit")));
    }

    #[tokio::test]
    async fn tool_constraints_reject_denied_host_url() {
        let svc = service();
        let vfs = Vfs::new();
        let events = EventBus::new();
        let mut changes = ChangeSet::new();
        let path = VfsPath::new("/tools/Fetcher.js").unwrap();
        changes.insert(
            path,
            Some(Arc::from(
                b"module.exports = function handler() { return fetch(\"https://evil.example/x\"); }"
                    .to_vec()
                    .into_boxed_slice(),
            )),
        );
        let options = VerifyOptions {
            tool_constraints: Some(crate::capability::ToolConstraints {
                max_bytes: None,
                allowed_url_schemes: vec!["https".into()],
                denied_hosts: vec!["evil.example".into()],
            }),
            ..VerifyOptions::default()
        };

        let result = svc.verify_proposal(&vfs, &changes, options, &events).await;
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("evil.example")));
    }

    #[test]
    fn unbalanced_braces_detected_as_syntax_error() {
        assert!(check_balanced_syntax("function f() { return 1;").is_err());
        assert!(check_balanced_syntax("function f() { return 1; }").is_ok());
    }

    #[test]
    fn string_contents_do_not_confuse_brace_counting() {
        assert!(check_balanced_syntax(r#"const s = "{ unbalanced";"#).is_ok());
    }
}
