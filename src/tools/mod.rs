//! Tool Runner (spec.md §4.6): the only path through which anything in the
//! substrate mutates the VFS. Grounded on the teacher's `tool_policy.rs`
//! permission/approval pipeline, generalized with a verification gate in
//! front of every mutating call per spec.md §4.6 step 4.

pub mod hitl;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use once_cell::sync::OnceCell;

use crate::arena::ArenaHarness;
use crate::capability::{CapabilityMatrix, ToolConstraints};
use crate::error::ToolError;
use crate::events::{AuditLogger, EventBus};
use crate::schema::{SchemaRegistry, ToolSchema};
use crate::vfs::{Bytes, ChangeSet, Vfs, VfsPath};
use crate::verification::{VerificationService, VerifyOptions};
use crate::worker::{SpawnRequest, WorkerManager};
use hitl::{HitlGate, OversightDecision};
use policy::{ToolPolicy, ToolPolicyManager};

/// Extension point for tools registered outside the fixed built-in set
/// (spec.md §3: `Tool.handler`). Built-ins (`ReadFile`, `WriteFile`, ...)
/// are dispatched directly by the runner since they need privileged access
/// to the VFS and verification service; anything else goes through here.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &ToolContext<'_>) -> Result<Value, ToolError>;
}

/// The "deps bag" passed to a handler (spec.md §4.6 step 6): read access to
/// the substrate services a tool is allowed to touch, scoped to this call.
pub struct ToolContext<'a> {
    pub vfs: &'a Vfs,
    pub events: &'a EventBus,
    pub worker_id: Option<&'a str>,
}

/// Executes and verifies JS source for tools created at runtime via
/// `CreateTool` (spec.md §4.2). No JS VM crate appears anywhere in the
/// example pack, so the runner owns only the verify-then-persist half of
/// tool creation and leaves invocation to a host-supplied executor — a
/// host embeds whatever JS/WASM engine it already ships with, the same way
/// the teacher keeps `mcp` tool execution behind a client trait it doesn't
/// implement itself.
#[async_trait]
pub trait DynamicToolExecutor: Send + Sync {
    async fn execute(&self, source: &str, args: Value) -> Result<Value, String>;
}

/// Default executor for hosts that haven't wired one in; surfaces a clear
/// error instead of silently no-opping.
pub struct NoExecutor;

#[async_trait]
impl DynamicToolExecutor for NoExecutor {
    async fn execute(&self, _source: &str, _args: Value) -> Result<Value, String> {
        Err("no DynamicToolExecutor configured for this host".to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub allowed_tools: Option<Vec<String>>,
    pub worker_id: Option<String>,
    pub trace: Option<String>,
}

pub struct ToolRunner {
    vfs: Arc<Vfs>,
    events: Arc<EventBus>,
    audit: Arc<AuditLogger>,
    schemas: Arc<SchemaRegistry>,
    capabilities: CapabilityMatrix,
    verification: VerificationService,
    policy: ToolPolicyManager,
    hitl: HitlGate,
    dynamic_executor: Box<dyn DynamicToolExecutor>,
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    /// Per-tool scoping for the file- and network-capable built-ins
    /// (SPEC_FULL.md §3.x), consulted by Verification alongside the
    /// path-prefix capability boundary.
    tool_constraints: HashMap<String, ToolConstraints>,
    arena: Option<Arc<ArenaHarness>>,
    arena_gating: std::sync::atomic::AtomicBool,
    /// Set once, after construction, by whoever builds the Worker Manager
    /// (spec.md §9: Tool Runner and Worker Manager reference each other but
    /// the Worker Manager is built around a Tool Runner, not before it).
    worker_manager: OnceCell<Arc<WorkerManager>>,
}

impl ToolRunner {
    pub fn new(
        vfs: Arc<Vfs>,
        events: Arc<EventBus>,
        audit: Arc<AuditLogger>,
        schemas: Arc<SchemaRegistry>,
        capabilities: CapabilityMatrix,
        verification: VerificationService,
        policy: ToolPolicyManager,
        hitl: HitlGate,
    ) -> Self {
        Self {
            vfs,
            events,
            audit,
            schemas,
            capabilities,
            verification,
            policy,
            hitl,
            dynamic_executor: Box::new(NoExecutor),
            handlers: RwLock::new(HashMap::new()),
            tool_constraints: default_tool_constraints(),
            arena: None,
            arena_gating: std::sync::atomic::AtomicBool::new(false),
            worker_manager: OnceCell::new(),
        }
    }

    pub fn with_dynamic_executor(mut self, executor: Box<dyn DynamicToolExecutor>) -> Self {
        self.dynamic_executor = executor;
        self
    }

    /// Overrides the default per-tool byte/network scoping (SPEC_FULL.md
    /// §3.x) for a single tool name.
    pub fn with_tool_constraints(mut self, tool: impl Into<String>, constraints: ToolConstraints) -> Self {
        self.tool_constraints.insert(tool.into(), constraints);
        self
    }

    pub fn with_arena(mut self, arena: Arc<ArenaHarness>) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Turns substrate arena-gating on/off at runtime (spec.md §4.6 step 4
    /// is conditional on this flag).
    pub fn set_arena_gating(&self, on: bool) {
        self.arena_gating.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    /// Late-bound: the Worker Manager is constructed with a reference back
    /// to this runner, so it cannot be passed into `new`. Call once, right
    /// after both are constructed.
    pub fn set_worker_manager(&self, manager: Arc<WorkerManager>) {
        let _ = self.worker_manager.set(manager);
    }

    /// Registers a native handler for a non-built-in tool name (spec.md
    /// §4.2's `registerToolSchema` pairs with this for host-defined tools).
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().insert(name.into(), handler);
    }

    /// The full lifecycle of spec.md §4.6: permission filter → policy/HITL
    /// gate for critical tools → dispatch → audit.
    pub async fn execute(&self, name: &str, args: Value, options: ExecuteOptions) -> Result<Value, ToolError> {
        let start = Instant::now();

        if let Some(allowed) = &options.allowed_tools {
            if !allowed.iter().any(|t| t == name) {
                self.audit.tool_permission_denied(name, options.worker_id.as_deref());
                return Err(ToolError::new(name, "not in the caller's allowed tool set", args));
            }
        }

        if self.schemas.get_tool_schema(name).is_none() {
            return Err(ToolError::new(name, "unknown tool", args));
        }

        if self.hitl.requires_approval(name) {
            match self.policy.resolve(name) {
                ToolPolicy::Deny => {
                    self.audit.tool_rejected(name);
                    return Err(ToolError::new(name, "denied by tool policy", args));
                }
                ToolPolicy::Allow => {}
                ToolPolicy::Prompt => match self.hitl.gate(name, &args).await {
                    OversightDecision::Approved => {}
                    OversightDecision::Rejected | OversightDecision::TimedOut => {
                        self.audit.tool_rejected(name);
                        return Err(ToolError::new(name, "rejected by human oversight", args));
                    }
                },
            }
        }

        let result = self.dispatch(name, args.clone(), &options).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        self.audit.tool_exec(name, result.is_ok(), duration_ms, &args);
        match &result {
            Ok(_) => tracing::debug!(tool = name, duration_ms, "tool executed"),
            Err(err) => tracing::warn!(tool = name, duration_ms, %err, "tool execution failed"),
        }
        result
    }

    async fn dispatch(&self, name: &str, args: Value, options: &ExecuteOptions) -> Result<Value, ToolError> {
        let ctx = ToolContext {
            vfs: &self.vfs,
            events: &self.events,
            worker_id: options.worker_id.as_deref(),
        };

        match name {
            "ReadFile" => self.read_file(&args),
            "ListFiles" => self.list_files(&args),
            "Grep" => self.grep(&args),
            "WriteFile" => self.write_file(&args).await,
            "DeleteFile" => self.delete_file(&args).await,
            "Edit" => self.edit(&args).await,
            "CreateTool" => self.create_tool(&args).await,
            "SpawnWorker" => self.spawn_worker(&args).await,
            _ => {
                if let Some(handler) = self.handlers.read().get(name).cloned() {
                    handler.call(args, &ctx).await
                } else {
                    self.invoke_dynamic(name, args).await
                }
            }
        }
    }

    async fn invoke_dynamic(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let path = VfsPath::new(format!("/tools/{name}.js")).map_err(|e| ToolError::new(name, e.to_string(), args.clone()))?;
        let source = self
            .vfs
            .read(&path)
            .map_err(|e| ToolError::new(name, format!("no handler and no source found: {e}"), args.clone()))?;
        let text = String::from_utf8_lossy(&source).to_string();
        self.dynamic_executor
            .execute(&text, args.clone())
            .await
            .map_err(|e| ToolError::new(name, e, args))
    }

    fn read_file(&self, args: &Value) -> Result<Value, ToolError> {
        let path = path_arg(args, "path").map_err(|e| ToolError::new("ReadFile", e, args.clone()))?;
        let bytes = self
            .vfs
            .read(&path)
            .map_err(|e| ToolError::new("ReadFile", e.to_string(), args.clone()))?;
        Ok(serde_json::json!({"content": String::from_utf8_lossy(&bytes)}))
    }

    fn list_files(&self, args: &Value) -> Result<Value, ToolError> {
        let prefix = args.get("prefix").and_then(Value::as_str).unwrap_or("/");
        let paths: Vec<String> = self.vfs.list(prefix).into_iter().map(|p| p.as_str().to_string()).collect();
        Ok(serde_json::json!({"paths": paths}))
    }

    fn grep(&self, args: &Value) -> Result<Value, ToolError> {
        let pattern_str = args
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("Grep", "missing 'pattern' argument", args.clone()))?;
        let prefix = args.get("prefix").and_then(Value::as_str).unwrap_or("/");
        let re = regex::Regex::new(pattern_str).map_err(|e| ToolError::new("Grep", format!("invalid pattern: {e}"), args.clone()))?;

        let mut matches = Vec::new();
        for path in self.vfs.list(prefix) {
            if let Ok(bytes) = self.vfs.read(&path) {
                let text = String::from_utf8_lossy(&bytes);
                for (lineno, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(serde_json::json!({"path": path.as_str(), "line": lineno + 1, "text": line}));
                    }
                }
            }
        }
        Ok(serde_json::json!({"matches": matches}))
    }

    async fn write_file(&self, args: &Value) -> Result<Value, ToolError> {
        let path = path_arg(args, "path").map_err(|e| ToolError::new("WriteFile", e, args.clone()))?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("WriteFile", "missing 'content' argument", args.clone()))?;
        self.verify_and_apply("WriteFile", &path, Some(content.as_bytes().to_vec())).await?;
        Ok(serde_json::json!({"path": path.as_str(), "bytesWritten": content.len()}))
    }

    async fn delete_file(&self, args: &Value) -> Result<Value, ToolError> {
        let path = path_arg(args, "path").map_err(|e| ToolError::new("DeleteFile", e, args.clone()))?;
        self.verify_and_apply("DeleteFile", &path, None).await?;
        Ok(serde_json::json!({"path": path.as_str(), "deleted": true}))
    }

    async fn edit(&self, args: &Value) -> Result<Value, ToolError> {
        let path = path_arg(args, "path").map_err(|e| ToolError::new("Edit", e, args.clone()))?;
        let search = args
            .get("search")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("Edit", "missing 'search' argument", args.clone()))?;
        let replace = args
            .get("replace")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("Edit", "missing 'replace' argument", args.clone()))?;

        let current = self
            .vfs
            .read(&path)
            .map_err(|e| ToolError::new("Edit", e.to_string(), args.clone()))?;
        let current_text = String::from_utf8_lossy(&current);
        if !current_text.contains(search) {
            return Err(ToolError::new("Edit", "search text not found in file", args.clone()));
        }
        let updated = current_text.replacen(search, replace, 1);
        self.verify_and_apply("Edit", &path, Some(updated.into_bytes())).await?;
        Ok(serde_json::json!({"path": path.as_str(), "edited": true}))
    }

    async fn create_tool(&self, args: &Value) -> Result<Value, ToolError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("CreateTool", "missing 'name' argument", args.clone()))?;
        let source = args
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("CreateTool", "missing 'source' argument", args.clone()))?;
        let description = args.get("description").and_then(Value::as_str).unwrap_or("dynamically created tool");

        let path = VfsPath::new(format!("/tools/{name}.js")).map_err(|e| ToolError::new("CreateTool", e.to_string(), args.clone()))?;
        self.verify_and_apply("CreateTool", &path, Some(source.as_bytes().to_vec())).await?;

        self.schemas.register_tool_schema(
            &self.vfs,
            name,
            ToolSchema {
                description: description.to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                read_only: false,
            },
            false,
        );
        Ok(serde_json::json!({"name": name, "created": true}))
    }

    async fn spawn_worker(&self, args: &Value) -> Result<Value, ToolError> {
        let manager = self
            .worker_manager
            .get()
            .ok_or_else(|| ToolError::new("SpawnWorker", "no worker manager configured for this host", args.clone()))?;
        let worker_type = args
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("SpawnWorker", "missing 'type' argument", args.clone()))?;
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("SpawnWorker", "missing 'task' argument", args.clone()))?;

        let request = SpawnRequest::new(worker_type, task);
        let worker_id = manager
            .spawn(request)
            .await
            .map_err(|e| ToolError::new("SpawnWorker", e.to_string(), args.clone()))?;
        Ok(serde_json::json!({"workerId": worker_id}))
    }

    /// Runs the substrate-gating verification step (spec.md §4.6 step 4)
    /// against a single-path change and applies it only on pass — the Tool
    /// Runner never mutates the VFS before verification clears it
    /// (invariant I1). When arena gating is on and the path is part of the
    /// substrate, verification routes through the Arena Harness's solo
    /// `verify_solution` instead, which snapshots and restores around the
    /// attempt so a failing self-modification never lingers.
    async fn verify_and_apply(&self, tool: &str, path: &VfsPath, new_content: Option<Vec<u8>>) -> Result<(), ToolError> {
        let mut changes = ChangeSet::new();
        let value: Option<Bytes> = new_content.map(|bytes| Arc::from(bytes.into_boxed_slice()) as Bytes);
        changes.insert(path.clone(), value.clone());

        let gate_through_arena = path.is_substrate() && self.arena_gating.load(std::sync::atomic::Ordering::SeqCst) && self.arena.is_some();

        let result = if gate_through_arena {
            self.arena
                .as_ref()
                .unwrap()
                .verify_solution(&self.vfs, &self.events, &changes)
                .await
        } else {
            let options = VerifyOptions {
                tool_constraints: self.tool_constraints.get(tool).cloned(),
                ..VerifyOptions::default()
            };
            self.verification.verify_proposal(&self.vfs, &changes, options, &self.events).await
        };

        if path.is_substrate() {
            self.audit.substrate_change(path.as_str(), tool);
        }

        if !result.passed {
            return Err(ToolError::new(
                tool,
                format!("verification failed: {}", result.errors.join("; ")),
                serde_json::json!({"path": path.as_str()}),
            ));
        }

        // Both paths leave the VFS restored to its pre-check state on
        // return (plain verify never applied in the first place; arena
        // verify_solution snapshots and restores around its own attempt).
        // A passing change still needs to land permanently here.
        self.vfs.apply_changes(&changes);
        Ok(())
    }

    pub fn capabilities(&self) -> &CapabilityMatrix {
        &self.capabilities
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }
}

/// The file tools get a byte ceiling so a single write can't blow the VFS's
/// in-memory budget; `RunCommand` is network/process-capable and gets a
/// scheme allow-list instead (SPEC_FULL.md §3.x).
fn default_tool_constraints() -> HashMap<String, ToolConstraints> {
    let file_limit = ToolConstraints {
        max_bytes: Some(1_000_000),
        allowed_url_schemes: vec![],
        denied_hosts: vec![],
    };
    let mut map = HashMap::new();
    for tool in ["WriteFile", "Edit", "CreateTool"] {
        map.insert(tool.to_string(), file_limit.clone());
    }
    map.insert(
        "RunCommand".to_string(),
        ToolConstraints {
            max_bytes: None,
            allowed_url_schemes: vec!["https".into()],
            denied_hosts: vec![],
        },
    );
    map
}

fn path_arg(args: &Value, key: &str) -> Result<VfsPath, String> {
    let raw = args.get(key).and_then(Value::as_str).ok_or_else(|| format!("missing '{key}' argument"))?;
    VfsPath::new(raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerificationConfig;

    fn runner() -> ToolRunner {
        let vfs = Arc::new(Vfs::new());
        let events = Arc::new(EventBus::new());
        let audit = Arc::new(AuditLogger::new());
        let schemas = Arc::new(SchemaRegistry::new());
        schemas.init(&vfs);
        let capabilities = CapabilityMatrix::default_matrix();
        let verification = VerificationService::new(capabilities.clone(), VerificationConfig::default());
        let policy = ToolPolicyManager::new(true);
        let hitl = HitlGate::new(Box::new(hitl::AutoApprove), std::time::Duration::from_secs(5));
        ToolRunner::new(vfs, events, audit, schemas, capabilities, verification, policy, hitl)
    }

    #[tokio::test]
    async fn write_then_read_round_trips_s1() {
        let runner = runner();
        let write_args = serde_json::json!({"path": "/tools/Hello.js", "content": "module.exports = function handler() { return 1; };"});
        let result = runner.execute("WriteFile", write_args, ExecuteOptions::default()).await;
        assert!(result.is_ok(), "{result:?}");

        let read_args = serde_json::json!({"path": "/tools/Hello.js"});
        let read = runner.execute("ReadFile", read_args, ExecuteOptions::default()).await.unwrap();
        assert!(read["content"].as_str().unwrap().contains("handler"));
    }

    #[tokio::test]
    async fn write_rejected_by_verification_leaves_vfs_untouched_i1() {
        let runner = runner();
        let args = serde_json::json!({"path": "/tools/Evil.js", "content": "module.exports = function handler() { eval('x'); };"});
        let result = runner.execute("WriteFile", args, ExecuteOptions::default()).await;
        assert!(result.is_err());
        assert!(!runner.vfs.exists(&VfsPath::new("/tools/Evil.js").unwrap()));
    }

    #[tokio::test]
    async fn permission_filter_blocks_tool_outside_allowed_set_s6() {
        let runner = runner();
        let options = ExecuteOptions {
            allowed_tools: Some(vec!["ReadFile".to_string()]),
            worker_id: Some("w1".to_string()),
            trace: None,
        };
        let result = runner.execute("WriteFile", serde_json::json!({"path": "/apps/x.js", "content": "y"}), options).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn create_tool_registers_schema_s1() {
        let runner = runner();
        let args = serde_json::json!({
            "name": "AddNumbers",
            "source": "module.exports = function handler(a, b) { return a + b; };",
            "description": "adds two numbers",
        });
        let result = runner.execute("CreateTool", args, ExecuteOptions::default()).await;
        assert!(result.is_ok(), "{result:?}");
        assert!(runner.schemas().get_tool_schema("AddNumbers").is_some());
    }

    #[tokio::test]
    async fn denied_policy_blocks_critical_tool_before_hitl() {
        let runner = runner();
        runner.policy.set("DeleteFile", ToolPolicy::Deny, &runner.vfs);
        let result = runner.execute("DeleteFile", serde_json::json!({"path": "/apps/x.js"}), ExecuteOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn write_file_rejects_content_over_its_byte_constraint() {
        let runner = runner().with_tool_constraints(
            "WriteFile",
            crate::capability::ToolConstraints {
                max_bytes: Some(8),
                allowed_url_schemes: vec![],
                denied_hosts: vec![],
            },
        );
        let args = serde_json::json!({"path": "/tools/Big.js", "content": "module.exports = function handler() {};"});
        let result = runner.execute("WriteFile", args, ExecuteOptions::default()).await;
        assert!(result.is_err());
        assert!(!runner.vfs.exists(&VfsPath::new("/tools/Big.js").unwrap()));
    }

    #[tokio::test]
    async fn unknown_tool_name_is_rejected() {
        let runner = runner();
        let result = runner.execute("NotRegistered", serde_json::json!({}), ExecuteOptions::default()).await;
        assert!(result.is_err());
    }
}
