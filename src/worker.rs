//! Worker Manager (spec.md §4.7): a bounded pool of subagents running
//! under reduced, per-worker-type permissions. Grounded on the teacher's
//! `subagents::{registry, runner}` pair — the concurrency cap and
//! `can_spawn` check, `generate_agent_id`'s timestamp-plus-random scheme,
//! and `find_best_match`'s keyword scoring for auto-selecting a worker type
//! all carry over.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::{ModelRoles, WorkerConfig};
use crate::error::WorkerError;
use crate::events::{AuditLogger, EventBus};
use crate::llm::{LLMProvider, LLMRequest, ModelConfig};
use crate::message::Message;
use crate::schema::SchemaRegistry;
use crate::toolcall::extract_tool_calls;
use crate::tools::{ExecuteOptions, ToolRunner};
use crate::vfs::{Vfs, VfsPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Completed,
    Error,
    Terminated,
}

/// `{workerId, type, task, permissions, status, startTime, completedTime?,
/// logs, result?, error?}` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub task: String,
    pub permissions: Vec<String>,
    pub status: WorkerStatus,
    pub start_time: DateTime<Utc>,
    pub completed_time: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

pub struct SpawnRequest {
    pub worker_type: String,
    pub task: String,
    pub model_role: Option<String>,
    pub max_iterations: Option<u32>,
    /// Flat hierarchy: only `0` (a top-level spawn) is accepted (spec.md
    /// §4.7, "Workers cannot spawn further workers").
    pub depth: u32,
}

impl SpawnRequest {
    pub fn new(worker_type: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            worker_type: worker_type.into(),
            task: task.into(),
            model_role: None,
            max_iterations: None,
            depth: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStatus {
    Fulfilled,
    Rejected,
}

pub struct WorkerSettlement {
    pub worker_id: String,
    pub status: SettleStatus,
    pub value: Option<Value>,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct AwaitOptions {
    pub worker_ids: Option<Vec<String>>,
    pub all: bool,
}

#[derive(Debug, Clone)]
struct WorkerRunOutcome {
    status: WorkerStatus,
    result: Option<Value>,
    error: Option<String>,
}

const WORKERS_PREFIX: &str = "/.system/workers/";

/// Owns the active/completed worker records and their join handles.
/// Construction returns `Arc<Self>` because `spawn` detaches a task that
/// needs to hold a reference back to the manager for its own lifetime.
pub struct WorkerManager {
    vfs: Arc<Vfs>,
    events: Arc<EventBus>,
    audit: Arc<AuditLogger>,
    tools: Arc<ToolRunner>,
    schemas: Arc<SchemaRegistry>,
    llm: Arc<dyn LLMProvider>,
    config: WorkerConfig,
    model_roles: ModelRoles,
    active: RwLock<HashMap<String, WorkerRecord>>,
    completed: Mutex<LruCache<String, WorkerRecord>>,
    handles: Mutex<HashMap<String, JoinHandle<WorkerRunOutcome>>>,
    id_seq: AtomicU64,
}

impl WorkerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vfs: Arc<Vfs>,
        events: Arc<EventBus>,
        audit: Arc<AuditLogger>,
        tools: Arc<ToolRunner>,
        schemas: Arc<SchemaRegistry>,
        llm: Arc<dyn LLMProvider>,
        config: WorkerConfig,
        model_roles: ModelRoles,
    ) -> Arc<Self> {
        let cap = NonZeroUsize::new(config.completed_cache_cap.max(1)).unwrap();
        Arc::new(Self {
            vfs,
            events,
            audit,
            tools,
            schemas,
            llm,
            config,
            model_roles,
            active: RwLock::new(HashMap::new()),
            completed: Mutex::new(LruCache::new(cap)),
            handles: Mutex::new(HashMap::new()),
            id_seq: AtomicU64::new(0),
        })
    }

    fn next_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::SeqCst);
        format!("worker-{n}")
    }

    /// Scores each registered worker type by keyword overlap with the task
    /// text (teacher: `SubagentRegistry::find_best_match`), falling back to
    /// `explore` when nothing scores.
    pub fn auto_select_worker_type(&self, task: &str) -> String {
        let lower = task.to_ascii_lowercase();
        let mut best: Option<(String, i32)> = None;
        for (name, _) in self.schemas.list_worker_types() {
            let mut score = 0i32;
            if lower.contains(name.as_str()) {
                score += 10;
            }
            score += name.split(&['-', '_'][..]).filter(|part| !part.is_empty() && lower.contains(part)).count() as i32;
            if score > 0 && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((name, score));
            }
        }
        best.map(|(name, _)| name).unwrap_or_else(|| "explore".to_string())
    }

    fn resolve_model(&self, role: Option<&str>) -> ModelConfig {
        let role_name = role.unwrap_or("fast");
        if let Some(cfg) = self.model_roles.0.get(role_name) {
            ModelConfig {
                model: cfg.model.clone(),
                temperature: cfg.temperature,
                max_tokens: None,
            }
        } else {
            ModelConfig {
                model: "gpt-4o".to_string(),
                temperature: 0.2,
                max_tokens: None,
            }
        }
    }

    /// Rejects at `depth > 0` (flat hierarchy, spec.md §4.7) or once the
    /// concurrency cap is reached; otherwise mints a record, persists it,
    /// and detaches the worker loop as a background task.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<String, WorkerError> {
        if request.depth > 0 {
            return Err(WorkerError::FlatHierarchyViolation { depth: request.depth });
        }
        {
            let active = self.active.read();
            if active.len() >= self.config.concurrency_cap {
                return Err(WorkerError::ResourceExhausted { cap: self.config.concurrency_cap });
            }
        }

        let worker_type_schema = self
            .schemas
            .get_worker_type(&request.worker_type)
            .ok_or_else(|| WorkerError::UnknownWorker(request.worker_type.clone()))?;

        let worker_id = self.next_id();
        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            worker_type: request.worker_type.clone(),
            task: request.task.clone(),
            permissions: worker_type_schema.allowed_tools.clone(),
            status: WorkerStatus::Running,
            start_time: Utc::now(),
            completed_time: None,
            logs: Vec::new(),
            result: None,
            error: None,
        };
        self.active.write().insert(worker_id.clone(), record.clone());
        self.persist(&record);
        self.audit.worker_spawn(&worker_id, &request.worker_type);
        tracing::info!(worker_id = %worker_id, worker_type = %request.worker_type, "worker spawned");
        self.events
            .emit("worker:spawned", serde_json::json!({"workerId": worker_id, "type": request.worker_type}));

        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let model = self.resolve_model(request.model_role.as_deref());
        let allowed_tools = record.permissions.clone();

        let this = self.clone();
        let wid = worker_id.clone();
        let task_text = request.task.clone();
        let handle = tokio::spawn(async move { this.run_worker_loop(wid, task_text, allowed_tools, model, max_iterations).await });
        self.handles.lock().insert(worker_id.clone(), handle);

        Ok(worker_id)
    }

    async fn run_worker_loop(
        self: Arc<Self>,
        worker_id: String,
        task: String,
        allowed_tools: Vec<String>,
        model: ModelConfig,
        max_iterations: u32,
    ) -> WorkerRunOutcome {
        let system_prompt = format!(
            "You are a subagent operating under reduced permissions. Task: {task}\nAllowed tools: {}\nYou cannot spawn further workers — this is a flat, single-parent hierarchy. When the task is complete, respond with your final answer and no further tool calls.",
            allowed_tools.join(", ")
        );
        let mut conversation = vec![Message::system(system_prompt), Message::user(task)];
        let mut iterations = 0u32;
        let mut single_tool_streak = 0u32;

        let outcome = loop {
            if iterations >= max_iterations {
                break WorkerRunOutcome {
                    status: WorkerStatus::Error,
                    result: None,
                    error: Some("max iterations exceeded".into()),
                };
            }
            self.events
                .emit("worker:progress", serde_json::json!({"workerId": worker_id, "iteration": iterations}));

            let tool_schemas = filter_schemas(&self.schemas, &allowed_tools);
            let request = LLMRequest { messages: conversation.clone(), model: model.clone(), tools: Some(tool_schemas) };
            let response = match self.llm.chat(request).await {
                Ok(r) => r,
                Err(err) => break WorkerRunOutcome { status: WorkerStatus::Error, result: None, error: Some(err.to_string()) },
            };
            conversation.push(Message::assistant(response.content.clone()));

            let calls = extract_tool_calls(&response);
            if calls.is_empty() {
                break WorkerRunOutcome {
                    status: WorkerStatus::Completed,
                    result: Some(Value::String(response.content)),
                    error: None,
                };
            }

            if calls.len() == 1 {
                single_tool_streak += 1;
            } else {
                single_tool_streak = 0;
            }
            if single_tool_streak >= self.config.single_tool_streak_threshold {
                conversation.push(Message::user(
                    "You've made several single read-only tool calls in a row — batch independent read-only calls together so they can run in parallel.",
                ));
                single_tool_streak = 0;
            }

            for call in calls {
                self.add_log(&worker_id, format!("tool call: {}", call.name));
                let options = ExecuteOptions {
                    allowed_tools: Some(allowed_tools.clone()),
                    worker_id: Some(worker_id.clone()),
                    trace: None,
                };
                match self.tools.execute(&call.name, call.args.clone(), options).await {
                    Ok(value) => conversation.push(Message::user(format!("TOOL_RESULT for {}: {value}", call.name))),
                    Err(err) => conversation.push(Message::user(format!("TOOL_ERROR for {}: {err}", call.name))),
                }
            }
            iterations += 1;
        };

        self.finish(&worker_id, outcome.clone()).await;
        outcome
    }

    async fn finish(&self, worker_id: &str, outcome: WorkerRunOutcome) {
        let removed = {
            let mut active = self.active.write();
            active.remove(worker_id)
        };
        let Some(mut record) = removed else {
            return;
        };
        record.status = outcome.status;
        record.completed_time = Some(Utc::now());
        record.result = outcome.result.clone();
        record.error = outcome.error.clone();

        match outcome.status {
            WorkerStatus::Completed => {
                tracing::info!(worker_id, "worker completed");
                self.events.emit("worker:completed", serde_json::json!({"workerId": worker_id}));
            }
            WorkerStatus::Error => {
                tracing::warn!(worker_id, error = ?outcome.error, "worker errored");
                self.events
                    .emit("worker:error", serde_json::json!({"workerId": worker_id, "error": outcome.error}));
            }
            WorkerStatus::Terminated => self.events.emit("worker:terminated", serde_json::json!({"workerId": worker_id})),
            WorkerStatus::Running => {}
        }

        self.persist(&record);
        self.completed.lock().put(worker_id.to_string(), record);
    }

    fn persist(&self, record: &WorkerRecord) {
        if let (Ok(bytes), Ok(path)) = (
            serde_json::to_vec_pretty(record),
            VfsPath::new(format!("{WORKERS_PREFIX}{}.json", record.worker_id)),
        ) {
            let _ = self.vfs.write(&path, bytes);
        }
    }

    /// Settle-style await: resolves once every named (or, with `all`,
    /// every in-flight) worker finishes, returning a per-worker
    /// fulfilled/rejected outcome rather than failing the whole batch on
    /// one worker's error (spec.md §4.7).
    pub async fn await_workers(&self, options: AwaitOptions) -> Vec<WorkerSettlement> {
        let ids: Vec<String> = if options.all {
            self.handles.lock().keys().cloned().collect()
        } else {
            options.worker_ids.unwrap_or_default()
        };

        let mut settlements = Vec::new();
        for id in ids {
            let handle = self.handles.lock().remove(&id);
            let Some(handle) = handle else {
                settlements.push(WorkerSettlement {
                    worker_id: id,
                    status: SettleStatus::Rejected,
                    value: None,
                    error: Some("unknown worker id".into()),
                });
                continue;
            };
            match handle.await {
                Ok(outcome) if outcome.status == WorkerStatus::Completed => settlements.push(WorkerSettlement {
                    worker_id: id,
                    status: SettleStatus::Fulfilled,
                    value: outcome.result,
                    error: None,
                }),
                Ok(outcome) => settlements.push(WorkerSettlement {
                    worker_id: id,
                    status: SettleStatus::Rejected,
                    value: None,
                    error: outcome.error,
                }),
                Err(join_err) => settlements.push(WorkerSettlement {
                    worker_id: id,
                    status: SettleStatus::Rejected,
                    value: None,
                    error: Some(join_err.to_string()),
                }),
            }
        }
        settlements
    }

    /// Aborts the in-flight task and moves the record to `Terminated`.
    pub fn terminate(&self, worker_id: &str) -> Result<(), WorkerError> {
        let removed = {
            let mut active = self.active.write();
            active.remove(worker_id)
        };
        let Some(mut record) = removed else {
            return Err(WorkerError::UnknownWorker(worker_id.to_string()));
        };
        if let Some(handle) = self.handles.lock().remove(worker_id) {
            handle.abort();
        }
        record.status = WorkerStatus::Terminated;
        record.completed_time = Some(Utc::now());
        self.persist(&record);
        self.events.emit("worker:terminated", serde_json::json!({"workerId": worker_id}));
        self.completed.lock().put(worker_id.to_string(), record);
        Ok(())
    }

    pub fn get_result(&self, worker_id: &str) -> Option<WorkerRecord> {
        if let Some(record) = self.active.read().get(worker_id).cloned() {
            return Some(record);
        }
        self.completed.lock().get(worker_id).cloned()
    }

    pub fn list(&self) -> Vec<WorkerRecord> {
        let mut out: Vec<WorkerRecord> = self.active.read().values().cloned().collect();
        out.extend(self.completed.lock().iter().map(|(_, r)| r.clone()));
        out
    }

    pub fn clear_history(&self) {
        self.completed.lock().clear();
    }

    pub fn add_log(&self, worker_id: &str, line: impl Into<String>) {
        if let Some(record) = self.active.write().get_mut(worker_id) {
            record.logs.push(line.into());
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }
}

fn filter_schemas(schemas: &SchemaRegistry, allowed: &[String]) -> Vec<Value> {
    schemas
        .openai_tool_schemas()
        .into_iter()
        .filter(|schema| {
            schema["function"]["name"]
                .as_str()
                .map(|name| allowed.iter().any(|a| a == name))
                .unwrap_or(false)
        })
        .collect()
}
