//! Event Bus + Audit (spec.md §4, §6): pub/sub for structured events plus an
//! append-only audit log. Persistence mechanics are a host concern (spec.md
//! §1 Non-goals); this module owns only the in-process fan-out and an
//! in-memory audit buffer a host can drain and ship elsewhere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the topics enumerated in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// In-process pub/sub. Subscribers are invoked synchronously and must not
/// block; a host wanting async fan-out wraps its subscriber accordingly.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    pub fn emit(&self, topic: &str, payload: Value) {
        let event = Event::new(topic, payload);
        for subscriber in self.subscribers.lock().iter() {
            subscriber.on_event(&event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

/// `{eventType, timestamp, level, payload}` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub payload: Value,
}

/// Append-only in-memory audit log. A host persists/ships this; mechanics
/// are out of scope (spec.md §1).
#[derive(Default)]
pub struct AuditLogger {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event_type: impl Into<String>, level: AuditLevel, payload: Value) {
        self.records.lock().push(AuditRecord {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            level,
            payload,
        });
    }

    pub fn tool_exec(&self, tool: &str, success: bool, duration_ms: u64, args: &Value) {
        self.record(
            "TOOL_EXEC",
            if success { AuditLevel::Info } else { AuditLevel::Warn },
            serde_json::json!({"tool": tool, "success": success, "durationMs": duration_ms, "args": truncate_args(args)}),
        );
    }

    pub fn tool_permission_denied(&self, tool: &str, worker_id: Option<&str>) {
        self.record(
            "TOOL_PERMISSION_DENIED",
            AuditLevel::Warn,
            serde_json::json!({"tool": tool, "workerId": worker_id}),
        );
    }

    pub fn tool_rejected(&self, tool: &str) {
        self.record("TOOL_REJECTED", AuditLevel::Warn, serde_json::json!({"tool": tool}));
    }

    pub fn worker_spawn(&self, worker_id: &str, worker_type: &str) {
        self.record(
            "WORKER_SPAWN",
            AuditLevel::Info,
            serde_json::json!({"workerId": worker_id, "type": worker_type}),
        );
    }

    pub fn substrate_change(&self, path: &str, tool: &str) {
        self.record(
            "SUBSTRATE_CHANGE",
            AuditLevel::Info,
            serde_json::json!({"path": path, "tool": tool}),
        );
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

/// Audit args are truncated to 200 chars per string value (spec.md §4.6
/// step 5).
fn truncate_args(args: &Value) -> Value {
    match args {
        Value::String(s) if s.chars().count() > 200 => {
            Value::String(format!("{}…", s.chars().take(200).collect::<String>()))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_args(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(truncate_args).collect()),
        other => other.clone(),
    }
}
