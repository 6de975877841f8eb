//! Schema Registry (spec.md §4.2): tool/worker-type schemas, read-only
//! classification, persistence to `/.system/schemas.json`.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vfs::{Vfs, VfsPath};

/// A tool's schema metadata (spec.md §3: `Tool.schema`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub description: String,
    pub parameters: Value,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
}

/// A worker type's schema (spec.md §4.7: allowed-tools resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTypeSchema {
    pub description: String,
    pub allowed_tools: Vec<String>,
}

/// Read-only fallback classification for well-known tool names whose
/// schema omits an explicit `readOnly` field (spec.md §4.2, §4.8 step 6).
const READ_ONLY_FALLBACK: &[&str] = &["ReadFile", "ListFiles", "Grep"];

#[derive(Serialize, Deserialize, Default)]
struct PersistedSchemas {
    tools: HashMap<String, ToolSchema>,
    workers: HashMap<String, WorkerTypeSchema>,
}

struct Inner {
    tool_schemas: HashMap<String, ToolSchema>,
    builtin_tools: std::collections::HashSet<String>,
    worker_types: HashMap<String, WorkerTypeSchema>,
    builtin_workers: std::collections::HashSet<String>,
}

/// Owns schema metadata; the Tool Runner owns the live handler map
/// separately (spec.md §3, "Lifecycle/ownership").
pub struct SchemaRegistry {
    inner: RwLock<Inner>,
}

const PERSIST_PATH: &str = "/.system/schemas.json";

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tool_schemas: HashMap::new(),
                builtin_tools: std::collections::HashSet::new(),
                worker_types: HashMap::new(),
                builtin_workers: std::collections::HashSet::new(),
            }),
        }
    }

    /// Registers built-in schemas, then loads any persisted non-built-ins
    /// from `/.system/schemas.json` without overwriting built-ins
    /// (spec.md §4.2).
    pub fn init(&self, vfs: &Vfs) {
        self.register_builtin_defaults();
        if let Ok(path) = VfsPath::new(PERSIST_PATH) {
            if let Ok(bytes) = vfs.read(&path) {
                if let Ok(persisted) = serde_json::from_slice::<PersistedSchemas>(&bytes) {
                    let mut guard = self.inner.write();
                    for (name, schema) in persisted.tools {
                        guard.tool_schemas.entry(name).or_insert(schema);
                    }
                    for (name, schema) in persisted.workers {
                        guard.worker_types.entry(name).or_insert(schema);
                    }
                }
            }
        }
    }

    fn register_builtin_defaults(&self) {
        let builtins: &[(&str, bool, &str)] = &[
            ("ReadFile", true, "Read a file's contents from the VFS"),
            ("ListFiles", true, "List VFS paths under a prefix"),
            ("Grep", true, "Search file contents by pattern"),
            ("WriteFile", false, "Write bytes to a VFS path"),
            ("DeleteFile", false, "Delete a VFS path"),
            ("Edit", false, "Apply a targeted edit to a file"),
            ("CreateTool", false, "Create a new dynamic tool"),
            ("RunCommand", false, "Execute a subagent-visible command"),
            ("SpawnWorker", false, "Spawn a subagent worker"),
        ];
        let mut guard = self.inner.write();
        for (name, read_only, description) in builtins {
            guard.tool_schemas.insert(
                (*name).to_string(),
                ToolSchema {
                    description: (*description).to_string(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                    read_only: *read_only,
                },
            );
            guard.builtin_tools.insert((*name).to_string());
        }

        let worker_types: &[(&str, &[&str])] = &[
            ("explore", &["ReadFile", "ListFiles", "Grep"]),
            ("analyze", &["ReadFile", "ListFiles", "Grep"]),
            ("execute", &["ReadFile", "ListFiles", "Grep", "WriteFile", "DeleteFile", "Edit", "CreateTool", "RunCommand"]),
        ];
        for (name, tools) in worker_types {
            guard.worker_types.insert(
                (*name).to_string(),
                WorkerTypeSchema {
                    description: format!("{name} worker"),
                    allowed_tools: tools.iter().map(|s| s.to_string()).collect(),
                },
            );
            guard.builtin_workers.insert((*name).to_string());
        }
    }

    pub fn register_tool_schema(&self, vfs: &Vfs, name: impl Into<String>, schema: ToolSchema, builtin: bool) {
        let name = name.into();
        {
            let mut guard = self.inner.write();
            if builtin {
                guard.builtin_tools.insert(name.clone());
            }
            guard.tool_schemas.insert(name, schema);
        }
        self.persist(vfs);
    }

    /// Built-in schemas cannot be unregistered (spec.md §4.2).
    pub fn unregister_tool_schema(&self, vfs: &Vfs, name: &str) -> bool {
        let removed = {
            let mut guard = self.inner.write();
            if guard.builtin_tools.contains(name) {
                false
            } else {
                guard.tool_schemas.remove(name).is_some()
            }
        };
        if removed {
            self.persist(vfs);
        }
        removed
    }

    pub fn get_tool_schema(&self, name: &str) -> Option<ToolSchema> {
        self.inner.read().tool_schemas.get(name).cloned()
    }

    pub fn list_tool_schemas(&self) -> HashMap<String, ToolSchema> {
        self.inner.read().tool_schemas.clone()
    }

    pub fn is_tool_read_only(&self, name: &str) -> bool {
        let guard = self.inner.read();
        if let Some(schema) = guard.tool_schemas.get(name) {
            schema.read_only
        } else {
            READ_ONLY_FALLBACK.contains(&name)
        }
    }

    pub fn register_worker_types(&self, vfs: &Vfs, types: HashMap<String, WorkerTypeSchema>, builtin: bool) {
        {
            let mut guard = self.inner.write();
            for (name, schema) in types {
                if builtin {
                    guard.builtin_workers.insert(name.clone());
                }
                guard.worker_types.insert(name, schema);
            }
        }
        self.persist(vfs);
    }

    pub fn get_worker_type(&self, name: &str) -> Option<WorkerTypeSchema> {
        self.inner.read().worker_types.get(name).cloned()
    }

    pub fn list_worker_types(&self) -> HashMap<String, WorkerTypeSchema> {
        self.inner.read().worker_types.clone()
    }

    /// OpenAI-style `{type: "function", function: {name, description,
    /// parameters}}` tool schema list (spec.md §4.6).
    pub fn openai_tool_schemas(&self) -> Vec<Value> {
        let guard = self.inner.read();
        let mut names: Vec<&String> = guard.tool_schemas.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let schema = &guard.tool_schemas[name];
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": schema.description,
                        "parameters": schema.parameters,
                    }
                })
            })
            .collect()
    }

    fn persist(&self, vfs: &Vfs) {
        let guard = self.inner.read();
        let persisted = PersistedSchemas {
            tools: guard
                .tool_schemas
                .iter()
                .filter(|(name, _)| !guard.builtin_tools.contains(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            workers: guard
                .worker_types
                .iter()
                .filter(|(name, _)| !guard.builtin_workers.contains(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        drop(guard);
        if let (Ok(bytes), Ok(path)) = (serde_json::to_vec_pretty(&persisted), VfsPath::new(PERSIST_PATH)) {
            let _ = vfs.write(&path, bytes);
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(read_only: bool) -> ToolSchema {
        ToolSchema {
            description: "test".into(),
            parameters: serde_json::json!({}),
            read_only,
        }
    }

    #[test]
    fn builtins_cannot_be_unregistered() {
        let vfs = Vfs::new();
        let registry = SchemaRegistry::new();
        registry.init(&vfs);
        assert!(!registry.unregister_tool_schema(&vfs, "ReadFile"));
        assert!(registry.get_tool_schema("ReadFile").is_some());
    }

    #[test]
    fn non_builtin_schemas_persist_across_reinit() {
        let vfs = Vfs::new();
        let registry = SchemaRegistry::new();
        registry.init(&vfs);
        registry.register_tool_schema(&vfs, "CustomThing", schema(true), false);

        let registry2 = SchemaRegistry::new();
        registry2.init(&vfs);
        assert!(registry2.get_tool_schema("CustomThing").is_some());
        // builtins still present and not overwritten by the (empty) persisted builtin set
        assert!(registry2.get_tool_schema("ReadFile").is_some());
    }

    #[test]
    fn read_only_fallback_applies_without_explicit_schema() {
        let registry = SchemaRegistry::new();
        assert!(registry.is_tool_read_only("ListFiles"));
        assert!(!registry.is_tool_read_only("SomeUnknownTool"));
    }

    #[test]
    fn explicit_schema_overrides_fallback() {
        let vfs = Vfs::new();
        let registry = SchemaRegistry::new();
        registry.register_tool_schema(&vfs, "ReadFile", schema(false), false);
        assert!(!registry.is_tool_read_only("ReadFile"));
    }
}
