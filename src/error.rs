//! Error taxonomy for the Reploid core.
//!
//! Structural boundaries (VFS, tools, verification, context, workers, arena)
//! use `thiserror`-derived enums so callers can pattern-match on a specific
//! failure kind; everything else propagates through `anyhow::Result`.

use std::path::PathBuf;

use serde::Serialize;

/// VFS-level failures (spec.md §7.2, §7.9).
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("quota exceeded writing {path}: {detail}")]
    QuotaExceeded { path: String, detail: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Failure within a tool invocation. Carries `{tool, args}` per spec.md §7.3.
#[derive(Debug, thiserror::Error)]
#[error("tool '{tool}' failed: {message}")]
pub struct ToolError {
    pub tool: String,
    pub message: String,
    pub args: serde_json::Value,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
            args,
        }
    }
}

/// Distinct from `ToolError`: prevents the mutation, leaves the VFS unchanged
/// (spec.md §7.4).
#[derive(Debug, Clone, Serialize)]
pub struct VerificationFailure {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verification failed: {}", self.errors.join("; "))
    }
}

impl std::error::Error for VerificationFailure {}

/// A worker attempted a tool outside its permitted set (spec.md §7.5).
#[derive(Debug, thiserror::Error)]
#[error("permission denied: worker '{worker_id}' attempted '{tool}' outside its allowed tools")]
pub struct PermissionDenied {
    pub worker_id: String,
    pub tool: String,
}

/// Context/token-budget errors (spec.md §7.7, §4.3).
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context exceeds hard limit after aggressive compaction ({tokens} > {hard})")]
    Exceeded { tokens: usize, hard: usize },
}

/// Worker manager resource errors (spec.md §7.8, §4.7).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("resource exhausted: concurrency cap ({cap}) reached")]
    ResourceExhausted { cap: usize },
    #[error("flat hierarchy violation: worker at depth {depth} attempted to spawn")]
    FlatHierarchyViolation { depth: u32 },
    #[error("unknown worker id: {0}")]
    UnknownWorker(String),
    #[error(transparent)]
    Permission(#[from] PermissionDenied),
}

/// Arena harness errors.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("no competitors supplied")]
    NoCompetitors,
    #[error("snapshot restore failed: {0}")]
    RestoreFailed(String),
}

/// Failure kind used for the structured, user-visible `{ok: false, kind,
/// message, context}` envelope described in spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Tool,
    VerificationFailure,
    PermissionDenied,
    Timeout,
    ContextExceeded,
    ResourceExhausted,
    Io,
    QuotaExceeded,
    RetryExhausted,
}

/// The structured failure envelope every public-facing API returns on error.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub ok: bool,
    pub kind: ErrorKind,
    pub message: String,
    pub context: serde_json::Value,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            kind,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

pub fn invalid_path(path: impl Into<PathBuf>) -> VfsError {
    VfsError::InvalidPath(path.into().display().to_string())
}
