//! # reploid - a browser-resident, self-modifying agent substrate
//!
//! `reploid` provides the reusable core of an agent that runs entirely
//! client-side and is permitted to rewrite its own tools and working
//! memory at runtime. It is host-agnostic: nothing here opens a socket,
//! spawns a process, or assumes a particular LLM provider — a host wires
//! those in through the traits this crate exposes (`LLMProvider`,
//! `SemanticStore`, `DynamicToolExecutor`).
//!
//! ## Architecture overview
//!
//! - `vfs`: the virtual filesystem every other module reads and writes
//!   through — snapshot/restore/diff is how the Arena Harness and
//!   Verification Service get transactional semantics without a real
//!   filesystem underneath.
//! - `schema`: tool and worker-type schema registry, read-only
//!   classification, OpenAI-style tool-schema export for LLM requests.
//! - `capability`: per-path capability profiles and the write-
//!   authorization relation Verification and the Tool Runner both consult.
//! - `verification`: the pattern/complexity/capability-boundary gate every
//!   mutation passes through before it lands.
//! - `tools`: the Tool Runner — permission filter, policy/HITL gate,
//!   dispatch, substrate arena-gating, audit.
//! - `arena`: competitive multi-proposal selection and solo self-
//!   modification verification, both built around VFS snapshot/restore.
//! - `memory`: working-memory ring buffer plus semantic long-term storage
//!   with decay-weighted retrieval and adaptive pruning.
//! - `context`: token estimation, per-model limits, standard/aggressive
//!   compaction.
//! - `worker`: the bounded, flat-hierarchy subagent pool.
//! - `agent`: the cognitive cycle tying context, memory, the LLM, and
//!   tool execution together into an iterate-until-done loop.
//! - `events`: the pub/sub event bus and the append-only audit log.
//! - `config`: typed, `serde`-driven configuration with resolved defaults
//!   at every level.
//! - `error`: the crate's structured error types, built on `thiserror`.

pub mod agent;
pub mod arena;
pub mod capability;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod events;
pub mod llm;
pub mod memory;
pub mod message;
pub mod schema;
pub mod toolcall;
pub mod tools;
pub mod verification;
pub mod vfs;
pub mod worker;

pub use agent::{AgentLoop, HaltReason, TurnOutcome};
pub use arena::{ArenaHarness, CompetitionOutcome, CompetitionRequest, CompetitionStatus, Competitor};
pub use capability::CapabilityMatrix;
pub use config::ReploidConfig;
pub use context::{ContextManager, MemoryPressure, MemoryPressureProbe};
pub use events::{AuditLogger, Event, EventBus};
pub use llm::{LLMProvider, LLMRequest, LLMResponse};
pub use memory::MemoryManager;
pub use message::{Message, Role};
pub use schema::SchemaRegistry;
pub use tools::{ExecuteOptions, ToolRunner};
pub use verification::VerificationService;
pub use vfs::{Vfs, VfsPath};
pub use worker::{SpawnRequest, WorkerManager};
