//! Agent Loop (spec.md §4.8): the cognitive cycle — gather context, call
//! the model, execute any tool calls, append results, repeat. Grounded on
//! the teacher's `core::agent::session::controller::AgentSessionController`
//! (`run_turn` driving one model call to completion and emitting
//! `AgentEvent`s around it) generalized from a single streamed turn to a
//! full iterate-until-done loop with retry, context management, and a
//! read-only/mutating tool-call split.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::config::{AgentConfig, ReploidConfig};
use crate::context::{ContextManager, MemoryPressureProbe};
use crate::events::{AuditLogger, EventBus};
use crate::llm::{LLMError, LLMProvider, LLMRequest, ModelConfig, RetryPolicy};
use crate::memory::{MemoryManager, RetrieveOptions};
use crate::message::Message;
use crate::schema::SchemaRegistry;
use crate::toolcall::{extract_tool_calls, ParsedCall};
use crate::tools::{ExecuteOptions, ToolRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    ModelFinished,
    MaxIterationsReached,
    ContextHalted,
}

pub struct TurnOutcome {
    pub final_message: Option<String>,
    pub iterations: u32,
    pub halt_reason: HaltReason,
}

struct ToolOutcome {
    index: usize,
    text: String,
}

/// Drives one conversation to completion. Holds no conversation state of
/// its own beyond what's passed in — a caller owns the transcript across
/// turns the way a session owns `AgentSessionState` in the teacher.
pub struct AgentLoop {
    llm: Arc<dyn LLMProvider>,
    model: ModelConfig,
    context: Arc<ContextManager>,
    memory: Option<Arc<MemoryManager>>,
    tools: Arc<ToolRunner>,
    schemas: Arc<SchemaRegistry>,
    events: Arc<EventBus>,
    audit: Arc<AuditLogger>,
    config: AgentConfig,
    retry: RetryPolicy,
    /// Optional host memory-pressure signal (SPEC_FULL.md §4.3), consulted
    /// once per iteration alongside the token-based context thresholds.
    memory_pressure: Option<Arc<dyn MemoryPressureProbe>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        model: ModelConfig,
        context: Arc<ContextManager>,
        memory: Option<Arc<MemoryManager>>,
        tools: Arc<ToolRunner>,
        schemas: Arc<SchemaRegistry>,
        events: Arc<EventBus>,
        audit: Arc<AuditLogger>,
        reploid_config: &ReploidConfig,
    ) -> Self {
        Self {
            llm,
            model,
            context,
            memory,
            tools,
            schemas,
            events,
            audit,
            config: reploid_config.agent.clone(),
            retry: RetryPolicy::default(),
            memory_pressure: None,
        }
    }

    /// Wires a host memory-pressure probe in; omit it and the loop relies
    /// solely on token-threshold compaction (spec.md §4.3).
    pub fn with_memory_pressure_probe(mut self, probe: Arc<dyn MemoryPressureProbe>) -> Self {
        self.memory_pressure = Some(probe);
        self
    }

    /// Runs the loop until the model stops emitting tool calls, the
    /// iteration circuit breaker trips, or context management halts the
    /// session (spec.md §4.8, §4.4).
    pub async fn run(&self, transcript: &mut Vec<Message>) -> TurnOutcome {
        let mut iterations = 0u32;

        loop {
            if iterations >= self.config.max_iterations {
                return TurnOutcome { final_message: None, iterations, halt_reason: HaltReason::MaxIterationsReached };
            }

            if let Some(memory) = &self.memory {
                let last_user_content = transcript.iter().rev().find(|m| m.role == crate::message::Role::User).map(|m| m.content.clone());
                if let Some(query) = last_user_content {
                    if let Ok(retrieval) = memory.retrieve(&query, &RetrieveOptions::default()).await {
                        let body = retrieval.summary.clone().unwrap_or_else(|| {
                            retrieval
                                .memories
                                .iter()
                                .map(|hit| hit.memory.content.as_str())
                                .collect::<Vec<_>>()
                                .join("\n")
                        });
                        if !body.is_empty() {
                            transcript.push(Message::system(format!("Relevant memory:\n{body}")));
                            self.context.invalidate_cache();
                        }
                    }
                }
            }

            let pressure = self.memory_pressure.as_ref().map(|p| p.read());
            let managed = self.context.manage(transcript, &self.model.model, &self.events, pressure);
            *transcript = managed.context;
            if managed.halted {
                return TurnOutcome {
                    final_message: managed.error,
                    iterations,
                    halt_reason: HaltReason::ContextHalted,
                };
            }

            self.events.emit("agent:turn_started", serde_json::json!({"iteration": iterations}));
            let response = match self.call_with_retry(transcript).await {
                Ok(r) => r,
                Err(err) => {
                    transcript.push(Message::assistant(format!("LLM call failed: {err}")));
                    self.context.invalidate_cache();
                    return TurnOutcome { final_message: Some(err.to_string()), iterations, halt_reason: HaltReason::ModelFinished };
                }
            };

            transcript.push(Message::assistant(response.content.clone()));
            self.context.invalidate_cache();

            let calls = extract_tool_calls(&response);
            if calls.is_empty() {
                self.events.emit("agent:turn_completed", serde_json::json!({"iteration": iterations}));
                return TurnOutcome {
                    final_message: Some(response.content),
                    iterations: iterations + 1,
                    halt_reason: HaltReason::ModelFinished,
                };
            }

            if let Some(memory) = &self.memory {
                let _ = memory.add(transcript.last().unwrap()).await;
            }

            self.run_tool_calls(calls, transcript).await;
            self.context.invalidate_cache();
            iterations += 1;
        }
    }

    async fn call_with_retry(&self, transcript: &[Message]) -> Result<crate::llm::LLMResponse, LLMError> {
        let tool_schemas = self.schemas.openai_tool_schemas();
        let mut attempt = 0u32;
        loop {
            let request = LLMRequest { messages: transcript.to_vec(), model: self.model.clone(), tools: Some(tool_schemas.clone()) };
            match self.llm.chat(request).await {
                Ok(response) => return Ok(response),
                Err(err) if self.retry.is_retryable(&err) && attempt + 1 < self.retry.max_attempts => {
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Read-only calls run concurrently; mutating calls run strictly in
    /// the model's emission order so one write can't race another's
    /// precondition (spec.md §4.8 step 6, property P8 reorders the
    /// results back by `index` rather than completion order).
    async fn run_tool_calls(&self, calls: Vec<ParsedCall>, transcript: &mut Vec<Message>) {
        let (read_only, mutating): (Vec<_>, Vec<_>) = calls.into_iter().partition(|c| self.schemas.is_tool_read_only(&c.name));

        let mut handles = Vec::new();
        for call in read_only {
            let tools = self.tools.clone();
            handles.push(tokio::spawn(async move {
                let index = call.index;
                let text = dispatch_one(&tools, &call).await;
                ToolOutcome { index, text }
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            if let Ok(outcome) = handle.await {
                outcomes.push(outcome);
            }
        }

        for call in mutating {
            let index = call.index;
            let text = dispatch_one(&self.tools, &call).await;
            outcomes.push(ToolOutcome { index, text });
        }

        outcomes.sort_by_key(|o| o.index);
        for outcome in outcomes {
            transcript.push(Message::user(outcome.text));
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

async fn dispatch_one(tools: &Arc<ToolRunner>, call: &ParsedCall) -> String {
    let start = Instant::now();
    let result = tools.execute(&call.name, call.args.clone(), ExecuteOptions::default()).await;
    let elapsed_ms = start.elapsed().as_millis();
    match result {
        Ok(value) => format!("TOOL_RESULT for {} ({elapsed_ms}ms): {}", call.name, render(&value)),
        Err(err) => format!("TOOL_ERROR for {} ({elapsed_ms}ms): {err}", call.name),
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityMatrix;
    use crate::config::VerificationConfig;
    use crate::llm::{LLMResponse, NativeToolCall};
    use crate::tools::hitl::{AutoApprove, HitlGate};
    use crate::tools::policy::ToolPolicyManager;
    use crate::verification::VerificationService;
    use crate::vfs::Vfs;
    use async_trait::async_trait;
    use parking_lot::Mutex as PLMutex;
    use std::time::Duration;

    struct ScriptedLLM {
        responses: PLMutex<Vec<LLMResponse>>,
    }

    #[async_trait]
    impl LLMProvider for ScriptedLLM {
        fn name(&self) -> &str {
            "scripted"
        }
        fn supported_models(&self) -> Vec<String> {
            vec!["scripted".into()]
        }
        async fn chat(&self, _request: LLMRequest) -> Result<LLMResponse, LLMError> {
            let mut guard = self.responses.lock();
            if guard.is_empty() {
                Ok(LLMResponse { content: "done".into(), tool_calls: None, usage: None })
            } else {
                Ok(guard.remove(0))
            }
        }
    }

    fn tool_runner() -> Arc<ToolRunner> {
        let vfs = Arc::new(Vfs::new());
        let events = Arc::new(EventBus::new());
        let audit = Arc::new(AuditLogger::new());
        let schemas = Arc::new(SchemaRegistry::new());
        schemas.init(&vfs);
        let capabilities = CapabilityMatrix::default_matrix();
        let verification = VerificationService::new(capabilities.clone(), VerificationConfig::default());
        let policy = ToolPolicyManager::new(false);
        let hitl = HitlGate::new(Box::new(AutoApprove), Duration::from_secs(5));
        Arc::new(ToolRunner::new(vfs, events, audit, schemas, capabilities, verification, policy, hitl))
    }

    fn loop_with(llm: Arc<dyn LLMProvider>) -> (AgentLoop, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let audit = Arc::new(AuditLogger::new());
        let schemas = Arc::new(SchemaRegistry::new());
        let vfs = Vfs::new();
        schemas.init(&vfs);
        let reploid_config = ReploidConfig::default();
        let context = Arc::new(ContextManager::new(reploid_config.clone()));
        let tools = tool_runner();
        let model = ModelConfig { model: "scripted".into(), temperature: 0.0, max_tokens: None };
        (AgentLoop::new(llm, model, context, None, tools, schemas, events.clone(), audit, &reploid_config), events)
    }

    #[tokio::test]
    async fn model_with_no_tool_calls_finishes_immediately_s2() {
        let llm = Arc::new(ScriptedLLM { responses: PLMutex::new(vec![]) });
        let (agent, _events) = loop_with(llm);
        let mut transcript = vec![Message::user("hello".to_string())];
        let outcome = agent.run(&mut transcript).await;
        assert_eq!(outcome.halt_reason, HaltReason::ModelFinished);
        assert_eq!(outcome.final_message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn tool_call_then_finish_round_trips() {
        let first = LLMResponse {
            content: String::new(),
            tool_calls: Some(vec![NativeToolCall { id: "1".into(), name: "ListFiles".into(), args: serde_json::json!({}) }]),
            usage: None,
        };
        let llm = Arc::new(ScriptedLLM { responses: PLMutex::new(vec![first]) });
        let (agent, _events) = loop_with(llm);
        let mut transcript = vec![Message::user("list files".to_string())];
        let outcome = agent.run(&mut transcript).await;
        assert_eq!(outcome.halt_reason, HaltReason::ModelFinished);
        assert!(transcript.iter().any(|m| m.content.contains("TOOL_RESULT for ListFiles")));
    }

    #[tokio::test]
    async fn max_iterations_trips_circuit_breaker() {
        let endless = LLMResponse {
            content: String::new(),
            tool_calls: Some(vec![NativeToolCall { id: "1".into(), name: "ListFiles".into(), args: serde_json::json!({}) }]),
            usage: None,
        };
        let responses = (0..200).map(|_| endless.clone()).collect();
        let llm = Arc::new(ScriptedLLM { responses: PLMutex::new(responses) });
        let (mut agent, _events) = loop_with(llm);
        agent.config.max_iterations = 2;
        let mut transcript = vec![Message::user("loop forever".to_string())];
        let outcome = agent.run(&mut transcript).await;
        assert_eq!(outcome.halt_reason, HaltReason::MaxIterationsReached);
    }
}
