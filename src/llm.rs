//! LLM provider contract (spec.md §6). Out of scope per spec.md §1: only
//! the request/response shape is specified here; concrete HTTP/streaming
//! clients are a host concern. Grounded on the teacher's
//! `llm::provider::provider_trait::LLMProvider` trait shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// A tool call as surfaced natively by a provider (spec.md §6, "Native"
/// wire format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LLMRequest {
    pub messages: Vec<Message>,
    pub model: ModelConfig,
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<NativeToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("rate limit exceeded")]
    RateLimit,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("provider error: {0}")]
    Provider(String),
}

/// Universal LLM provider trait. A host implements this against its chosen
/// backend (Anthropic, OpenAI, a local WebGPU inference engine, etc. —
/// spec.md §1 explicitly keeps these as plain providers behind this
/// interface).
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supported_models(&self) -> Vec<String>;

    async fn chat(&self, request: LLMRequest) -> Result<LLMResponse, LLMError>;
}

/// Retry policy for transient LLM errors (spec.md §7.6): exponential
/// backoff, bounded attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.base_delay_ms * 2u64.saturating_pow(attempt))
    }

    pub fn is_retryable(&self, error: &LLMError) -> bool {
        matches!(error, LLMError::RateLimit | LLMError::Network(_) | LLMError::Timeout(_))
    }
}
