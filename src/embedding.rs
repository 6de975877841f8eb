//! Embedding/semantic store contract (spec.md §4.4, §6). Out of scope per
//! spec.md §1: only the put/query contract is specified; a host supplies a
//! concrete vector store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub id: String,
    pub content: String,
    pub domain: String,
    pub source: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub memory: SemanticMemory,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticStoreStats {
    pub count: usize,
    pub domains: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider error: {0}")]
    Provider(String),
}

/// `{embed(query)->vec, searchSimilar(vec, k, minScore)->list<{memory,
/// similarity}>, addMemory(...), deleteMemory(id), getAllMemories(),
/// getStats()}` (spec.md §4.4).
#[async_trait]
pub trait SemanticStore: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn search_similar(&self, vector: &[f32], k: usize, min_score: f32) -> Result<Vec<SimilarityHit>, EmbeddingError>;

    async fn add_memory(&self, memory: SemanticMemory) -> Result<(), EmbeddingError>;

    async fn delete_memory(&self, id: &str) -> Result<(), EmbeddingError>;

    async fn get_all_memories(&self) -> Result<Vec<SemanticMemory>, EmbeddingError>;

    async fn get_stats(&self) -> Result<SemanticStoreStats, EmbeddingError>;
}
