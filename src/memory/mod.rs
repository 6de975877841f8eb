//! Memory Manager (spec.md §4.4): three tiers (working/episodic/semantic)
//! with eviction, recursive summarization, and retrieval.

pub mod retention;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MemoryConfig;
use crate::context::estimate_tokens;
use crate::embedding::{SemanticMemory, SemanticStore, SimilarityHit};
use crate::events::EventBus;
use crate::llm::{LLMProvider, LLMRequest, ModelConfig};
use crate::message::{Message, Role};
use crate::vfs::{Vfs, VfsPath};
use retention::ImportanceCategory;

const SUMMARY_PATH: &str = "/memory/episodes/summary.md";
const FULL_HISTORY_PATH: &str = "/memory/episodes/full.jsonl";

/// `{id, role, content, timestamp, sessionId, metadata}` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub metadata: Option<Value>,
    #[serde(skip)]
    pub access_count: u32,
}

impl MemoryEntry {
    fn category(&self) -> ImportanceCategory {
        ImportanceCategory::classify(
            matches!(self.role, Role::User),
            matches!(self.role, Role::Assistant),
            &self.content,
        )
    }

    fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Retrieval options (spec.md §4.4 `retrieve`).
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub max_tokens: usize,
    pub include_summary: bool,
    pub include_episodic: bool,
    pub top_k: usize,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2_000,
            include_summary: true,
            include_episodic: true,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub summary: Option<String>,
    pub memories: Vec<SimilarityHit>,
}

pub struct MemoryManager {
    vfs: Arc<Vfs>,
    semantic: Arc<dyn SemanticStore>,
    llm: Arc<dyn LLMProvider>,
    config: MemoryConfig,
    events: Arc<EventBus>,
    working: RwLock<VecDeque<MemoryEntry>>,
    session_id: String,
    id_seq: std::sync::atomic::AtomicU64,
}

impl MemoryManager {
    pub fn new(
        vfs: Arc<Vfs>,
        semantic: Arc<dyn SemanticStore>,
        llm: Arc<dyn LLMProvider>,
        config: MemoryConfig,
        events: Arc<EventBus>,
        session_id: impl Into<String>,
    ) -> Self {
        events.emit("memory:initialized", serde_json::json!({}));
        Self {
            vfs,
            semantic,
            llm,
            config,
            events,
            working: RwLock::new(VecDeque::new()),
            session_id: session_id.into(),
            id_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("mem-{n}")
    }

    fn working_tokens(entries: &VecDeque<MemoryEntry>) -> usize {
        entries.iter().map(|e| estimate_tokens(&e.content)).sum()
    }

    /// Appends to working memory; evicts the oldest `ceil(len ×
    /// evictionRatio)` entries if the token limit is exceeded.
    pub async fn add(&self, message: &Message) -> anyhow::Result<String> {
        let entry = MemoryEntry {
            id: self.next_id(),
            role: message.role,
            content: message.content.clone(),
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            metadata: message.metadata.clone(),
            access_count: 0,
        };
        let id = entry.id.clone();
        {
            let mut guard = self.working.write();
            guard.push_back(entry);
        }
        self.events.emit("memory:working:add", serde_json::json!({"id": id}));

        let over_limit = {
            let guard = self.working.read();
            Self::working_tokens(&guard) > self.config.working_token_limit
        };
        if over_limit {
            let len = self.working.read().len();
            let n = (len as f64 * self.config.eviction_ratio).ceil() as usize;
            if n > 0 {
                self.evict_oldest(n).await?;
            }
        }
        Ok(id)
    }

    /// Evicts the oldest `n` working-memory entries: summarizes them,
    /// appends to the full-history JSONL, indexes into the semantic store.
    /// On any failure, restores the evicted entries and surfaces the error.
    pub async fn evict_oldest(&self, n: usize) -> anyhow::Result<()> {
        let evicted: Vec<MemoryEntry> = {
            let mut guard = self.working.write();
            let take = n.min(guard.len());
            guard.drain(..take).collect()
        };
        if evicted.is_empty() {
            return Ok(());
        }

        match self.evict_pipeline(&evicted).await {
            Ok(()) => {
                self.events
                    .emit("memory:eviction:completed", serde_json::json!({"count": evicted.len()}));
                Ok(())
            }
            Err(err) => {
                let mut guard = self.working.write();
                for entry in evicted.into_iter().rev() {
                    guard.push_front(entry);
                }
                self.events
                    .emit("memory:eviction:failed", serde_json::json!({"error": err.to_string()}));
                Err(err)
            }
        }
    }

    async fn evict_pipeline(&self, evicted: &[MemoryEntry]) -> anyhow::Result<()> {
        self.update_summary(evicted).await?;
        self.append_full_history(evicted)?;
        for entry in evicted {
            if entry.content.len() > 50 {
                self.semantic
                    .add_memory(SemanticMemory {
                        id: entry.id.clone(),
                        content: entry.content.clone(),
                        domain: "episodic".into(),
                        source: self.session_id.clone(),
                        metadata: entry.metadata.clone().unwrap_or(Value::Null),
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Asks the LLM to merge the previous summary with new messages at
    /// temperature 0 for determinism; tolerates transient failures by
    /// keeping the previous summary (spec.md §4.4, §9).
    async fn update_summary(&self, evicted: &[MemoryEntry]) -> anyhow::Result<()> {
        let previous = self.read_summary().unwrap_or_default();
        let new_text: String = evicted
            .iter()
            .map(|e| format!("{:?}: {}", e.role, e.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Merge this previous summary with the new messages into an updated rolling summary.\n\nPrevious summary:\n{previous}\n\nNew messages:\n{new_text}"
        );
        let request = LLMRequest {
            messages: vec![Message::user(prompt)],
            model: ModelConfig {
                model: "summarizer".into(),
                temperature: 0.0,
                max_tokens: Some(1_000),
            },
            tools: None,
        };

        match self.llm.chat(request).await {
            Ok(response) => {
                let path = VfsPath::new(SUMMARY_PATH)?;
                self.vfs.write(&path, response.content.into_bytes())?;
                Ok(())
            }
            Err(_) => Ok(()), // tolerate transient failure; previous summary is preserved
        }
    }

    fn read_summary(&self) -> Option<String> {
        let path = VfsPath::new(SUMMARY_PATH).ok()?;
        let bytes = self.vfs.read(&path).ok()?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn append_full_history(&self, evicted: &[MemoryEntry]) -> anyhow::Result<()> {
        let path = VfsPath::new(FULL_HISTORY_PATH)?;
        let mut existing = self.vfs.read(&path).map(|b| b.to_vec()).unwrap_or_default();
        for entry in evicted {
            let record = serde_json::json!({
                "id": entry.id,
                "role": entry.role,
                "content": entry.content,
                "timestamp": entry.timestamp,
                "sessionId": entry.session_id,
            });
            existing.extend_from_slice(serde_json::to_string(&record)?.as_bytes());
            existing.push(b'\n');
        }
        self.vfs.write(&path, existing)?;
        Ok(())
    }

    /// Prepends the summary if it fits, embeds the query, searches top
    /// `2k`, applies a +0.15 temporal-contiguity boost for results within
    /// 60s of another result, re-sorts, and greedily fills the token
    /// budget (spec.md §4.4 `retrieve`).
    pub async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> anyhow::Result<RetrievalResult> {
        let mut budget = options.max_tokens;
        let summary = if options.include_summary {
            self.read_summary()
        } else {
            None
        };
        if let Some(s) = &summary {
            budget = budget.saturating_sub(estimate_tokens(s));
        }

        if !options.include_episodic {
            return Ok(RetrievalResult { summary, memories: vec![] });
        }

        let vector = self
            .semantic
            .embed(query)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let mut hits = self
            .semantic
            .search_similar(&vector, options.top_k * 2, 0.0)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        apply_temporal_contiguity_boost(&mut hits);
        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        for hit in hits {
            let cost = estimate_tokens(&hit.memory.content);
            if cost > budget {
                continue;
            }
            budget -= cost;
            selected.push(hit);
            if selected.len() >= options.top_k {
                break;
            }
        }

        self.events.emit("memory:retrieve", serde_json::json!({"query": query, "hits": selected.len()}));
        Ok(RetrievalResult { summary, memories: selected })
    }

    /// Detects a task pattern (coding/debugging/planning/research) and, in
    /// addition to a standard retrieve, pulls k=2 summary-free memories per
    /// anticipated information need, merged by content dedup (spec.md §4.4).
    pub async fn anticipatory_retrieve(&self, query: &str) -> anyhow::Result<RetrievalResult> {
        let mut base = self
            .retrieve(
                query,
                &RetrieveOptions {
                    include_summary: true,
                    ..Default::default()
                },
            )
            .await?;

        for need in anticipated_needs(query) {
            let extra = self
                .retrieve(
                    &need,
                    &RetrieveOptions {
                        max_tokens: 500,
                        include_summary: false,
                        include_episodic: true,
                        top_k: 2,
                    },
                )
                .await?;
            for hit in extra.memories {
                if !base.memories.iter().any(|h| h.memory.content == hit.memory.content) {
                    base.memories.push(hit);
                }
            }
        }
        Ok(base)
    }

    /// `exp(-age / (baseHalfLife × accessBoost^accessCount ×
    /// importance))`; skips if below 80% of `maxMemories`, else removes
    /// items under `minRetention` plus enough lowest-retention items to
    /// reach 70% of cap (spec.md §4.4).
    pub async fn adaptive_prune(&self, dry_run: bool) -> anyhow::Result<Vec<String>> {
        let all = self
            .semantic
            .get_all_memories()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        if all.len() < (self.config.max_memories as f64 * self.config.prune_trigger_ratio) as usize {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let mut scored: Vec<(SemanticMemory, f64)> = all
            .into_iter()
            .map(|mem| {
                let age_secs = mem
                    .metadata
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| (now - t.with_timezone(&Utc)).num_milliseconds().max(0) as f64 / 1000.0)
                    .unwrap_or(0.0);
                let access_count = mem
                    .metadata
                    .get("accessCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                let category = ImportanceCategory::classify(false, false, &mem.content);
                let score = retention::retention(
                    age_secs,
                    access_count,
                    category.weight(),
                    self.config.base_half_life_secs,
                    self.config.access_boost,
                );
                (mem, score)
            })
            .collect();

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let target_count = (self.config.max_memories as f64 * self.config.prune_target_ratio) as usize;
        let mut to_remove: Vec<String> = scored
            .iter()
            .filter(|(_, score)| *score < self.config.min_retention)
            .map(|(mem, _)| mem.id.clone())
            .collect();

        let remaining_after = scored.len().saturating_sub(to_remove.len());
        if remaining_after > target_count {
            let need_more = remaining_after - target_count;
            let removed: std::collections::HashSet<&String> = to_remove.iter().collect();
            let mut extra: Vec<String> = scored
                .iter()
                .map(|(mem, _)| mem.id.clone())
                .filter(|id| !removed.contains(id))
                .take(need_more)
                .collect();
            to_remove.append(&mut extra);
        }

        if !dry_run {
            for id in &to_remove {
                self.semantic.delete_memory(id).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            }
        }
        self.events
            .emit("memory:prune:adaptive", serde_json::json!({"removed": to_remove.len(), "dryRun": dry_run}));
        Ok(to_remove)
    }

    pub fn working_len(&self) -> usize {
        self.working.read().len()
    }
}

fn apply_temporal_contiguity_boost(hits: &mut [SimilarityHit]) {
    let timestamps: Vec<Option<DateTime<Utc>>> = hits
        .iter()
        .map(|h| {
            h.memory
                .metadata
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        })
        .collect();

    let mut boosts = vec![0.0f32; hits.len()];
    for i in 0..hits.len() {
        for j in 0..hits.len() {
            if i == j {
                continue;
            }
            if let (Some(a), Some(b)) = (timestamps[i], timestamps[j]) {
                if (a - b).num_seconds().abs() <= 60 {
                    boosts[i] = 0.15;
                    break;
                }
            }
        }
    }
    for (hit, boost) in hits.iter_mut().zip(boosts) {
        hit.similarity += boost;
    }
}

fn anticipated_needs(query: &str) -> Vec<String> {
    let lower = query.to_ascii_lowercase();
    let mut needs = Vec::new();
    if ["implement", "write code", "function", "class", "refactor"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        needs.push("related function signatures and call sites".to_string());
    }
    if ["bug", "error", "fix", "debug", "crash", "failing"].iter().any(|kw| lower.contains(kw)) {
        needs.push("recent error messages and stack traces".to_string());
    }
    if ["plan", "design", "approach", "architecture"].iter().any(|kw| lower.contains(kw)) {
        needs.push("prior planning decisions".to_string());
    }
    if ["research", "investigate", "find out", "explore"].iter().any(|kw| lower.contains(kw)) {
        needs.push("previously gathered research notes".to_string());
    }
    needs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LLMError, LLMResponse};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct StubLLM;
    #[async_trait]
    impl LLMProvider for StubLLM {
        fn name(&self) -> &str {
            "stub"
        }
        fn supported_models(&self) -> Vec<String> {
            vec!["stub".into()]
        }
        async fn chat(&self, _request: LLMRequest) -> Result<LLMResponse, LLMError> {
            Ok(LLMResponse {
                content: "merged summary".into(),
                tool_calls: None,
                usage: None,
            })
        }
    }

    #[derive(Default)]
    struct StubSemanticStore {
        memories: StdMutex<Vec<SemanticMemory>>,
    }

    #[async_trait]
    impl SemanticStore for StubSemanticStore {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::embedding::EmbeddingError> {
            Ok(vec![0.0; 4])
        }
        async fn search_similar(&self, _vector: &[f32], k: usize, _min_score: f32) -> Result<Vec<SimilarityHit>, crate::embedding::EmbeddingError> {
            let guard = self.memories.lock().unwrap();
            Ok(guard
                .iter()
                .take(k)
                .cloned()
                .map(|memory| SimilarityHit { memory, similarity: 0.5 })
                .collect())
        }
        async fn add_memory(&self, memory: SemanticMemory) -> Result<(), crate::embedding::EmbeddingError> {
            self.memories.lock().unwrap().push(memory);
            Ok(())
        }
        async fn delete_memory(&self, id: &str) -> Result<(), crate::embedding::EmbeddingError> {
            self.memories.lock().unwrap().retain(|m| m.id != id);
            Ok(())
        }
        async fn get_all_memories(&self) -> Result<Vec<SemanticMemory>, crate::embedding::EmbeddingError> {
            Ok(self.memories.lock().unwrap().clone())
        }
        async fn get_stats(&self) -> Result<crate::embedding::SemanticStoreStats, crate::embedding::EmbeddingError> {
            Ok(crate::embedding::SemanticStoreStats::default())
        }
    }

    fn manager() -> MemoryManager {
        MemoryManager::new(
            Arc::new(Vfs::new()),
            Arc::new(StubSemanticStore::default()),
            Arc::new(StubLLM),
            MemoryConfig::default(),
            Arc::new(EventBus::new()),
            "session-1",
        )
    }

    #[tokio::test]
    async fn add_returns_unique_ids_and_grows_working_memory() {
        let mgr = manager();
        let id1 = mgr.add(&Message::user("hi")).await.unwrap();
        let id2 = mgr.add(&Message::user("there")).await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(mgr.working_len(), 2);
    }

    #[tokio::test]
    async fn eviction_writes_summary_and_full_history() {
        let mgr = manager();
        for i in 0..5 {
            mgr.add(&Message::user(format!("message number {i}"))).await.unwrap();
        }
        mgr.evict_oldest(3).await.unwrap();
        assert_eq!(mgr.working_len(), 2);
        let summary = mgr.read_summary().unwrap();
        assert_eq!(summary, "merged summary");
    }

    #[tokio::test]
    async fn anticipatory_retrieve_does_not_crash_on_coding_query() {
        let mgr = manager();
        mgr.add(&Message::user("let's implement a function")).await.unwrap();
        mgr.evict_oldest(1).await.unwrap();
        let result = mgr.anticipatory_retrieve("please implement a new function").await.unwrap();
        assert!(result.summary.is_some());
    }

    #[test]
    fn needs_detection_matches_coding_and_debugging_keywords() {
        assert!(!anticipated_needs("let's implement a function").is_empty());
        assert!(!anticipated_needs("why is this crashing").is_empty());
    }
}
