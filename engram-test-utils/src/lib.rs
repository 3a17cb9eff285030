//! Engram Test Utilities
//!
//! Centralized test infrastructure for the workspace: entity fixtures, a
//! deterministic mock embedding provider, and a mock summarizer. Kept out of
//! the production dependency graph; every other crate pulls this in as a
//! dev-dependency only.

use async_trait::async_trait;
use chrono::Utc;
use engram_core::{
    Actor, ActorKind, AgentId, Channel, Chunk, ChunkId, CompressionLevel, DecisionContent,
    DecisionScope, DraftContent, EmbeddingProvider, EngramResult, Event, EventContent, EventId,
    Handoff, HandoffId, MemoryIdType, Sensitivity, SessionId, SummarizationProvider, TenantId,
    compute_content_hash, estimate_tokens, normalize_terms, simhash64,
    truncate_to_token_budget,
};

// Re-export the in-memory store for convenience
pub use engram_storage::MemoryStore;

// ============================================================================
// FIXTURES
// ============================================================================

/// A valid tenant key for tests.
pub fn tenant(raw: &str) -> TenantId {
    TenantId::new(raw).expect("test tenant id must be valid")
}

/// A valid session key for tests.
pub fn session(raw: &str) -> SessionId {
    SessionId::new(raw).expect("test session id must be valid")
}

/// A valid agent key for tests.
pub fn agent(raw: &str) -> AgentId {
    AgentId::new(raw).expect("test agent id must be valid")
}

/// A message event with derived fields filled in consistently.
pub fn event_fixture(tenant_id: &str, session_id: &str, text: &str) -> Event {
    let content = EventContent::Message {
        text: text.to_string(),
    };
    Event {
        event_id: EventId::generate(),
        tenant_id: tenant(tenant_id),
        session_id: session(session_id),
        agent_id: agent("A"),
        channel: Channel::Private,
        actor: Actor {
            kind: ActorKind::Human,
            id: "user".to_string(),
        },
        kind: content.kind(),
        sensitivity: Sensitivity::None,
        tags: vec![],
        content,
        refs: vec![],
        content_hash: compute_content_hash(text.as_bytes()),
        created_at: Utc::now(),
    }
}

/// A single active chunk with derived fields consistent with `text`.
pub fn chunk_fixture(tenant_id: &str, session_id: &str, text: &str) -> Chunk {
    let event = event_fixture(tenant_id, session_id, text);
    chunk_for_event(&event, text)
}

/// A chunk belonging to an existing event.
pub fn chunk_for_event(event: &Event, text: &str) -> Chunk {
    Chunk {
        chunk_id: ChunkId::generate(),
        event_id: event.event_id,
        tenant_id: event.tenant_id.clone(),
        session_id: event.session_id.clone(),
        agent_id: event.agent_id.clone(),
        channel: event.channel,
        kind: event.kind,
        sensitivity: event.sensitivity,
        tags: event.tags.clone(),
        seq: 0,
        text: text.to_string(),
        token_est: estimate_tokens(text),
        importance: 0.25,
        pinned: false,
        active: true,
        terms: normalize_terms(text),
        content_hash: compute_content_hash(text.as_bytes()),
        simhash: simhash64(text),
        embedding: None,
        created_at: event.created_at,
    }
}

/// A full-tier handoff; pass a non-empty `becoming` to join the identity
/// thread.
pub fn handoff_fixture(tenant_id: &str, becoming: Option<&str>) -> Handoff {
    Handoff {
        handoff_id: HandoffId::generate(),
        tenant_id: tenant(tenant_id),
        session_id: session("s1"),
        agent_id: agent("A"),
        experienced: "implemented the packer".to_string(),
        noticed: "dedupe matters more than scoring".to_string(),
        learned: "cap the candidate pool early".to_string(),
        story: "a long but productive session".to_string(),
        becoming: becoming.map(str::to_string),
        remember: "re-check section budgets".to_string(),
        significance: 0.5,
        tags: vec![],
        with_whom: vec![],
        compression_level: CompressionLevel::Full,
        summary: None,
        quick_ref: None,
        refs: vec![],
        created_at: Utc::now(),
        consolidated_at: None,
    }
}

/// A decision draft payload.
pub fn decision_draft(text: &str, supersedes: Option<engram_core::DecisionId>) -> DraftContent {
    DraftContent::Decision(DecisionContent {
        decision: text.to_string(),
        rationale: "test rationale".to_string(),
        constraints: vec![],
        alternatives: vec![],
        consequences: vec![],
        scope: DecisionScope::Project,
        supersedes,
    })
}

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// Mock embedding provider: a signed term-hashing embedding. Each
/// normalised term's digest picks one slot and a sign, accumulated and then
/// L2-normalised, so texts sharing terms land near each other and
/// all-stopword text maps to the zero vector. Deterministic, which is all
/// the retrieval tests need.
#[derive(Debug, Clone)]
pub struct MockEmbeddingProvider {
    model_id: String,
    dimensions: usize,
}

impl MockEmbeddingProvider {
    pub fn new(model_id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimensions,
        }
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        let mut data = vec![0.0f32; self.dimensions];
        for term in normalize_terms(text) {
            let digest = compute_content_hash(term.as_bytes());
            let slot = u16::from_be_bytes([digest[0], digest[1]]) as usize % self.dimensions;
            let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
            data[slot] += sign;
        }
        let norm: f32 = data.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut data {
                *x /= norm;
            }
        }
        data
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new("mock-embedder", 64)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> EngramResult<Vec<f32>> {
        Ok(self.generate(text))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Mock summarizer: extractive truncation to the token budget.
#[derive(Debug, Clone, Default)]
pub struct MockSummarizationProvider;

#[async_trait]
impl SummarizationProvider for MockSummarizationProvider {
    async fn summarize(&self, text: &str, max_tokens: i32) -> EngramResult<String> {
        Ok(truncate_to_token_budget(text, max_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::cosine_similarity;

    #[test]
    fn test_chunk_fixture_is_consistent() {
        let chunk = chunk_fixture("t1", "s1", "budget planning for retrieval");
        assert!(chunk.token_est > 0);
        assert!(!chunk.terms.is_empty());
        assert_eq!(chunk.simhash, simhash64("budget planning for retrieval"));
    }

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let provider = MockEmbeddingProvider::default();
        let a = provider.embed("budget").await.unwrap();
        let b = provider.embed("budget").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), provider.dimensions());
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_mock_embedder_tracks_term_overlap() {
        let provider = MockEmbeddingProvider::default();
        let a = provider.embed("budget planning for retrieval").await.unwrap();
        let b = provider.embed("retrieval budget planning notes").await.unwrap();
        let c = provider.embed("postgres connection pooling").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));

        // Stopword-only text has no terms and embeds to zero.
        let zero = provider.embed("the and of").await.unwrap();
        assert!(zero.iter().all(|x| *x == 0.0));
    }
}
