//! Engram Retrieval - bounded candidate generation and deterministic scoring
//!
//! `retrieve` produces at most `retrieved_chunks_max` scored chunk refs from
//! a candidate pool of at most `candidate_pool_max`. Privacy suppression runs
//! before scoring; an embedding provider, when configured, adds a cosine rank
//! list fused in by Reciprocal Rank Fusion. Lexical scoring is the baseline
//! and works without embeddings.

mod candidates;
mod scoring;

pub use candidates::{Candidate, CandidateRequest, gather};
pub use scoring::{
    CandidateSource, ScoredChunk, fuse_with_vector_ranks, importance_score, lexical_score,
    rank, recency_score, score_chunk,
};

use engram_core::{
    AgentId, Channel, ChunkId, EmbeddingProvider, EngramConfig, EngramResult, Intent,
    SessionId, TenantId, Timestamp, unique_terms,
};
use engram_storage::Store;
use std::sync::Arc;

// ============================================================================
// QUERY AND OUTCOME TYPES
// ============================================================================

/// A retrieval request.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub query_text: String,
    pub intent: Intent,
    pub tag_filters: Vec<String>,
    /// Time-window hint; candidates older than this are dropped.
    pub since: Option<Timestamp>,
    /// Per-request overrides, clamped to the configured caps.
    pub candidate_pool_max: Option<usize>,
    pub retrieved_chunks_max: Option<usize>,
}

impl RetrievalQuery {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        agent_id: AgentId,
        channel: Channel,
        query_text: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            session_id,
            agent_id,
            channel,
            query_text: query_text.into(),
            intent: Intent::default(),
            tag_filters: Vec::new(),
            since: None,
            candidate_pool_max: None,
            retrieved_chunks_max: None,
        }
    }
}

/// The scored result set plus everything provenance needs.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub scored: Vec<ScoredChunk>,
    pub query_terms: Vec<String>,
    pub candidate_pool_size: usize,
    /// Chunk ids dropped by channel sensitivity or capsule audience.
    pub suppressed: Vec<ChunkId>,
    pub semantic_used: bool,
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// Stateless retrieval engine; holds only configuration.
#[derive(Clone)]
pub struct Retriever {
    config: Arc<EngramConfig>,
}

impl Retriever {
    pub fn new(config: Arc<EngramConfig>) -> Self {
        Self { config }
    }

    /// Run one retrieval pass.
    pub async fn retrieve(
        &self,
        store: &dyn Store,
        embedder: Option<&dyn EmbeddingProvider>,
        query: &RetrievalQuery,
        now: Timestamp,
    ) -> EngramResult<RetrievalOutcome> {
        let settings = &self.config.retrieval;
        let pool_max = query
            .candidate_pool_max
            .unwrap_or(settings.candidate_pool_max)
            .min(settings.candidate_pool_max);
        let result_max = query
            .retrieved_chunks_max
            .unwrap_or(settings.retrieved_chunks_max)
            .min(settings.retrieved_chunks_max);

        let query_terms = unique_terms(&query.query_text);

        // Candidate union, capped.
        let req = CandidateRequest {
            tenant: &query.tenant_id,
            session: &query.session_id,
            query_terms: &query_terms,
            tag_filters: &query.tag_filters,
            pool_max,
        };
        let mut pool = gather(store, settings, &req).await?;
        let candidate_pool_size = pool.len();

        if let Some(since) = query.since {
            pool.retain(|c| c.chunk.created_at >= since);
        }

        // Privacy suppression before scoring: channel sensitivity matrix,
        // preferences view, capsule audience.
        let restricted = store
            .restricted_chunk_ids(&query.tenant_id, &query.agent_id)
            .await?;
        let channels = &self.config.privacy.channels;
        let mut suppressed = Vec::new();
        pool.retain(|c| {
            let allowed = channels.allows(query.channel, c.chunk.sensitivity)
                && !(query.channel.suppresses_preferences()
                    && c.chunk.tags.iter().any(|t| t == "preferences"))
                && !restricted.contains(&c.chunk.chunk_id);
            if !allowed {
                suppressed.push(c.chunk.chunk_id);
            }
            allowed
        });

        // Deterministic scoring.
        let mut scored: Vec<ScoredChunk> = pool
            .into_iter()
            .map(|c| {
                score_chunk(
                    c.chunk,
                    c.source,
                    &query_terms,
                    &query.tag_filters,
                    now,
                    &self.config.scoring,
                )
            })
            .collect();
        rank(&mut scored);

        // Optional semantic supplement: cosine rank list fused by RRF.
        // An embedding failure degrades to lexical-only; it never fails the
        // request.
        let mut semantic_used = false;
        if let Some(embedder) = embedder {
            if !query.query_text.trim().is_empty() {
                match embedder.embed(&query.query_text).await {
                    Ok(embedding) => {
                        let vector_ranks = store
                            .search_chunks_vector(&query.tenant_id, &embedding, result_max)
                            .await?;
                        if !vector_ranks.is_empty() {
                            fuse_with_vector_ranks(
                                &mut scored,
                                &vector_ranks,
                                self.config.scoring.rrf_k,
                            );
                            semantic_used = true;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Embedding failed; lexical-only pass");
                    }
                }
            }
        }

        scored.truncate(result_max);
        tracing::debug!(
            tenant_id = %query.tenant_id,
            pool = candidate_pool_size,
            results = scored.len(),
            suppressed = suppressed.len(),
            semantic = semantic_used,
            "Retrieval pass complete"
        );

        Ok(RetrievalOutcome {
            scored,
            query_terms,
            candidate_pool_size,
            suppressed,
            semantic_used,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_core::Sensitivity;
    use engram_storage::{EventBundle, MemoryStore, Store};
    use engram_test_utils::{agent, chunk_for_event, event_fixture, session, tenant};

    async fn seed(store: &MemoryStore, text: &str) -> ChunkId {
        seed_with(store, text, |_| {}).await
    }

    async fn seed_with(
        store: &MemoryStore,
        text: &str,
        mutate: impl FnOnce(&mut engram_core::Chunk),
    ) -> ChunkId {
        let event = event_fixture("t1", "s1", text);
        let mut chunk = chunk_for_event(&event, text);
        mutate(&mut chunk);
        let id = chunk.chunk_id;
        store
            .insert_event_bundle(&EventBundle {
                event,
                chunks: vec![chunk],
                decision: None,
                supersedes: None,
                task: None,
                artifact: None,
            })
            .await
            .unwrap();
        id
    }

    fn query(text: &str) -> RetrievalQuery {
        RetrievalQuery::new(
            tenant("t1"),
            session("s1"),
            agent("A"),
            engram_core::Channel::Private,
            text,
        )
    }

    fn retriever() -> Retriever {
        Retriever::new(Arc::new(EngramConfig::default()))
    }

    #[tokio::test]
    async fn test_lexical_baseline_finds_matches() {
        let store = MemoryStore::new();
        let hit = seed(&store, "the project budget is generous this quarter").await;
        seed(&store, "unrelated discussion about pooling").await;

        let outcome = retriever()
            .retrieve(&store, None, &query("what is the budget?"), Utc::now())
            .await
            .unwrap();
        assert!(!outcome.semantic_used);
        assert_eq!(outcome.query_terms, vec!["budget"]);
        assert_eq!(outcome.scored[0].chunk.chunk_id, hit);
        assert!(outcome.scored[0].lexical > 0.0);
    }

    #[tokio::test]
    async fn test_caps_hold() {
        let store = MemoryStore::new();
        for i in 0..50 {
            seed(&store, &format!("budget note {}", i)).await;
        }
        let mut q = query("budget");
        q.candidate_pool_max = Some(20);
        q.retrieved_chunks_max = Some(5);
        let outcome = retriever()
            .retrieve(&store, None, &q, Utc::now())
            .await
            .unwrap();
        assert!(outcome.candidate_pool_size <= 20);
        assert!(outcome.scored.len() <= 5);
    }

    #[tokio::test]
    async fn test_request_cannot_exceed_configured_caps() {
        let store = MemoryStore::new();
        seed(&store, "budget").await;
        let mut q = query("budget");
        q.candidate_pool_max = Some(1_000_000);
        q.retrieved_chunks_max = Some(1_000_000);
        let outcome = retriever()
            .retrieve(&store, None, &q, Utc::now())
            .await
            .unwrap();
        let settings = EngramConfig::default().retrieval;
        assert!(outcome.candidate_pool_size <= settings.candidate_pool_max);
        assert!(outcome.scored.len() <= settings.retrieved_chunks_max);
    }

    #[tokio::test]
    async fn test_privacy_suppression_before_scoring() {
        let store = MemoryStore::new();
        let secret_chunk = seed_with(&store, "the password policy rotates keys", |c| {
            c.sensitivity = Sensitivity::High;
        })
        .await;
        seed(&store, "the rotation policy is documented").await;

        let mut q = query("what is the rotation policy?");
        q.channel = engram_core::Channel::Public;
        let outcome = retriever()
            .retrieve(&store, None, &q, Utc::now())
            .await
            .unwrap();
        assert!(outcome.suppressed.contains(&secret_chunk));
        assert!(outcome
            .scored
            .iter()
            .all(|s| s.chunk.chunk_id != secret_chunk));
    }

    #[tokio::test]
    async fn test_preferences_suppressed_on_agent_channel() {
        let store = MemoryStore::new();
        let pref = seed_with(&store, "user prefers terse answers", |c| {
            c.tags = vec!["preferences".to_string()];
        })
        .await;

        let mut q = query("user prefers");
        q.channel = engram_core::Channel::Agent;
        let outcome = retriever()
            .retrieve(&store, None, &q, Utc::now())
            .await
            .unwrap();
        assert!(outcome.suppressed.contains(&pref));

        let mut q = query("user prefers");
        q.channel = engram_core::Channel::Private;
        let outcome = retriever()
            .retrieve(&store, None, &q, Utc::now())
            .await
            .unwrap();
        assert!(outcome.scored.iter().any(|s| s.chunk.chunk_id == pref));
    }

    #[tokio::test]
    async fn test_determinism_identical_runs() {
        let store = MemoryStore::new();
        for i in 0..20 {
            seed(&store, &format!("budget planning item {}", i)).await;
        }
        let now = Utc::now();
        let q = query("budget planning");
        let r = retriever();
        let a = r.retrieve(&store, None, &q, now).await.unwrap();
        let b = r.retrieve(&store, None, &q, now).await.unwrap();
        let ids_a: Vec<ChunkId> = a.scored.iter().map(|s| s.chunk.chunk_id).collect();
        let ids_b: Vec<ChunkId> = b.scored.iter().map(|s| s.chunk.chunk_id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn test_semantic_supplements_lexical() {
        let store = MemoryStore::new();
        let semantic_hit = seed(&store, "spending ceiling for the quarter").await;
        seed(&store, "budget budget budget").await;
        // Give every chunk an embedding derived from its text.
        let provider = engram_test_utils::MockEmbeddingProvider::default();
        let t = tenant("t1");
        for chunk in store.list_recent_chunks(&t, 100).await.unwrap() {
            let e = provider.embed(&chunk.text).await.unwrap();
            store
                .update_chunk_embedding(&t, chunk.chunk_id, &e)
                .await
                .unwrap();
        }

        let outcome = retriever()
            .retrieve(&store, Some(&provider), &query("spending ceiling"), Utc::now())
            .await
            .unwrap();
        assert!(outcome.semantic_used);
        assert!(outcome
            .scored
            .iter()
            .any(|s| s.chunk.chunk_id == semantic_hit));
    }
}
