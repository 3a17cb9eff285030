//! Bounded candidate generation
//!
//! The candidate pool is the union of five sources, deduplicated by chunk id
//! with the first source winning. Candidates are admitted in source priority
//! order - pinned, session-recent, tag-head, lexical, recency-tail - and
//! when the union exceeds the pool cap, admission stops wherever the cap
//! lands, so the lowest-priority source reached may be admitted only
//! partially (each source lists best-first - match count or recency - so the
//! cut drops its weakest candidates).

use crate::scoring::CandidateSource;
use engram_core::{Chunk, ChunkId, EngramResult, RetrievalSettings, SessionId, TenantId};
use engram_storage::Store;
use std::collections::HashSet;

/// Inputs for one candidate-generation pass.
pub struct CandidateRequest<'a> {
    pub tenant: &'a TenantId,
    pub session: &'a SessionId,
    pub query_terms: &'a [String],
    pub tag_filters: &'a [String],
    pub pool_max: usize,
}

/// One candidate with its originating source.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    pub source: CandidateSource,
}

/// Gather the candidate union, capped at `pool_max`.
pub async fn gather(
    store: &dyn Store,
    settings: &RetrievalSettings,
    req: &CandidateRequest<'_>,
) -> EngramResult<Vec<Candidate>> {
    let pool_max = req.pool_max.min(settings.candidate_pool_max);

    let pinned = store.list_pinned_chunks(req.tenant, pool_max).await?;
    let session_recent = store
        .list_session_chunks(req.tenant, req.session, settings.hotset_recent_events_max)
        .await?;
    let tag_head = if req.tag_filters.is_empty() {
        Vec::new()
    } else {
        store
            .list_chunks_by_tags(req.tenant, req.tag_filters, pool_max)
            .await?
    };
    let lexical = store
        .search_chunks_lexical(req.tenant, req.query_terms, pool_max)
        .await?;
    let recency_tail = store
        .list_recent_chunks(req.tenant, settings.recency_tail_window)
        .await?;

    let mut seen: HashSet<ChunkId> = HashSet::new();
    let mut pool: Vec<Candidate> = Vec::new();
    let sources = [
        (CandidateSource::Pinned, pinned),
        (CandidateSource::SessionRecent, session_recent),
        (CandidateSource::TagHead, tag_head),
        (CandidateSource::Lexical, lexical),
        (CandidateSource::RecencyTail, recency_tail),
    ];
    for (source, chunks) in sources {
        for chunk in chunks {
            if pool.len() >= pool_max {
                return Ok(pool);
            }
            if seen.insert(chunk.chunk_id) {
                pool.push(Candidate { chunk, source });
            }
        }
    }
    Ok(pool)
}
