//! Deterministic candidate scoring
//!
//! `score = alpha * lexical + beta * recency + gamma * importance`, with an
//! optional Reciprocal Rank Fusion pass when a vector rank list exists.
//! Ties never resolve randomly: the same inputs produce identical output
//! order on every backend.

use engram_core::{Chunk, ChunkId, EventKind, ScoringSettings, Timestamp};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Boost added when a chunk's tags intersect the request's tag filters.
const TAG_MATCH_BOOST: f32 = 0.1;
/// Boost for chunks derived from decision events.
const DECISION_REF_BOOST: f32 = 0.1;

/// Where a candidate came from (reported in provenance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Pinned,
    SessionRecent,
    TagHead,
    Lexical,
    RecencyTail,
}

/// A candidate with its score components.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub source: CandidateSource,
    pub score: f64,
    pub lexical: f64,
    pub recency: f64,
    pub importance: f64,
}

/// Lexical rank of a chunk against the normalised query terms, in [0, 1].
///
/// Coverage of distinct query terms, weighted slightly by in-chunk frequency
/// (ts_rank-style saturation).
pub fn lexical_score(chunk_terms: &[String], query_terms: &[String]) -> f64 {
    if query_terms.is_empty() || chunk_terms.is_empty() {
        return 0.0;
    }
    let distinct_query: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    let mut freq: HashMap<&str, u32> = HashMap::new();
    for term in chunk_terms {
        if distinct_query.contains(term.as_str()) {
            *freq.entry(term.as_str()).or_insert(0) += 1;
        }
    }
    if freq.is_empty() {
        return 0.0;
    }
    let coverage = freq.len() as f64 / distinct_query.len() as f64;
    // Frequency saturates quickly so repetition cannot dominate coverage.
    let tf: f64 = freq
        .values()
        .map(|&n| 1.0 - 1.0 / (1.0 + n as f64))
        .sum::<f64>()
        / distinct_query.len() as f64;
    (0.8 * coverage + 0.2 * tf).clamp(0.0, 1.0)
}

/// Exponential recency decay: `exp(-age_seconds / tau)`.
pub fn recency_score(created_at: Timestamp, now: Timestamp, tau_seconds: f64) -> f64 {
    let age = (now - created_at).num_seconds().max(0) as f64;
    (-age / tau_seconds).exp()
}

/// Stored importance plus tag and decision boosts, clamped to [0, 1].
pub fn importance_score(chunk: &Chunk, tag_filters: &[String]) -> f64 {
    let mut importance = chunk.importance;
    if !tag_filters.is_empty() && chunk.tags.iter().any(|t| tag_filters.contains(t)) {
        importance += TAG_MATCH_BOOST;
    }
    if chunk.kind == EventKind::Decision {
        importance += DECISION_REF_BOOST;
    }
    importance.clamp(0.0, 1.0) as f64
}

/// Score one candidate.
pub fn score_chunk(
    chunk: Chunk,
    source: CandidateSource,
    query_terms: &[String],
    tag_filters: &[String],
    now: Timestamp,
    settings: &ScoringSettings,
) -> ScoredChunk {
    let lexical = lexical_score(&chunk.terms, query_terms);
    let recency = recency_score(chunk.created_at, now, settings.recency_tau_seconds);
    let importance = importance_score(&chunk, tag_filters);
    let score =
        settings.alpha * lexical + settings.beta * recency + settings.gamma * importance;
    ScoredChunk {
        chunk,
        source,
        score,
        lexical,
        recency,
        importance,
    }
}

/// The deterministic tie-break: higher importance, then more recent, then
/// smaller token estimate, then smaller chunk id.
fn tie_break(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.importance
        .total_cmp(&a.importance)
        .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
        .then_with(|| a.chunk.token_est.cmp(&b.chunk.token_est))
        .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
}

/// Sort candidates by descending score with the deterministic tie-break.
pub fn rank(candidates: &mut [ScoredChunk]) {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| tie_break(a, b)));
}

/// Fuse the base ranking with a vector rank list via Reciprocal Rank Fusion.
///
/// `score_rrf(x) = sum over lists of 1 / (k + rank_list(x))`; a chunk absent
/// from the vector list contributes only its base rank. The fused ordering
/// replaces the ordering, not the scores: component scores stay reported as
/// computed.
pub fn fuse_with_vector_ranks(
    candidates: &mut Vec<ScoredChunk>,
    vector_ranks: &[(ChunkId, f32)],
    k: f64,
) {
    if vector_ranks.is_empty() {
        return;
    }
    let vector_rank_of: HashMap<ChunkId, usize> = vector_ranks
        .iter()
        .enumerate()
        .map(|(rank, (id, _))| (*id, rank + 1))
        .collect();

    // Base ranks come from the already-sorted candidate order.
    let mut fused: Vec<(f64, ScoredChunk)> = std::mem::take(candidates)
        .into_iter()
        .enumerate()
        .map(|(i, sc)| {
            let mut rrf = 1.0 / (k + (i + 1) as f64);
            if let Some(&vrank) = vector_rank_of.get(&sc.chunk.chunk_id) {
                rrf += 1.0 / (k + vrank as f64);
            }
            (rrf, sc)
        })
        .collect();
    fused.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| tie_break(&a.1, &b.1)));
    *candidates = fused.into_iter().map(|(_, sc)| sc).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use engram_core::MemoryIdType;
    use engram_test_utils::chunk_fixture;

    #[test]
    fn test_lexical_score_bounds() {
        let chunk_terms = vec!["project".to_string(), "budget".to_string()];
        let query = vec!["project".to_string(), "budget".to_string()];
        let full = lexical_score(&chunk_terms, &query);
        assert!(full > 0.5 && full <= 1.0);

        let partial = lexical_score(&chunk_terms, &["project".to_string(), "xyz".to_string()]);
        assert!(partial < full);
        assert_eq!(lexical_score(&chunk_terms, &[]), 0.0);
        assert_eq!(lexical_score(&[], &query), 0.0);
    }

    #[test]
    fn test_repetition_saturates() {
        let few = vec!["budget".to_string(); 2];
        let many = vec!["budget".to_string(); 50];
        let query = vec!["budget".to_string()];
        let a = lexical_score(&few, &query);
        let b = lexical_score(&many, &query);
        assert!(b >= a);
        assert!(b - a < 0.1, "frequency must saturate, got {} vs {}", a, b);
    }

    #[test]
    fn test_recency_decay() {
        let now = Utc::now();
        let tau = 7.0 * 24.0 * 3600.0;
        let fresh = recency_score(now, now, tau);
        let week_old = recency_score(now - Duration::days(7), now, tau);
        let month_old = recency_score(now - Duration::days(30), now, tau);
        assert!((fresh - 1.0).abs() < 1e-9);
        assert!((week_old - (-1.0f64).exp()).abs() < 1e-3);
        assert!(month_old < week_old);
        // Future timestamps clamp to zero age.
        assert!((recency_score(now + Duration::days(1), now, tau) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_is_deterministic_on_ties() {
        let now = Utc::now();
        let settings = ScoringSettings::default();
        let mut a = chunk_fixture("t1", "s1", "same text");
        let mut b = chunk_fixture("t1", "s1", "same text");
        a.created_at = now;
        b.created_at = now;
        a.importance = 0.5;
        b.importance = 0.5;

        let make = |c: &Chunk| {
            score_chunk(
                c.clone(),
                CandidateSource::Lexical,
                &["same".to_string()],
                &[],
                now,
                &settings,
            )
        };
        let mut run1 = vec![make(&a), make(&b)];
        let mut run2 = vec![make(&b), make(&a)];
        rank(&mut run1);
        rank(&mut run2);
        let ids1: Vec<ChunkId> = run1.iter().map(|s| s.chunk.chunk_id).collect();
        let ids2: Vec<ChunkId> = run2.iter().map(|s| s.chunk.chunk_id).collect();
        assert_eq!(ids1, ids2);
        // Smaller chunk id wins the final tie-break.
        assert!(ids1[0] < ids1[1]);
    }

    #[test]
    fn test_rrf_promotes_vector_hits() {
        let now = Utc::now();
        let settings = ScoringSettings::default();
        let mut low = chunk_fixture("t1", "s1", "semantic match with no shared words");
        let mut high = chunk_fixture("t1", "s1", "budget budget budget");
        low.importance = 0.2;
        high.importance = 0.2;
        low.created_at = now;
        high.created_at = now;

        let mut candidates = vec![
            score_chunk(
                high.clone(),
                CandidateSource::Lexical,
                &["budget".to_string()],
                &[],
                now,
                &settings,
            ),
            score_chunk(
                low.clone(),
                CandidateSource::RecencyTail,
                &["budget".to_string()],
                &[],
                now,
                &settings,
            ),
        ];
        rank(&mut candidates);
        assert_eq!(candidates[0].chunk.chunk_id, high.chunk_id);

        // The vector list strongly prefers the semantic match; fusion should
        // lift it while keeping both entries.
        fuse_with_vector_ranks(&mut candidates, &[(low.chunk_id, 0.99)], 1.0);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].chunk.chunk_id, low.chunk_id);
    }

    #[test]
    fn test_rrf_noop_without_vector_list() {
        let now = Utc::now();
        let settings = ScoringSettings::default();
        let chunk = chunk_fixture("t1", "s1", "budget");
        let mut candidates = vec![score_chunk(
            chunk,
            CandidateSource::Lexical,
            &["budget".to_string()],
            &[],
            now,
            &settings,
        )];
        let before: Vec<ChunkId> = candidates.iter().map(|c| c.chunk.chunk_id).collect();
        fuse_with_vector_ranks(&mut candidates, &[], 60.0);
        let after: Vec<ChunkId> = candidates.iter().map(|c| c.chunk.chunk_id).collect();
        assert_eq!(before, after);
    }
}
