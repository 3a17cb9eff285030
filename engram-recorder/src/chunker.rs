//! Chunk derivation and the importance heuristic
//!
//! One chunk per event by default; long excerpts split along paragraph/line
//! boundaries so every chunk's token estimate stays inside the configured
//! window. Derivation is deterministic given the event and tokenizer version,
//! which is what makes the chunks table rebuildable from events.

use engram_core::{
    Chunk, ChunkId, Event, EventKind, IngestSettings, MemoryIdType, compute_content_hash,
    estimate_tokens, normalize_terms, simhash64, split_to_token_windows,
};

/// Tags that boost importance when present on an event.
const BOOST_TAGS: &[&str] = &["important", "critical", "decision", "pinned", "goal"];

const TAG_BOOST: f32 = 0.1;
const TAG_BOOST_CAP: f32 = 0.2;
const PIN_BOOST: f32 = 0.2;

/// Importance heuristic: kind weight + tag boosts + pinning, clamped to [0, 1].
pub fn importance_for(kind: EventKind, tags: &[String], pinned: bool) -> f32 {
    let tag_boost = (tags
        .iter()
        .filter(|t| BOOST_TAGS.contains(&t.as_str()))
        .count() as f32
        * TAG_BOOST)
        .min(TAG_BOOST_CAP);
    let pin_boost = if pinned { PIN_BOOST } else { 0.0 };
    (kind.importance_weight() + tag_boost + pin_boost).clamp(0.0, 1.0)
}

/// Derive the chunks for an event.
///
/// Re-deriving from the same event text yields the same chunk texts, token
/// estimates and hashes; only the minted ids differ per insert.
pub fn derive_chunks(event: &Event, settings: &IngestSettings, pinned: bool) -> Vec<Chunk> {
    let text = event.content.excerpt_text();
    let windows =
        split_to_token_windows(&text, settings.chunk_min_tokens, settings.chunk_max_tokens);
    let importance = importance_for(event.kind, &event.tags, pinned);

    windows
        .into_iter()
        .enumerate()
        .map(|(seq, window)| Chunk {
            chunk_id: ChunkId::generate(),
            event_id: event.event_id,
            tenant_id: event.tenant_id.clone(),
            session_id: event.session_id.clone(),
            agent_id: event.agent_id.clone(),
            channel: event.channel,
            kind: event.kind,
            sensitivity: event.sensitivity,
            tags: event.tags.clone(),
            seq: seq as i32,
            token_est: estimate_tokens(&window),
            importance,
            pinned,
            active: true,
            terms: normalize_terms(&window),
            content_hash: compute_content_hash(window.as_bytes()),
            simhash: simhash64(&window),
            embedding: None,
            created_at: event.created_at,
            text: window,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_core::{
        Actor, ActorKind, AgentId, Channel, EventContent, EventId, Sensitivity, SessionId,
        TenantId,
    };

    fn make_event(text: &str, kind_tags: (&[&str], bool)) -> Event {
        let content = EventContent::Message {
            text: text.to_string(),
        };
        Event {
            event_id: EventId::generate(),
            tenant_id: TenantId::new("t1").unwrap(),
            session_id: SessionId::new("s1").unwrap(),
            agent_id: AgentId::new("A").unwrap(),
            channel: Channel::Private,
            actor: Actor {
                kind: ActorKind::Human,
                id: "user".to_string(),
            },
            kind: content.kind(),
            sensitivity: Sensitivity::None,
            tags: kind_tags.0.iter().map(|s| s.to_string()).collect(),
            content,
            refs: vec![],
            content_hash: compute_content_hash(text.as_bytes()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_one_chunk_per_short_event() {
        let event = make_event("what is this project for?", (&[], false));
        let chunks = derive_chunks(&event, &IngestSettings::default(), false);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert!(chunks[0].token_est > 0);
        assert_eq!(chunks[0].tenant_id, event.tenant_id);
        assert_eq!(chunks[0].event_id, event.event_id);
    }

    #[test]
    fn test_long_event_splits_within_window() {
        let paragraph = "tokens ".repeat(700); // ~700 tokens per paragraph
        let text = format!("{}\n\n{}\n\n{}", paragraph, paragraph, paragraph);
        let event = make_event(&text, (&[], false));
        let settings = IngestSettings::default();
        let chunks = derive_chunks(&event, &settings, false);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as i32);
            assert!(chunk.token_est > 0);
            assert!(chunk.token_est <= settings.chunk_max_tokens);
        }
    }

    #[test]
    fn test_rederivation_reproduces_text_and_estimates() {
        let text = "first paragraph about retrieval.\n\nsecond paragraph about budgets.";
        let event = make_event(text, (&[], false));
        let settings = IngestSettings::default();
        let a = derive_chunks(&event, &settings, false);
        let b = derive_chunks(&event, &settings, false);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.token_est, y.token_est);
            assert_eq!(x.content_hash, y.content_hash);
            assert_eq!(x.simhash, y.simhash);
        }
    }

    #[test]
    fn test_importance_ranking() {
        let msg = importance_for(EventKind::Message, &[], false);
        let tool = importance_for(EventKind::ToolResult, &[], false);
        let task = importance_for(EventKind::TaskUpdate, &[], false);
        let decision = importance_for(EventKind::Decision, &[], false);
        assert!(msg < tool && tool < task && task < decision);
    }

    #[test]
    fn test_importance_boosts_clamped() {
        let boosted = importance_for(
            EventKind::Decision,
            &[
                "important".to_string(),
                "critical".to_string(),
                "goal".to_string(),
            ],
            true,
        );
        assert!(boosted <= 1.0);
        let base = importance_for(EventKind::Decision, &[], false);
        assert!(boosted > base);
        // Unknown tags do not boost.
        let unboosted = importance_for(EventKind::Decision, &["misc".to_string()], false);
        assert!((unboosted - base).abs() < f32::EPSILON);
    }
}
