//! Identity principle extraction
//!
//! Groups similar `becoming` statements across the identity thread; a group
//! reaching the configured count yields (or reinforces) a SemanticPrinciple.
//! Confidence grows by a bounded increment per reinforcement and decays
//! multiplicatively over idle periods, floored.

use chrono::{Duration, Utc};
use engram_core::{
    ConsolidationSettings, EngramResult, Handoff, HandoffId, MemoryIdType, PrincipleId,
    SemanticPrinciple, TenantId, Timestamp, term_jaccard,
};
use engram_storage::Store;

/// Base confidence of a freshly extracted principle.
const NEW_PRINCIPLE_CONFIDENCE: f32 = 0.3;

/// Outcome of one identity-extraction sweep.
#[derive(Debug, Default)]
pub struct IdentitySweep {
    pub processed: i64,
    pub affected: i64,
    pub failures: Vec<String>,
}

struct BecomingGroup {
    representative: String,
    handoff_ids: Vec<HandoffId>,
}

/// Greedy similarity grouping of `becoming` statements, oldest first so a
/// group's representative is its earliest phrasing. Deterministic for a
/// given thread.
fn group_becomings(thread: &[Handoff], similarity_threshold: f32) -> Vec<BecomingGroup> {
    let mut groups: Vec<BecomingGroup> = Vec::new();
    // list_identity_thread returns newest-first; walk oldest-first.
    for handoff in thread.iter().rev() {
        let Some(becoming) = handoff.becoming.as_deref() else {
            continue;
        };
        if becoming.trim().is_empty() {
            continue;
        }
        match groups
            .iter_mut()
            .find(|g| term_jaccard(&g.representative, becoming) >= similarity_threshold)
        {
            Some(group) => group.handoff_ids.push(handoff.handoff_id),
            None => groups.push(BecomingGroup {
                representative: becoming.to_string(),
                handoff_ids: vec![handoff.handoff_id],
            }),
        }
    }
    groups
}

/// Apply idle decay to a principle; returns the decayed confidence.
pub fn decayed_confidence(
    principle: &SemanticPrinciple,
    settings: &ConsolidationSettings,
    now: Timestamp,
) -> f32 {
    let idle_days = (now - principle.last_reinforced_at).num_days();
    let periods = idle_days / settings.principle_decay_idle_days.max(1);
    if periods <= 0 {
        return principle.confidence;
    }
    let decayed =
        principle.confidence * settings.principle_decay_factor.powi(periods as i32);
    decayed.max(settings.principle_confidence_floor)
}

/// One identity-extraction pass over a tenant.
pub async fn extract_identity(
    store: &dyn Store,
    tenant: &TenantId,
    settings: &ConsolidationSettings,
    now: Timestamp,
) -> EngramResult<IdentitySweep> {
    let mut sweep = IdentitySweep::default();

    let thread = store.list_identity_thread(tenant, 2000).await?;
    sweep.processed = thread.len() as i64;
    let existing = store.list_principles(tenant).await?;

    // Decay idle principles first so reinforcement applies on top.
    for principle in &existing {
        let decayed = decayed_confidence(principle, settings, now);
        if (decayed - principle.confidence).abs() > f32::EPSILON {
            let mut updated = principle.clone();
            updated.confidence = decayed;
            match store.upsert_principle(&updated).await {
                Ok(()) => sweep.affected += 1,
                Err(e) => {
                    tracing::warn!(
                        principle_id = %principle.principle_id,
                        error = %e,
                        "Principle decay update failed"
                    );
                    sweep.failures.push(principle.principle_id.render());
                }
            }
        }
    }

    let groups = group_becomings(&thread, settings.identity_similarity_threshold);
    for group in groups {
        if group.handoff_ids.len() < settings.identity_consolidation_min_count {
            continue;
        }

        // Reinforce a textually similar existing principle, else create one.
        let target = existing.iter().find(|p| {
            term_jaccard(&p.principle, &group.representative)
                >= settings.identity_similarity_threshold
        });
        let principle = match target {
            Some(existing_principle) => {
                let new_sources: Vec<HandoffId> = group
                    .handoff_ids
                    .iter()
                    .filter(|id| !existing_principle.source_handoff_ids.contains(id))
                    .copied()
                    .collect();
                if new_sources.is_empty() {
                    continue;
                }
                let mut updated = existing_principle.clone();
                updated.confidence = (decayed_confidence(existing_principle, settings, now)
                    + settings.principle_reinforcement_increment
                        * new_sources.len() as f32)
                    .min(1.0);
                updated.source_count += new_sources.len() as i32;
                updated.source_handoff_ids.extend(new_sources);
                updated.last_reinforced_at = now;
                updated
            }
            None => {
                let count = group.handoff_ids.len();
                SemanticPrinciple {
                    principle_id: PrincipleId::generate(),
                    tenant_id: tenant.clone(),
                    principle: group.representative.clone(),
                    context: format!("distilled from {} handoffs", count),
                    category: "identity".to_string(),
                    confidence: (NEW_PRINCIPLE_CONFIDENCE
                        + settings.principle_reinforcement_increment * count as f32)
                        .min(1.0),
                    source_handoff_ids: group.handoff_ids.clone(),
                    source_count: count as i32,
                    last_reinforced_at: now,
                    created_at: now,
                }
            }
        };

        match store.upsert_principle(&principle).await {
            Ok(()) => sweep.affected += 1,
            Err(e) => {
                tracing::warn!(error = %e, "Principle upsert failed");
                sweep.failures.push(principle.principle_id.render());
            }
        }
    }

    Ok(sweep)
}

/// Convenience for tests and the decay-only maintenance path.
pub fn idle_cutoff(settings: &ConsolidationSettings, now: Timestamp) -> Timestamp {
    now - Duration::days(settings.principle_decay_idle_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_storage::MemoryStore;
    use engram_test_utils::{handoff_fixture, tenant};

    fn settings() -> ConsolidationSettings {
        ConsolidationSettings::default()
    }

    async fn seed_thread(store: &MemoryStore, becoming: &str, count: usize) {
        for _ in 0..count {
            let handoff = handoff_fixture("t1", Some(becoming));
            store.insert_handoff(&handoff).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_extraction_requires_min_count() {
        let store = MemoryStore::new();
        seed_thread(&store, "becoming more careful with token budgets", 9).await;

        let t = tenant("t1");
        extract_identity(&store, &t, &settings(), Utc::now())
            .await
            .unwrap();
        assert!(store.list_principles(&t).await.unwrap().is_empty());

        seed_thread(&store, "becoming more careful with token budgets", 1).await;
        extract_identity(&store, &t, &settings(), Utc::now())
            .await
            .unwrap();
        let principles = store.list_principles(&t).await.unwrap();
        assert_eq!(principles.len(), 1);
        assert_eq!(principles[0].source_count, 10);
        assert!(principles[0].confidence > NEW_PRINCIPLE_CONFIDENCE);
        assert_eq!(principles[0].source_handoff_ids.len(), 10);
    }

    #[tokio::test]
    async fn test_reinforcement_grows_confidence_monotonically() {
        let store = MemoryStore::new();
        let t = tenant("t1");
        seed_thread(&store, "becoming better at pacing reviews", 10).await;
        extract_identity(&store, &t, &settings(), Utc::now())
            .await
            .unwrap();
        let before = store.list_principles(&t).await.unwrap()[0].clone();

        seed_thread(&store, "becoming better at pacing reviews", 3).await;
        extract_identity(&store, &t, &settings(), Utc::now())
            .await
            .unwrap();
        let after = store.list_principles(&t).await.unwrap()[0].clone();
        assert!(after.confidence > before.confidence);
        assert!(after.confidence <= 1.0);
        assert_eq!(after.source_count, 13);
    }

    #[tokio::test]
    async fn test_decay_is_floored() {
        let store = MemoryStore::new();
        let t = tenant("t1");
        let settings = settings();
        let principle = SemanticPrinciple {
            principle_id: PrincipleId::generate(),
            tenant_id: t.clone(),
            principle: "keep the pool bounded".to_string(),
            context: "test".to_string(),
            category: "identity".to_string(),
            confidence: 0.9,
            source_handoff_ids: vec![HandoffId::generate()],
            source_count: 10,
            last_reinforced_at: Utc::now() - Duration::days(365),
            created_at: Utc::now() - Duration::days(400),
        };
        store.upsert_principle(&principle).await.unwrap();

        extract_identity(&store, &t, &settings, Utc::now())
            .await
            .unwrap();
        let decayed = store.list_principles(&t).await.unwrap()[0].clone();
        assert!(decayed.confidence < 0.9);
        assert!(decayed.confidence >= settings.principle_confidence_floor);

        // 12 idle periods at 0.9: 0.9 * 0.9^12 ~= 0.25.
        let expected = 0.9f32 * 0.9f32.powi(12);
        assert!((decayed.confidence - expected.max(0.1)).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_dissimilar_becomings_do_not_group() {
        let store = MemoryStore::new();
        let t = tenant("t1");
        seed_thread(&store, "becoming more careful with token budgets", 6).await;
        seed_thread(&store, "learning to delegate research to subagents", 6).await;

        extract_identity(&store, &t, &settings(), Utc::now())
            .await
            .unwrap();
        // Neither group reaches 10 on its own.
        assert!(store.list_principles(&t).await.unwrap().is_empty());
    }
}
