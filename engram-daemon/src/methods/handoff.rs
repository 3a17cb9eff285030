//! Continuity operations: create_handoff, get_wake_up, list_handoffs

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use chrono::Utc;
use engram_core::{
    Actor, ActorKind, CompressionLevel, DecisionContent, DecisionScope, DraftContent,
    EngramError, EngramResult, Handoff, HandoffId, MemoryIdType, MemoryRef, Timestamp,
};
use engram_recorder::EventDraft;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

#[derive(Debug, Deserialize)]
struct CreateHandoffParams {
    experienced: String,
    noticed: String,
    learned: String,
    story: String,
    #[serde(default)]
    becoming: Option<String>,
    remember: String,
    significance: f32,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    with_whom: Vec<String>,
}

/// Create a handoff: validate the structured fields, record the event that
/// makes the handoff retrievable, and emit a decision row only for
/// high-significance handoffs.
pub async fn create_handoff(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: CreateHandoffParams = parse_params(params)?;
    for (field, value) in [
        ("experienced", &p.experienced),
        ("noticed", &p.noticed),
        ("learned", &p.learned),
        ("remember", &p.remember),
    ] {
        if value.trim().is_empty() {
            return Err(EngramError::missing_field(field));
        }
    }
    if !(0.0..=1.0).contains(&p.significance) {
        return Err(EngramError::invalid_value(
            "significance",
            "must be in [0, 1]",
        ));
    }

    // The retrievable trace of the handoff: one event, standard chunks.
    let mut tags = p.tags.clone();
    if !tags.iter().any(|t| t == "handoff") {
        tags.push("handoff".to_string());
    }
    let event_text = format!(
        "Handoff. Experienced: {}\nNoticed: {}\nLearned: {}\nRemember: {}",
        p.experienced, p.noticed, p.learned, p.remember
    );
    let event_outcome = state
        .recorder
        .append(
            state.store.as_ref(),
            EventDraft {
                tenant_id: ctx.tenant_id.clone(),
                session_id: ctx.session_id.clone(),
                agent_id: ctx.agent_id.clone(),
                channel: ctx.channel,
                actor: Actor {
                    kind: ActorKind::Agent,
                    id: ctx.agent_id.to_string(),
                },
                content: DraftContent::Message { text: event_text },
                tags,
                refs: vec![],
                sensitivity: None,
                pinned: false,
            },
        )
        .await?;

    let handoff = Handoff {
        handoff_id: HandoffId::generate(),
        tenant_id: ctx.tenant_id.clone(),
        session_id: ctx.session_id.clone(),
        agent_id: ctx.agent_id.clone(),
        experienced: p.experienced,
        noticed: p.noticed,
        learned: p.learned.clone(),
        story: p.story,
        becoming: p.becoming,
        remember: p.remember.clone(),
        significance: p.significance,
        tags: p.tags,
        with_whom: p.with_whom,
        compression_level: CompressionLevel::Full,
        summary: None,
        quick_ref: None,
        refs: vec![MemoryRef::Event(event_outcome.event_id)],
        created_at: Utc::now(),
        consolidated_at: None,
    };
    state.store.insert_handoff(&handoff).await?;

    // The identity thread stays unpolluted: only significant handoffs leave
    // a decision behind.
    let mut decision_id = None;
    if p.significance >= state.config.consolidation.handoff_decision_significance {
        let outcome = state
            .recorder
            .append(
                state.store.as_ref(),
                EventDraft {
                    tenant_id: ctx.tenant_id.clone(),
                    session_id: ctx.session_id.clone(),
                    agent_id: ctx.agent_id.clone(),
                    channel: ctx.channel,
                    actor: Actor {
                        kind: ActorKind::Agent,
                        id: ctx.agent_id.to_string(),
                    },
                    content: DraftContent::Decision(DecisionContent {
                        decision: p.remember,
                        rationale: p.learned,
                        constraints: vec![],
                        alternatives: vec![],
                        consequences: vec![],
                        scope: DecisionScope::Project,
                        supersedes: None,
                    }),
                    tags: vec!["handoff".to_string()],
                    refs: vec![MemoryRef::Handoff(handoff.handoff_id)],
                    sensitivity: None,
                    pinned: false,
                },
            )
            .await?;
        decision_id = outcome.decision_id;
    }

    tracing::info!(
        request_id = %ctx.request_id,
        tenant_id = %ctx.tenant_id,
        handoff_id = %handoff.handoff_id,
        significance = p.significance,
        "Handoff created"
    );
    Ok(json!({
        "handoff_id": handoff.handoff_id,
        "event_id": event_outcome.event_id,
        "chunk_ids": event_outcome.chunk_ids,
        "decision_id": decision_id,
        "in_identity_thread": handoff.in_identity_thread(),
    }))
}

/// Everything the next session needs to start coherently.
pub async fn get_wake_up(state: &AppState, ctx: &RequestContext) -> EngramResult<JsonValue> {
    let latest = state.store.get_latest_handoff(&ctx.tenant_id, None).await?;
    let identity_thread = state.store.list_identity_thread(&ctx.tenant_id, 50).await?;
    let decisions = state
        .store
        .list_active_decisions(&ctx.tenant_id, state.config.retrieval.active_decisions_max)
        .await?;
    let tasks = state.store.list_open_tasks(&ctx.tenant_id, 50).await?;

    Ok(json!({
        "latest_handoff": latest,
        "identity_thread": identity_thread,
        "active_decisions": decisions,
        "open_tasks": tasks,
    }))
}

#[derive(Debug, Deserialize)]
struct ListHandoffsParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    before: Option<Timestamp>,
}

pub async fn list_handoffs(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: ListHandoffsParams = parse_params(params)?;
    let limit = p.limit.unwrap_or(20).min(100);
    let handoffs = state
        .store
        .list_handoffs(&ctx.tenant_id, limit, p.before)
        .await?;
    Ok(json!({ "handoffs": handoffs }))
}
