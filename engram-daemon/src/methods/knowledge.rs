//! Principles and curated notes

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use chrono::Utc;
use engram_core::{EngramError, EngramResult, KnowledgeNote, MemoryIdType, NoteId, Sensitivity};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

/// Read the extracted principles with confidence.
pub async fn list_semantic_principles(
    state: &AppState,
    ctx: &RequestContext,
) -> EngramResult<JsonValue> {
    let principles = state.store.list_principles(&ctx.tenant_id).await?;
    Ok(json!({ "principles": principles }))
}

#[derive(Debug, Deserialize)]
struct CreateNoteParams {
    text: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    with_whom: Vec<String>,
    #[serde(default)]
    sensitivity: Option<Sensitivity>,
}

pub async fn create_knowledge_note(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: CreateNoteParams = parse_params(params)?;
    if p.text.trim().is_empty() {
        return Err(EngramError::missing_field("text"));
    }

    let note = KnowledgeNote {
        note_id: NoteId::generate(),
        tenant_id: ctx.tenant_id.clone(),
        agent_id: ctx.agent_id.clone(),
        channel: ctx.channel,
        sensitivity: engram_recorder::classify(
            &p.text,
            p.sensitivity.unwrap_or(Sensitivity::None),
        ),
        text: p.text,
        tags: p.tags,
        with_whom: p.with_whom,
        embedding: None,
        created_at: Utc::now(),
    };
    state.store.insert_note(&note).await?;

    // Notes share the retrieval pool; backfill their embedding too.
    if let Some(embedder) = state.embedder.clone() {
        let store = Arc::clone(&state.store);
        let tenant = ctx.tenant_id.clone();
        let note_id = note.note_id;
        let text = note.text.clone();
        tokio::spawn(async move {
            if let Ok(embedding) = embedder.embed(&text).await {
                if let Ok(Some(mut stored)) = store.get_note(&tenant, note_id).await {
                    stored.embedding = Some(embedding);
                    // Notes are immutable apart from the embedding; re-insert
                    // overwrites the row in both backends.
                    if let Err(e) = store.insert_note(&stored).await {
                        tracing::warn!(error = %e, "Note embedding backfill failed");
                    }
                }
            }
        });
    }

    Ok(json!({ "note_id": note.note_id }))
}

#[derive(Debug, Deserialize)]
struct GetNotesParams {
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn get_knowledge_notes(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: GetNotesParams = parse_params(params)?;
    let limit = p.limit.unwrap_or(50).min(200);
    let notes = state
        .store
        .list_notes(&ctx.tenant_id, p.tags.as_deref(), limit)
        .await?;
    // Channel suppression applies to reads like any other surface.
    let visible: Vec<&KnowledgeNote> = notes
        .iter()
        .filter(|n| {
            state
                .config
                .privacy
                .channels
                .allows(ctx.channel, n.sensitivity)
                && !(ctx.channel.suppresses_preferences()
                    && n.tags.iter().any(|t| t == "preferences"))
        })
        .collect();
    Ok(json!({ "notes": visible }))
}
