//! record_event

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use engram_core::{Actor, ChunkId, DraftContent, EngramResult, MemoryRef, Sensitivity};
use engram_recorder::EventDraft;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct RecordEventParams {
    actor: Actor,
    content: DraftContent,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    refs: Vec<MemoryRef>,
    #[serde(default)]
    sensitivity: Option<Sensitivity>,
    #[serde(default)]
    pinned: bool,
}

/// Append an event. When the store is unreachable the draft is deferred to
/// the WAL and the caller still gets success, flagged `deferred: true`.
pub async fn record_event(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: RecordEventParams = parse_params(params)?;
    let draft = EventDraft {
        tenant_id: ctx.tenant_id.clone(),
        session_id: ctx.session_id.clone(),
        agent_id: ctx.agent_id.clone(),
        channel: ctx.channel,
        actor: p.actor,
        content: p.content,
        tags: p.tags,
        refs: p.refs,
        sensitivity: p.sensitivity,
        pinned: p.pinned,
    };

    match state.recorder.append(state.store.as_ref(), draft.clone()).await {
        Ok(outcome) => {
            spawn_embedding_backfill(state, ctx, &outcome.chunk_ids);
            let mut result = serde_json::to_value(&outcome)
                .map_err(|e| engram_core::EngramError::Fatal { reason: e.to_string() })?;
            result["deferred"] = json!(false);
            Ok(result)
        }
        Err(e) if e.is_store_unavailable() => {
            state.wal.append(&draft).await?;
            tracing::warn!(
                request_id = %ctx.request_id,
                tenant_id = %ctx.tenant_id,
                "Store unreachable; event deferred to WAL"
            );
            Ok(json!({ "deferred": true }))
        }
        Err(e) => Err(e),
    }
}

/// Chunk embeddings are backfilled off the request path.
fn spawn_embedding_backfill(state: &AppState, ctx: &RequestContext, chunk_ids: &[ChunkId]) {
    let Some(embedder) = state.embedder.clone() else {
        return;
    };
    let store = Arc::clone(&state.store);
    let tenant = ctx.tenant_id.clone();
    let chunk_ids = chunk_ids.to_vec();
    tokio::spawn(async move {
        for chunk_id in chunk_ids {
            let chunk = match store.get_chunk(&tenant, chunk_id).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Embedding backfill read failed");
                    return;
                }
            };
            match embedder.embed(&chunk.text).await {
                Ok(embedding) => {
                    if let Err(e) = store
                        .update_chunk_embedding(&tenant, chunk_id, &embedding)
                        .await
                    {
                        tracing::warn!(error = %e, "Embedding backfill write failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Embedding backfill skipped");
                }
            }
        }
    });
}
