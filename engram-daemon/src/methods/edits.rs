//! Memory surgery: propose, approve, reject

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use chrono::Utc;
use engram_core::{
    CapsuleStatus, DecisionStatus, EditId, EditOp, EditPatch, EditStatus, EngramError,
    EngramResult, MemoryEdit, MemoryIdType, MemoryRef, Proposer, compute_content_hash,
    estimate_tokens, normalize_terms, simhash64,
};
use engram_storage::ChunkPatch;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

#[derive(Debug, Deserialize)]
struct ProposeEditParams {
    op: EditOp,
    target: MemoryRef,
    reason: String,
    proposed_by: Proposer,
    #[serde(default)]
    patch: EditPatch,
}

/// Propose a surgical edit; it stays pending until reviewed.
pub async fn propose_memory_edit(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: ProposeEditParams = parse_params(params)?;
    if p.reason.trim().is_empty() {
        return Err(EngramError::missing_field("reason"));
    }

    let edit = MemoryEdit {
        edit_id: EditId::generate(),
        tenant_id: ctx.tenant_id.clone(),
        op: p.op,
        target: p.target,
        reason: p.reason,
        proposed_by: p.proposed_by,
        status: EditStatus::Pending,
        patch: p.patch,
        created_at: Utc::now(),
        resolved_at: None,
    };
    if !edit.patch_is_valid() {
        return Err(EngramError::invalid_value(
            "patch",
            "patch does not satisfy the op's requirements",
        ));
    }
    verify_target(state, ctx, &edit.target).await?;

    state.store.insert_edit(&edit).await?;
    Ok(json!({ "edit_id": edit.edit_id, "status": edit.status }))
}

#[derive(Debug, Deserialize)]
struct ReviewEditParams {
    edit_id: EditId,
}

/// Approve a pending edit and apply its patch.
pub async fn approve_memory_edit(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: ReviewEditParams = parse_params(params)?;
    let edit = load_pending(state, ctx, p.edit_id).await?;

    apply_edit(state, ctx, &edit).await?;
    let now = Utc::now();
    state
        .store
        .set_edit_status(&ctx.tenant_id, edit.edit_id, EditStatus::Approved, now)
        .await?;

    tracing::info!(
        request_id = %ctx.request_id,
        tenant_id = %ctx.tenant_id,
        edit_id = %edit.edit_id,
        op = %edit.op,
        target = %edit.target,
        "Memory edit applied"
    );
    Ok(json!({ "edit_id": edit.edit_id, "status": EditStatus::Approved }))
}

/// Reject a pending edit; nothing is applied.
pub async fn reject_memory_edit(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: ReviewEditParams = parse_params(params)?;
    let edit = load_pending(state, ctx, p.edit_id).await?;
    state
        .store
        .set_edit_status(&ctx.tenant_id, edit.edit_id, EditStatus::Rejected, Utc::now())
        .await?;
    Ok(json!({ "edit_id": edit.edit_id, "status": EditStatus::Rejected }))
}

async fn load_pending(
    state: &AppState,
    ctx: &RequestContext,
    edit_id: EditId,
) -> EngramResult<MemoryEdit> {
    let edit = state
        .store
        .get_edit(&ctx.tenant_id, edit_id)
        .await?
        .ok_or(EngramError::NotFound {
            entity: "memory_edit",
            id: edit_id.render(),
        })?;
    if edit.status != EditStatus::Pending {
        return Err(EngramError::invalid_value(
            "edit_id",
            format!("edit is already {}", edit.status),
        ));
    }
    Ok(edit)
}

async fn verify_target(
    state: &AppState,
    ctx: &RequestContext,
    target: &MemoryRef,
) -> EngramResult<()> {
    let found = match target {
        MemoryRef::Chunk(id) => state.store.get_chunk(&ctx.tenant_id, *id).await?.is_some(),
        MemoryRef::Decision(id) => {
            state.store.get_decision(&ctx.tenant_id, *id).await?.is_some()
        }
        MemoryRef::Event(id) => state.store.get_event(&ctx.tenant_id, *id).await?.is_some(),
        MemoryRef::Artifact(id) => state
            .store
            .get_artifact(&ctx.tenant_id, *id, 1)
            .await?
            .is_some(),
        MemoryRef::Handoff(id) => state.store.get_handoff(&ctx.tenant_id, *id).await?.is_some(),
        MemoryRef::Capsule(id) => state.store.get_capsule(&ctx.tenant_id, *id).await?.is_some(),
    };
    if !found {
        return Err(EngramError::NotFound {
            entity: "edit target",
            id: target.render(),
        });
    }
    // Events and handoffs are append-only ground truth; edits operate on
    // chunks, decisions and capsules only.
    if matches!(target, MemoryRef::Event(_) | MemoryRef::Handoff(_)) {
        return Err(EngramError::invalid_value(
            "target",
            "events and handoffs cannot be edited; target their chunks",
        ));
    }
    Ok(())
}

/// Apply the approved op to its target. Retraction marks inactive; nothing
/// is physically deleted.
async fn apply_edit(
    state: &AppState,
    ctx: &RequestContext,
    edit: &MemoryEdit,
) -> EngramResult<()> {
    match (&edit.target, edit.op) {
        (MemoryRef::Chunk(id), op) => {
            let patch = match op {
                EditOp::Retract | EditOp::Quarantine => ChunkPatch {
                    active: Some(false),
                    ..ChunkPatch::default()
                },
                EditOp::Amend => {
                    let mut patch = ChunkPatch {
                        importance: edit.patch.importance,
                        ..ChunkPatch::default()
                    };
                    if let Some(text) = &edit.patch.text {
                        patch.text = Some(text.clone());
                        patch.token_est = Some(estimate_tokens(text));
                        patch.terms = Some(normalize_terms(text));
                        patch.content_hash = Some(compute_content_hash(text.as_bytes()));
                        patch.simhash = Some(simhash64(text));
                    }
                    patch
                }
                EditOp::Attenuate => ChunkPatch {
                    importance_delta: edit.patch.importance_delta,
                    ..ChunkPatch::default()
                },
                EditOp::Block => ChunkPatch {
                    channel: edit.patch.channel,
                    ..ChunkPatch::default()
                },
            };
            state.store.apply_chunk_patch(&ctx.tenant_id, *id, &patch).await
        }
        (MemoryRef::Decision(id), EditOp::Retract | EditOp::Quarantine) => {
            state
                .store
                .set_decision_status(
                    &ctx.tenant_id,
                    *id,
                    DecisionStatus::Superseded,
                    Some(Utc::now()),
                )
                .await
        }
        (MemoryRef::Capsule(id), EditOp::Retract | EditOp::Quarantine | EditOp::Block) => {
            state
                .store
                .set_capsule_status(&ctx.tenant_id, *id, CapsuleStatus::Revoked)
                .await
        }
        (MemoryRef::Capsule(_), _) => Err(EngramError::invalid_value(
            "op",
            "capsules support retract/quarantine/block only",
        )),
        (MemoryRef::Artifact(_), _) => Err(EngramError::invalid_value(
            "target",
            "artifacts cannot be edited; retract their referencing chunks",
        )),
        (MemoryRef::Decision(_), _) => Err(EngramError::invalid_value(
            "op",
            "decisions support retract/quarantine only",
        )),
        (MemoryRef::Event(_) | MemoryRef::Handoff(_), _) => unreachable!("rejected at propose"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_validation_matrix() {
        let base = MemoryEdit {
            edit_id: EditId::generate(),
            tenant_id: engram_core::TenantId::new("t1").unwrap(),
            op: EditOp::Retract,
            target: MemoryRef::Chunk(engram_core::ChunkId::generate()),
            reason: "because".to_string(),
            proposed_by: Proposer::Human,
            status: EditStatus::Pending,
            patch: EditPatch::default(),
            created_at: Utc::now(),
            resolved_at: None,
        };
        assert!(base.patch_is_valid());

        let amend_empty = MemoryEdit {
            op: EditOp::Amend,
            ..base.clone()
        };
        assert!(!amend_empty.patch_is_valid());

        let block_empty = MemoryEdit {
            op: EditOp::Block,
            ..base
        };
        assert!(!block_empty.patch_is_valid());
    }
}
