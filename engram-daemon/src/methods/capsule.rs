//! Cross-agent sharing: create_capsule, get_available_capsules, revoke_capsule

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use chrono::{Duration, Utc};
use engram_core::{
    AgentId, Capsule, CapsuleId, CapsuleItems, CapsuleStatus, EngramError, EngramResult,
    MemoryIdType,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

const MAX_TTL_DAYS: i32 = 365;
const MAX_ITEMS: usize = 100;

#[derive(Debug, Deserialize)]
struct CreateCapsuleParams {
    #[serde(default = "default_scope")]
    scope: String,
    subject_type: String,
    subject_id: String,
    audience_agent_ids: Vec<AgentId>,
    #[serde(default)]
    items: CapsuleItems,
    #[serde(default)]
    risks: Vec<String>,
    ttl_days: i32,
}

fn default_scope() -> String {
    "project".to_string()
}

/// Create a capsule. Every referenced item must exist in the request tenant;
/// anything else is a tenant mismatch.
pub async fn create_capsule(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: CreateCapsuleParams = parse_params(params)?;
    if p.subject_type.trim().is_empty() {
        return Err(EngramError::missing_field("subject_type"));
    }
    if p.audience_agent_ids.is_empty() {
        return Err(EngramError::missing_field("audience_agent_ids"));
    }
    if p.items.is_empty() {
        return Err(EngramError::missing_field("items"));
    }
    if !(1..=MAX_TTL_DAYS).contains(&p.ttl_days) {
        return Err(EngramError::invalid_value(
            "ttl_days",
            format!("must be in [1, {}]", MAX_TTL_DAYS),
        ));
    }
    let item_count =
        p.items.chunks.len() + p.items.decisions.len() + p.items.artifacts.len();
    if item_count > MAX_ITEMS {
        return Err(EngramError::invalid_value(
            "items",
            format!("at most {} items", MAX_ITEMS),
        ));
    }

    // Tenant-scoped lookups return nothing for foreign rows, so existence
    // checking is the ownership check.
    for chunk_id in &p.items.chunks {
        if state.store.get_chunk(&ctx.tenant_id, *chunk_id).await?.is_none() {
            return Err(EngramError::TenantMismatch {
                request: ctx.tenant_id.to_string(),
                resource: chunk_id.render(),
            });
        }
    }
    for decision_id in &p.items.decisions {
        if state
            .store
            .get_decision(&ctx.tenant_id, *decision_id)
            .await?
            .is_none()
        {
            return Err(EngramError::TenantMismatch {
                request: ctx.tenant_id.to_string(),
                resource: decision_id.render(),
            });
        }
    }
    for artifact_id in &p.items.artifacts {
        if state
            .store
            .get_artifact(&ctx.tenant_id, *artifact_id, 1)
            .await?
            .is_none()
        {
            return Err(EngramError::TenantMismatch {
                request: ctx.tenant_id.to_string(),
                resource: artifact_id.render(),
            });
        }
    }

    let now = Utc::now();
    let capsule = Capsule {
        capsule_id: CapsuleId::generate(),
        tenant_id: ctx.tenant_id.clone(),
        scope: p.scope,
        subject_type: p.subject_type,
        subject_id: p.subject_id,
        author_agent_id: ctx.agent_id.clone(),
        audience_agent_ids: p.audience_agent_ids,
        items: p.items,
        risks: p.risks,
        ttl_days: p.ttl_days,
        status: CapsuleStatus::Active,
        created_at: now,
        expires_at: now + Duration::days(p.ttl_days as i64),
    };
    state.store.insert_capsule(&capsule).await?;

    tracing::info!(
        request_id = %ctx.request_id,
        tenant_id = %ctx.tenant_id,
        capsule_id = %capsule.capsule_id,
        audience = capsule.audience_agent_ids.len(),
        "Capsule created"
    );
    Ok(json!({
        "capsule_id": capsule.capsule_id,
        "expires_at": capsule.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
struct GetCapsulesParams {
    #[serde(default)]
    subject_type: Option<String>,
    #[serde(default)]
    subject_id: Option<String>,
}

/// Active, unexpired capsules where the calling agent is in the audience.
pub async fn get_available_capsules(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: GetCapsulesParams = parse_params(params)?;
    let capsules = state
        .store
        .list_capsules_for_audience(
            &ctx.tenant_id,
            &ctx.agent_id,
            p.subject_type.as_deref(),
            p.subject_id.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(json!({ "capsules": capsules }))
}

#[derive(Debug, Deserialize)]
struct RevokeCapsuleParams {
    capsule_id: CapsuleId,
}

/// Revoke a capsule; reads after revocation return nothing.
pub async fn revoke_capsule(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: RevokeCapsuleParams = parse_params(params)?;
    let capsule = state
        .store
        .get_capsule(&ctx.tenant_id, p.capsule_id)
        .await?
        .ok_or(EngramError::NotFound {
            entity: "capsule",
            id: p.capsule_id.render(),
        })?;
    // Only the author (or a caller on the author's behalf in the same
    // tenant) may revoke.
    if capsule.author_agent_id != ctx.agent_id {
        return Err(EngramError::Forbidden {
            reason: "only the authoring agent may revoke a capsule".to_string(),
        });
    }
    state
        .store
        .set_capsule_status(&ctx.tenant_id, p.capsule_id, CapsuleStatus::Revoked)
        .await?;
    Ok(json!({ "capsule_id": p.capsule_id, "status": CapsuleStatus::Revoked }))
}
