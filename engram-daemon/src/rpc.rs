//! JSON-RPC envelope and method dispatch
//!
//! One POST route carries every tool-surface operation. The handler binds
//! the request context (isolation keys, deadline), enforces the rate limit,
//! dispatches by method name, writes an audit entry with the outcome, and
//! always answers HTTP 200 with a JSON-RPC result or error object.

use crate::auth::AuthContext;
use crate::context::{RequestContext, ScopeParams};
use crate::error::RpcError;
use crate::methods;
use crate::state::AppState;
use axum::{Extension, Json, extract::State};
use chrono::Utc;
use engram_core::{AuditOutcome, AuditEntry, EngramError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Incoming JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: JsonValue,
    pub method: String,
    #[serde(default)]
    pub params: JsonValue,
}

/// Outgoing JSON-RPC 2.0 response envelope, plus the opaque request id.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub request_id: String,
}

impl RpcResponse {
    fn ok(id: JsonValue, request_id: String, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
            request_id,
        }
    }

    fn err(id: JsonValue, request_id: String, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
            request_id,
        }
    }
}

/// Grace added to the request deadline before the hard timeout fires; the
/// ACB builder uses the in-band deadline to return partial results first.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// POST /rpc
pub async fn handle_rpc(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: String,
) -> Json<RpcResponse> {
    let fallback_id = || format!("req_{}", uuid::Uuid::now_v7().simple());

    let req: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            return Json(RpcResponse::err(
                JsonValue::Null,
                fallback_id(),
                RpcError::parse_error(e.to_string()),
            ));
        }
    };
    if req.jsonrpc != "2.0" {
        return Json(RpcResponse::err(
            req.id,
            fallback_id(),
            RpcError::invalid_request("jsonrpc must be \"2.0\""),
        ));
    }

    let scope: ScopeParams = match serde_json::from_value(req.params.clone()) {
        Ok(scope) => scope,
        Err(e) => {
            return Json(RpcResponse::err(
                req.id,
                fallback_id(),
                RpcError::invalid_params(e.to_string()),
            ));
        }
    };
    let ctx = match RequestContext::bind(scope, &auth, state.config.limits.deadline_ms) {
        Ok(ctx) => ctx,
        Err(e) => {
            return Json(RpcResponse::err(req.id, fallback_id(), RpcError::from(e)));
        }
    };

    if !state.limits.check(ctx.tenant_id.as_str()) {
        audit(&state, &ctx, &auth, &req.method, AuditOutcome::Failure, "rate_limited").await;
        return Json(RpcResponse::err(
            req.id,
            ctx.request_id,
            RpcError::rate_limited(),
        ));
    }
    state
        .known_tenants
        .insert(ctx.tenant_id.as_str().to_string(), ());

    let budget = ctx.remaining() + TIMEOUT_GRACE;
    let result = match tokio::time::timeout(
        budget,
        dispatch(&state, &ctx, &req.method, &req.params),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(MethodError::Domain(EngramError::DeadlineExceeded {
            elapsed_ms: ctx.elapsed_ms(),
        })),
    };

    match result {
        Ok(result) => {
            audit(&state, &ctx, &auth, &req.method, AuditOutcome::Success, "ok").await;
            tracing::info!(
                request_id = %ctx.request_id,
                tenant_id = %ctx.tenant_id,
                method = %req.method,
                elapsed_ms = ctx.elapsed_ms(),
                "Request complete"
            );
            Json(RpcResponse::ok(req.id, ctx.request_id, result))
        }
        Err(MethodError::Unknown(method)) => {
            audit(&state, &ctx, &auth, &method, AuditOutcome::Failure, "method_not_found")
                .await;
            Json(RpcResponse::err(
                req.id,
                ctx.request_id,
                RpcError::method_not_found(&method),
            ))
        }
        Err(MethodError::Domain(e)) => {
            audit(
                &state,
                &ctx,
                &auth,
                &req.method,
                AuditOutcome::Failure,
                e.kind().as_str(),
            )
            .await;
            tracing::warn!(
                request_id = %ctx.request_id,
                tenant_id = %ctx.tenant_id,
                method = %req.method,
                error = %e,
                "Request failed"
            );
            Json(RpcResponse::err(req.id, ctx.request_id, RpcError::from(e)))
        }
    }
}

/// Dispatch failures: an unknown method is a transport error, everything
/// else maps through the domain taxonomy.
pub enum MethodError {
    Unknown(String),
    Domain(EngramError),
}

impl From<EngramError> for MethodError {
    fn from(e: EngramError) -> Self {
        MethodError::Domain(e)
    }
}

async fn dispatch(
    state: &AppState,
    ctx: &RequestContext,
    method: &str,
    params: &JsonValue,
) -> Result<JsonValue, MethodError> {
    let result = match method {
        "record_event" => methods::record::record_event(state, ctx, params).await?,
        "build_acb" => methods::acb::build_acb(state, ctx, params).await?,
        "get_artifact" => methods::artifact::get_artifact(state, ctx, params).await?,
        "create_handoff" => methods::handoff::create_handoff(state, ctx, params).await?,
        "get_wake_up" => methods::handoff::get_wake_up(state, ctx).await?,
        "list_handoffs" => methods::handoff::list_handoffs(state, ctx, params).await?,
        "list_semantic_principles" => {
            methods::knowledge::list_semantic_principles(state, ctx).await?
        }
        "create_knowledge_note" => {
            methods::knowledge::create_knowledge_note(state, ctx, params).await?
        }
        "get_knowledge_notes" => {
            methods::knowledge::get_knowledge_notes(state, ctx, params).await?
        }
        "create_capsule" => methods::capsule::create_capsule(state, ctx, params).await?,
        "get_available_capsules" => {
            methods::capsule::get_available_capsules(state, ctx, params).await?
        }
        "revoke_capsule" => methods::capsule::revoke_capsule(state, ctx, params).await?,
        "propose_memory_edit" => methods::edits::propose_memory_edit(state, ctx, params).await?,
        "approve_memory_edit" => methods::edits::approve_memory_edit(state, ctx, params).await?,
        "reject_memory_edit" => methods::edits::reject_memory_edit(state, ctx, params).await?,
        "get_compression_stats" => methods::consolidation::get_compression_stats(state, ctx).await?,
        "trigger_consolidation" => {
            methods::consolidation::trigger_consolidation(state, ctx, params).await?
        }
        "export_thread" => methods::export::export_thread(state, ctx, params).await?,
        "export_all" => methods::export::export_all(state, ctx).await?,
        _ => return Err(MethodError::Unknown(method.to_string())),
    };
    Ok(result)
}

/// Best-effort audit append; an unreachable store must not mask the
/// request's own outcome.
async fn audit(
    state: &AppState,
    ctx: &RequestContext,
    auth: &AuthContext,
    method: &str,
    outcome: AuditOutcome,
    detail: &str,
) {
    let entry = AuditEntry {
        tenant_id: ctx.tenant_id.clone(),
        event_type: "rpc".to_string(),
        action: method.to_string(),
        outcome,
        resource_type: "method".to_string(),
        resource_id: Some(ctx.request_id.clone()),
        actor: format!("{}@{}", ctx.agent_id, auth.key_id),
        details: serde_json::json!({
            "detail": detail,
            "session_id": ctx.session_id,
            "channel": ctx.channel,
            "elapsed_ms": ctx.elapsed_ms(),
        }),
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.append_audit(&entry).await {
        tracing::warn!(error = %e, "Audit append failed");
    }
}

/// Deserialize a method's params, mapping failures onto the taxonomy.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: &JsonValue) -> Result<T, EngramError> {
    serde_json::from_value(params.clone())
        .map_err(|e| EngramError::invalid_value("params", e.to_string()))
}
