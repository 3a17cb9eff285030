//! build_acb

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use engram_context::AcbRequest;
use engram_core::{EngramResult, Intent};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct BuildAcbParams {
    #[serde(default)]
    intent: Option<Intent>,
    #[serde(default)]
    query_text: Option<String>,
    #[serde(default)]
    tag_filters: Vec<String>,
    #[serde(default)]
    max_tokens: Option<i32>,
    #[serde(default)]
    reserve_tokens: Option<i32>,
}

/// Deadline margin left for serialization after assembly stops.
const ASSEMBLY_MARGIN: Duration = Duration::from_millis(50);

/// Build the Active Context Bundle for the next model call.
pub async fn build_acb(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: BuildAcbParams = parse_params(params)?;
    let request = AcbRequest {
        tenant_id: ctx.tenant_id.clone(),
        session_id: ctx.session_id.clone(),
        agent_id: ctx.agent_id.clone(),
        channel: ctx.channel,
        intent: p.intent.unwrap_or_default(),
        query_text: p.query_text.unwrap_or_default(),
        tag_filters: p.tag_filters,
        max_tokens: p.max_tokens,
        reserve_tokens: p.reserve_tokens,
        deadline: Some(ctx.deadline - ASSEMBLY_MARGIN),
    };

    let acb = state
        .builder
        .build(
            state.store.as_ref(),
            state.embedder.as_deref(),
            &request,
        )
        .await?;
    serde_json::to_value(&acb)
        .map_err(|e| engram_core::EngramError::Fatal { reason: e.to_string() })
}
