//! Consolidator observability and manual runs

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use engram_core::{EngramResult, JobType};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

/// Per-tier counts and tokens saved, plus the latest job reports.
pub async fn get_compression_stats(
    state: &AppState,
    ctx: &RequestContext,
) -> EngramResult<JsonValue> {
    let stats = state.store.compression_stats(&ctx.tenant_id).await?;
    let reports = state.store.list_reports(&ctx.tenant_id, 10).await?;
    Ok(json!({
        "stats": stats,
        "recent_reports": reports,
    }))
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    #[serde(default = "default_job")]
    job_type: JobType,
}

fn default_job() -> JobType {
    JobType::All
}

/// Run consolidation now for the request tenant.
pub async fn trigger_consolidation(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: TriggerParams = parse_params(params)?;
    let reports = state
        .consolidator
        .consolidate(state.store.as_ref(), &ctx.tenant_id, p.job_type, None)
        .await?;
    Ok(json!({ "reports": reports }))
}
