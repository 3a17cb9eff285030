//! get_artifact

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use engram_core::{ArtifactId, EngramError, EngramResult, MemoryIdType};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

#[derive(Debug, Deserialize)]
struct GetArtifactParams {
    artifact_id: ArtifactId,
    #[serde(default)]
    max_bytes: Option<usize>,
}

/// Fetch an artifact with bounded bytes. The per-call byte budget caps the
/// returned payload regardless of what the caller asks for.
pub async fn get_artifact(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: GetArtifactParams = parse_params(params)?;
    let hard_cap = state.config.limits.max_bytes_read_per_call as usize;
    let max_bytes = p.max_bytes.unwrap_or(hard_cap).min(hard_cap);

    let artifact = state
        .store
        .get_artifact(&ctx.tenant_id, p.artifact_id, max_bytes)
        .await?
        .ok_or(EngramError::NotFound {
            entity: "artifact",
            id: p.artifact_id.render(),
        })?;

    Ok(json!({
        "artifact_id": artifact.artifact_id,
        "kind": artifact.kind,
        "bytes_b64": BASE64.encode(&artifact.bytes),
        "returned_bytes": artifact.bytes.len(),
        "truncated": artifact.bytes.len() == max_bytes,
        "uri": artifact.uri,
        "metadata": artifact.metadata,
        "refs": artifact.refs.iter().map(|r| r.render()).collect::<Vec<_>>(),
        "created_at": artifact.created_at,
    }))
}
