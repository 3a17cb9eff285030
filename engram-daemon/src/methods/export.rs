//! Portability: export_thread, export_all
//!
//! Exports are assembled from ground truth (events, decisions, handoffs,
//! notes), never from summaries.

use crate::context::RequestContext;
use crate::rpc::parse_params;
use crate::state::AppState;
use engram_core::{EngramError, EngramResult, Event};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

const EXPORT_EVENTS_MAX: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExportFormat {
    Json,
    Markdown,
}

#[derive(Debug, Deserialize)]
struct ExportThreadParams {
    #[serde(default = "default_format")]
    format: ExportFormat,
}

fn default_format() -> ExportFormat {
    ExportFormat::Json
}

/// Export one session's events, oldest-first.
pub async fn export_thread(
    state: &AppState,
    ctx: &RequestContext,
    params: &JsonValue,
) -> EngramResult<JsonValue> {
    let p: ExportThreadParams = parse_params(params)?;
    let mut events = state
        .store
        .list_session_events(&ctx.tenant_id, &ctx.session_id, EXPORT_EVENTS_MAX)
        .await?;
    events.reverse(); // listing is newest-first; exports read forward

    match p.format {
        ExportFormat::Json => Ok(json!({
            "format": "json",
            "session_id": ctx.session_id,
            "events": events,
        })),
        ExportFormat::Markdown => Ok(json!({
            "format": "markdown",
            "session_id": ctx.session_id,
            "content": render_markdown(&ctx.session_id.to_string(), &events),
        })),
    }
}

/// Export everything the tenant owns as JSON.
pub async fn export_all(state: &AppState, ctx: &RequestContext) -> EngramResult<JsonValue> {
    let events = state
        .store
        .list_events(&ctx.tenant_id, EXPORT_EVENTS_MAX)
        .await?;
    let decisions = state.store.list_active_decisions(&ctx.tenant_id, 1000).await?;
    let handoffs = state.store.list_handoffs(&ctx.tenant_id, 1000, None).await?;
    let notes = state.store.list_notes(&ctx.tenant_id, None, 1000).await?;
    let principles = state.store.list_principles(&ctx.tenant_id).await?;
    let truncated = events.len() == EXPORT_EVENTS_MAX;

    if truncated {
        tracing::warn!(
            tenant_id = %ctx.tenant_id,
            "export_all truncated at the event cap"
        );
    }
    serde_json::to_value(json!({
        "tenant_id": ctx.tenant_id,
        "events": events,
        "active_decisions": decisions,
        "handoffs": handoffs,
        "knowledge_notes": notes,
        "semantic_principles": principles,
        "truncated": truncated,
    }))
    .map_err(|e| EngramError::Fatal {
        reason: e.to_string(),
    })
}

fn render_markdown(session_id: &str, events: &[Event]) -> String {
    let mut out = format!("# Session {}\n", session_id);
    for event in events {
        out.push_str(&format!(
            "\n## {} - {} ({})\n\n{}\n",
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.kind,
            event.actor.id,
            event.content.excerpt_text()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_test_utils::event_fixture;

    #[test]
    fn test_markdown_rendering() {
        let events = vec![
            event_fixture("t1", "s1", "first message"),
            event_fixture("t1", "s1", "second message"),
        ];
        let md = render_markdown("s1", &events);
        assert!(md.starts_with("# Session s1"));
        assert!(md.contains("first message"));
        assert!(md.contains("second message"));
        assert!(md.contains("## "));
    }
}
