//! Tool-output normalisation
//!
//! Every `tool_result` is reshaped into a bounded excerpt before storage.
//! Payloads over `max_bytes_per_tool_result_event` spill to an Artifact and
//! the event keeps only the excerpt plus a pointer.

use chrono::Utc;
use engram_core::{
    Artifact, ArtifactId, EngramError, EngramResult, ExcerptRange, MemoryIdType, MemoryRef,
    SessionId, TenantId, ToolExcerpt,
};

/// Outcome of normalising one tool result.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedToolResult {
    pub excerpt: ToolExcerpt,
    /// Present when the full payload was spilled out-of-band.
    pub artifact: Option<Artifact>,
}

/// Normalise a raw tool output into excerpt form.
///
/// `absolute_max_bytes` is the hard refusal bound (`oversize_payload` when
/// even buffering the payload is off the table); `excerpt_max_bytes` is the
/// spill threshold.
pub fn normalize_tool_result(
    tenant_id: &TenantId,
    session_id: &SessionId,
    tool: &str,
    path: Option<&str>,
    output: &str,
    excerpt_max_bytes: usize,
    absolute_max_bytes: usize,
) -> EngramResult<NormalizedToolResult> {
    if output.len() > absolute_max_bytes {
        return Err(EngramError::OversizePayload {
            bytes: output.len(),
            max_bytes: absolute_max_bytes,
        });
    }

    if output.len() <= excerpt_max_bytes {
        let line_count = output.lines().count().max(1) as u32;
        return Ok(NormalizedToolResult {
            excerpt: ToolExcerpt {
                tool: tool.to_string(),
                path: path.map(str::to_string),
                excerpt_text: output.to_string(),
                range: ExcerptRange::Lines {
                    start: 1,
                    end: line_count,
                },
                truncated: false,
                artifact_id: None,
            },
            artifact: None,
        });
    }

    // Oversized: keep a prefix excerpt, spill the whole payload.
    let excerpt_text = truncate_at_boundary(output, excerpt_max_bytes);
    let artifact_id = ArtifactId::generate();
    let artifact = Artifact {
        artifact_id,
        tenant_id: tenant_id.clone(),
        session_id: session_id.clone(),
        kind: "tool_output".to_string(),
        bytes: output.as_bytes().to_vec(),
        uri: None,
        metadata: serde_json::json!({
            "tool": tool,
            "path": path,
            "total_bytes": output.len(),
        }),
        refs: Vec::new(),
        created_at: Utc::now(),
    };

    Ok(NormalizedToolResult {
        excerpt: ToolExcerpt {
            tool: tool.to_string(),
            path: path.map(str::to_string),
            range: ExcerptRange::Bytes {
                start: 0,
                end: excerpt_text.len() as u64,
            },
            excerpt_text,
            truncated: true,
            artifact_id: Some(artifact_id),
        },
        artifact: Some(artifact),
    })
}

/// Truncate at the last newline before `max_bytes` when one exists in the
/// latter half, otherwise at the nearest char boundary.
fn truncate_at_boundary(text: &str, max_bytes: usize) -> String {
    let mut end = max_bytes.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let prefix = &text[..end];
    if let Some(pos) = prefix.rfind('\n') {
        if pos > max_bytes / 2 {
            return prefix[..pos].to_string();
        }
    }
    prefix.to_string()
}

/// Make sure the spilled artifact later links back to the recording event.
pub fn link_artifact(artifact: &mut Artifact, event_ref: MemoryRef) {
    artifact.refs.push(event_ref);
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::EventId;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn session() -> SessionId {
        SessionId::new("s1").unwrap()
    }

    #[test]
    fn test_small_output_kept_inline() {
        let result = normalize_tool_result(
            &tenant(),
            &session(),
            "read_file",
            Some("README.md"),
            "line one\nline two",
            1024,
            8192,
        )
        .unwrap();
        assert!(result.artifact.is_none());
        assert!(!result.excerpt.truncated);
        assert_eq!(result.excerpt.excerpt_text, "line one\nline two");
        assert_eq!(
            result.excerpt.range,
            ExcerptRange::Lines { start: 1, end: 2 }
        );
    }

    #[test]
    fn test_oversized_output_spills_to_artifact() {
        let output = "data line\n".repeat(200); // 2000 bytes
        let result = normalize_tool_result(
            &tenant(),
            &session(),
            "run_query",
            None,
            &output,
            512,
            8192,
        )
        .unwrap();
        let artifact = result.artifact.expect("artifact expected");
        assert_eq!(artifact.bytes.len(), output.len());
        assert!(result.excerpt.truncated);
        assert_eq!(result.excerpt.artifact_id, Some(artifact.artifact_id));
        assert!(result.excerpt.excerpt_text.len() <= 512);
        // Excerpt ends on a line boundary.
        assert!(!result.excerpt.excerpt_text.ends_with('\n'));
        assert!(output.starts_with(&result.excerpt.excerpt_text));
    }

    #[test]
    fn test_absolute_bound_rejects() {
        let output = "x".repeat(10_000);
        let err = normalize_tool_result(
            &tenant(),
            &session(),
            "dump",
            None,
            &output,
            512,
            8_192,
        )
        .unwrap_err();
        assert!(matches!(err, EngramError::OversizePayload { .. }));
    }

    #[test]
    fn test_link_artifact_adds_ref() {
        let output = "y".repeat(2000);
        let mut result = normalize_tool_result(
            &tenant(),
            &session(),
            "read_file",
            None,
            &output,
            512,
            8192,
        )
        .unwrap();
        let event_id = EventId::generate();
        let artifact = result.artifact.as_mut().unwrap();
        link_artifact(artifact, MemoryRef::Event(event_id));
        assert_eq!(artifact.refs, vec![MemoryRef::Event(event_id)]);
    }
}
