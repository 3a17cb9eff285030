//! Event content payloads.
//!
//! Content is a tagged variant dispatched by the `kind` field - the Recorder
//! selects its normaliser from the variant, never from dynamic lookup.
//! `DraftContent` is the ingestion shape (tool results arrive raw and
//! possibly huge); `EventContent` is the stored shape (tool results are
//! always a bounded excerpt).

use crate::{ArtifactId, DecisionId, DecisionScope, EventKind, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ============================================================================
// SHARED PAYLOAD PIECES
// ============================================================================

/// Decision payload carried by a `decision` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContent {
    pub decision: String,
    pub rationale: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub consequences: Vec<String>,
    pub scope: DecisionScope,
    /// Predecessor this decision supersedes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<DecisionId>,
}

/// Task payload carried by a `task_update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdateContent {
    /// Existing task to update; absent means a new task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Byte or line range of a tool-output excerpt within its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "unit")]
pub enum ExcerptRange {
    Bytes { start: u64, end: u64 },
    Lines { start: u32, end: u32 },
}

/// Normalised tool output: the only shape a `tool_result` event may store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExcerpt {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub excerpt_text: String,
    pub range: ExcerptRange,
    pub truncated: bool,
    /// Set when the full payload was spilled to an artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<ArtifactId>,
}

// ============================================================================
// DRAFT CONTENT (ingestion shape)
// ============================================================================

/// Content as submitted to `record_event`, before normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DraftContent {
    Message {
        text: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        args: JsonValue,
    },
    /// Raw tool output; may exceed every bound. The Recorder excerpts it.
    ToolResult {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        output: String,
    },
    Decision(DecisionContent),
    TaskUpdate(TaskUpdateContent),
    ArtifactRef {
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl DraftContent {
    /// The event kind this content implies.
    pub fn kind(&self) -> EventKind {
        match self {
            DraftContent::Message { .. } => EventKind::Message,
            DraftContent::ToolCall { .. } => EventKind::ToolCall,
            DraftContent::ToolResult { .. } => EventKind::ToolResult,
            DraftContent::Decision(_) => EventKind::Decision,
            DraftContent::TaskUpdate(_) => EventKind::TaskUpdate,
            DraftContent::ArtifactRef { .. } => EventKind::ArtifactRef,
        }
    }
}

// ============================================================================
// EVENT CONTENT (stored shape)
// ============================================================================

/// Content as persisted on an event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventContent {
    Message {
        text: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        args: JsonValue,
    },
    ToolResult(ToolExcerpt),
    Decision(DecisionContent),
    TaskUpdate(TaskUpdateContent),
    ArtifactRef {
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl EventContent {
    /// The event kind this content implies.
    pub fn kind(&self) -> EventKind {
        match self {
            EventContent::Message { .. } => EventKind::Message,
            EventContent::ToolCall { .. } => EventKind::ToolCall,
            EventContent::ToolResult(_) => EventKind::ToolResult,
            EventContent::Decision(_) => EventKind::Decision,
            EventContent::TaskUpdate(_) => EventKind::TaskUpdate,
            EventContent::ArtifactRef { .. } => EventKind::ArtifactRef,
        }
    }

    /// The retrievable text of this content, used for chunk derivation.
    pub fn excerpt_text(&self) -> String {
        match self {
            EventContent::Message { text } => text.clone(),
            EventContent::ToolCall { tool, args } => {
                format!("call {}: {}", tool, args)
            }
            EventContent::ToolResult(excerpt) => excerpt.excerpt_text.clone(),
            EventContent::Decision(d) => {
                let mut text = format!("{}\n{}", d.decision, d.rationale);
                if !d.constraints.is_empty() {
                    text.push('\n');
                    text.push_str(&d.constraints.join("; "));
                }
                text
            }
            EventContent::TaskUpdate(t) => match &t.details {
                Some(details) => format!("[{}] {}\n{}", t.status, t.title, details),
                None => format!("[{}] {}", t.status, t.title),
            },
            EventContent::ArtifactRef { artifact_id, note } => match note {
                Some(note) => format!("artifact {}: {}", artifact_id, note),
                None => format!("artifact {}", artifact_id),
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryIdType;

    #[test]
    fn test_draft_kind_dispatch() {
        let draft = DraftContent::Message {
            text: "hello".to_string(),
        };
        assert_eq!(draft.kind(), EventKind::Message);

        let draft = DraftContent::ToolResult {
            tool: "read_file".to_string(),
            path: Some("README.md".to_string()),
            output: "contents".to_string(),
        };
        assert_eq!(draft.kind(), EventKind::ToolResult);
    }

    #[test]
    fn test_content_serde_tag() {
        let content = EventContent::Message {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn test_tool_excerpt_serde() {
        let excerpt = ToolExcerpt {
            tool: "read_file".to_string(),
            path: Some("src/main.rs".to_string()),
            excerpt_text: "fn main() {}".to_string(),
            range: ExcerptRange::Bytes { start: 0, end: 12 },
            truncated: false,
            artifact_id: None,
        };
        let content = EventContent::ToolResult(excerpt.clone());
        let json = serde_json::to_string(&content).unwrap();
        let back: EventContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventContent::ToolResult(excerpt));
    }

    #[test]
    fn test_excerpt_text_per_kind() {
        let decision = EventContent::Decision(DecisionContent {
            decision: "use postgres".to_string(),
            rationale: "pooling".to_string(),
            constraints: vec!["no raw sql in routes".to_string()],
            alternatives: vec![],
            consequences: vec![],
            scope: DecisionScope::Project,
            supersedes: None,
        });
        let text = decision.excerpt_text();
        assert!(text.contains("use postgres"));
        assert!(text.contains("no raw sql in routes"));

        let artifact = EventContent::ArtifactRef {
            artifact_id: ArtifactId::nil(),
            note: None,
        };
        assert!(artifact.excerpt_text().starts_with("artifact art_"));
    }
}
