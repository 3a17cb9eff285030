//! Enumerated types shared across the workspace.
//!
//! Every enum that crosses the store boundary carries `as_db_str` /
//! `from_db_str` so the wire and database renderings stay in one place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its database/wire string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub type_name: &'static str,
    pub input: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.type_name, self.input)
    }
}

impl std::error::Error for EnumParseError {}

macro_rules! db_str_enum {
    ($name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        impl $name {
            /// Convert to database/wire string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str),+
                }
            }

            /// Parse from database/wire string representation.
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                match s {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(EnumParseError {
                        type_name: stringify!($name),
                        input: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// ACTORS AND EVENT KINDS
// ============================================================================

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
    Tool,
}

db_str_enum!(ActorKind {
    Human => "human",
    Agent => "agent",
    Tool => "tool",
});

/// Kind of interaction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolCall,
    ToolResult,
    Decision,
    TaskUpdate,
    ArtifactRef,
}

db_str_enum!(EventKind {
    Message => "message",
    ToolCall => "tool_call",
    ToolResult => "tool_result",
    Decision => "decision",
    TaskUpdate => "task_update",
    ArtifactRef => "artifact_ref",
});

impl EventKind {
    /// Base importance weight used by the Recorder's heuristic.
    /// decision > task > tool_result > message.
    pub fn importance_weight(&self) -> f32 {
        match self {
            EventKind::Decision => 0.8,
            EventKind::TaskUpdate => 0.6,
            EventKind::ToolResult => 0.4,
            EventKind::ArtifactRef => 0.4,
            EventKind::ToolCall => 0.3,
            EventKind::Message => 0.25,
        }
    }
}

// ============================================================================
// SENSITIVITY AND CHANNELS
// ============================================================================

/// Sensitivity classification of a record.
///
/// Variant order matters: `None < Low < High < Secret`, so channel policy
/// checks can compare directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    None,
    Low,
    High,
    Secret,
}

db_str_enum!(Sensitivity {
    None => "none",
    Low => "low",
    High => "high",
    Secret => "secret",
});

/// Visibility channel of a record or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Private,
    Public,
    Team,
    Agent,
}

db_str_enum!(Channel {
    Private => "private",
    Public => "public",
    Team => "team",
    Agent => "agent",
});

impl Channel {
    /// Default maximum sensitivity loadable under this channel.
    /// Secrets are never loadable under any channel.
    pub fn default_max_sensitivity(&self) -> Sensitivity {
        match self {
            Channel::Private | Channel::Team => Sensitivity::High,
            Channel::Public | Channel::Agent => Sensitivity::Low,
        }
    }

    /// Whether the preferences view is suppressed under this channel.
    pub fn suppresses_preferences(&self) -> bool {
        matches!(self, Channel::Public | Channel::Agent)
    }
}

// ============================================================================
// DECISIONS AND TASKS
// ============================================================================

/// Lifecycle status of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Superseded,
}

db_str_enum!(DecisionStatus {
    Active => "active",
    Superseded => "superseded",
});

/// Scope a decision applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionScope {
    Project,
    User,
    Global,
}

db_str_enum!(DecisionScope {
    Project => "project",
    User => "user",
    Global => "global",
});

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Doing,
    Done,
}

db_str_enum!(TaskStatus {
    Open => "open",
    Doing => "doing",
    Done => "done",
});

impl TaskStatus {
    /// Whether the task still shows up in the active task set.
    pub fn is_open(&self) -> bool {
        !matches!(self, TaskStatus::Done)
    }
}

// ============================================================================
// HANDOFF COMPRESSION
// ============================================================================

/// Compression tier of a handoff. Handoffs only move forward through tiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    Full,
    Summary,
    QuickRef,
    Integrated,
}

db_str_enum!(CompressionLevel {
    Full => "full",
    Summary => "summary",
    QuickRef => "quick_ref",
    Integrated => "integrated",
});

// ============================================================================
// CAPSULES
// ============================================================================

/// Lifecycle status of a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleStatus {
    Active,
    Revoked,
}

db_str_enum!(CapsuleStatus {
    Active => "active",
    Revoked => "revoked",
});

// ============================================================================
// MEMORY EDITS
// ============================================================================

/// Surgical operation on existing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    Retract,
    Amend,
    Quarantine,
    Attenuate,
    Block,
}

db_str_enum!(EditOp {
    Retract => "retract",
    Amend => "amend",
    Quarantine => "quarantine",
    Attenuate => "attenuate",
    Block => "block",
});

/// Review status of a memory edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditStatus {
    Pending,
    Approved,
    Rejected,
}

db_str_enum!(EditStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Who proposed a memory edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proposer {
    Human,
    Agent,
}

db_str_enum!(Proposer {
    Human => "human",
    Agent => "agent",
});

// ============================================================================
// BUNDLE ASSEMBLY
// ============================================================================

/// Named sections of an Active Context Bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionName {
    Identity,
    Rules,
    TaskState,
    RelevantDecisions,
    RetrievedEvidence,
    RecentWindow,
    ToolState,
}

db_str_enum!(SectionName {
    Identity => "identity",
    Rules => "rules",
    TaskState => "task_state",
    RelevantDecisions => "relevant_decisions",
    RetrievedEvidence => "retrieved_evidence",
    RecentWindow => "recent_window",
    ToolState => "tool_state",
});

/// Why a candidate was left out of the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    Budget,
    Privacy,
    Dedupe,
    TruncatedToolOutput,
    MissingRefs,
    Deadline,
}

db_str_enum!(OmissionReason {
    Budget => "budget",
    Privacy => "privacy",
    Dedupe => "dedupe",
    TruncatedToolOutput => "truncated_tool_output",
    MissingRefs => "missing_refs",
    Deadline => "deadline",
});

/// Request intent; fast-path intents skip retrieval entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intent(String);

impl Intent {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Intents that take the hotset-plus-recent fast path.
    pub fn is_fast_path(&self) -> bool {
        matches!(self.0.as_str(), "continue" | "simple_reply" | "ack")
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Intent {
    fn default() -> Self {
        Self("general".to_string())
    }
}

// ============================================================================
// CONSOLIDATION
// ============================================================================

/// Consolidation job selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Identity,
    Handoffs,
    Decisions,
    All,
}

db_str_enum!(JobType {
    Identity => "identity",
    Handoffs => "handoffs",
    Decisions => "decisions",
    All => "all",
});

// ============================================================================
// AUDIT
// ============================================================================

/// Outcome recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Partial,
}

db_str_enum!(AuditOutcome {
    Success => "success",
    Failure => "failure",
    Partial => "partial",
});

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_str_roundtrip() {
        for kind in [
            EventKind::Message,
            EventKind::ToolCall,
            EventKind::ToolResult,
            EventKind::Decision,
            EventKind::TaskUpdate,
            EventKind::ArtifactRef,
        ] {
            assert_eq!(EventKind::from_db_str(kind.as_db_str()).unwrap(), kind);
        }
        assert!(EventKind::from_db_str("bogus").is_err());
    }

    #[test]
    fn test_sensitivity_ordering() {
        assert!(Sensitivity::None < Sensitivity::Low);
        assert!(Sensitivity::Low < Sensitivity::High);
        assert!(Sensitivity::High < Sensitivity::Secret);
    }

    #[test]
    fn test_channel_default_matrix() {
        assert_eq!(Channel::Private.default_max_sensitivity(), Sensitivity::High);
        assert_eq!(Channel::Public.default_max_sensitivity(), Sensitivity::Low);
        assert_eq!(Channel::Team.default_max_sensitivity(), Sensitivity::High);
        assert_eq!(Channel::Agent.default_max_sensitivity(), Sensitivity::Low);
        assert!(Channel::Public.suppresses_preferences());
        assert!(!Channel::Private.suppresses_preferences());
    }

    #[test]
    fn test_kind_importance_ordering() {
        assert!(EventKind::Decision.importance_weight() > EventKind::TaskUpdate.importance_weight());
        assert!(EventKind::TaskUpdate.importance_weight() > EventKind::ToolResult.importance_weight());
        assert!(EventKind::ToolResult.importance_weight() > EventKind::Message.importance_weight());
    }

    #[test]
    fn test_intent_fast_path() {
        assert!(Intent::new("continue").is_fast_path());
        assert!(Intent::new("simple_reply").is_fast_path());
        assert!(Intent::new("ack").is_fast_path());
        assert!(!Intent::new("repo_onboarding").is_fast_path());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&EventKind::ToolResult).unwrap();
        assert_eq!(json, "\"tool_result\"");
        let json = serde_json::to_string(&OmissionReason::TruncatedToolOutput).unwrap();
        assert_eq!(json, "\"truncated_tool_output\"");
    }

    #[test]
    fn test_compression_level_ordering() {
        assert!(CompressionLevel::Full < CompressionLevel::Summary);
        assert!(CompressionLevel::Summary < CompressionLevel::QuickRef);
        assert!(CompressionLevel::QuickRef < CompressionLevel::Integrated);
    }
}
