//! Core entity structures
//!
//! Rows as they exist in the store. Construction and mutation rules live in
//! the Recorder and Consolidator; these are plain data.

use crate::{
    AgentId, ArtifactId, AuditOutcome, CapsuleId, CapsuleStatus, Channel, ChunkId,
    CompressionLevel, ContentHash, DecisionId, DecisionScope, DecisionStatus, EditId, EditOp,
    EditStatus, EventContent, EventId, EventKind, HandoffId, MemoryRef, NoteId, PrincipleId,
    Proposer, Sensitivity, SessionId, TaskId, TaskStatus, TenantId, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Who produced an event: actor kind plus an opaque identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: crate::ActorKind,
    pub id: String,
}

/// Event - ground truth of one interaction step. Never mutated after insert;
/// deleted only by retention/GDPR operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub actor: Actor,
    pub kind: EventKind,
    pub sensitivity: Sensitivity,
    pub tags: Vec<String>,
    pub content: EventContent,
    /// Event/chunk ids this event cites.
    pub refs: Vec<MemoryRef>,
    pub content_hash: ContentHash,
    pub created_at: Timestamp,
}

/// Chunk - the retrieval unit derived from an event.
///
/// Invariant: `chunk.tenant_id == event(chunk.event_id).tenant_id` and
/// `token_est > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub kind: EventKind,
    pub sensitivity: Sensitivity,
    pub tags: Vec<String>,
    /// Position of this chunk within its event (0-based).
    pub seq: i32,
    /// Bounded text excerpt.
    pub text: String,
    /// Precomputed deterministic token estimate.
    pub token_est: i32,
    /// Importance in [0, 1]; memory edits may attenuate or amend it.
    pub importance: f32,
    pub pinned: bool,
    /// Flipped off by retract/quarantine edits; inactive chunks never surface.
    pub active: bool,
    /// Normalised query terms, precomputed at derivation (the lexical index).
    pub terms: Vec<String>,
    pub content_hash: ContentHash,
    /// 64-bit SimHash over the normalised token stream.
    pub simhash: u64,
    /// Backfilled asynchronously when an embedding provider is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: Timestamp,
}

/// Decision - first-class, traceable choice.
///
/// Invariant: `refs` is non-empty; superseding flips the predecessor to
/// `superseded` in the same transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: DecisionId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub status: DecisionStatus,
    pub scope: DecisionScope,
    pub decision: String,
    pub rationale: String,
    pub constraints: Vec<String>,
    pub alternatives: Vec<String>,
    pub consequences: Vec<String>,
    /// Supporting event/chunk ids, plus the superseded decision when present.
    pub refs: Vec<MemoryRef>,
    /// Pinned decisions are exempt from archival.
    pub pinned: bool,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<Timestamp>,
}

impl Decision {
    /// Predecessor decision id, if this decision superseded one.
    pub fn superseded_decision(&self) -> Option<DecisionId> {
        self.refs.iter().find_map(MemoryRef::as_decision)
    }
}

/// Task - cross-session work item, closed explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub status: TaskStatus,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub refs: Vec<MemoryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Artifact - out-of-band storage for oversized tool output or blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub kind: String,
    /// Inline bytes; empty when `uri` points at external storage.
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
    pub refs: Vec<MemoryRef>,
    pub created_at: Timestamp,
}

impl Artifact {
    /// Total stored size in bytes (inline payload only).
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Handoff - structured post-session continuity record.
///
/// Only handoffs with a non-empty `becoming` participate in the identity
/// thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub handoff_id: HandoffId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub experienced: String,
    pub noticed: String,
    pub learned: String,
    pub story: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub becoming: Option<String>,
    pub remember: String,
    /// Significance in [0, 1]; high-significance handoffs also emit a decision.
    pub significance: f32,
    pub tags: Vec<String>,
    pub with_whom: Vec<String>,
    pub compression_level: CompressionLevel,
    /// Compact text computed at the `summary` transition (~500 tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Compact text computed at the `quick_ref` transition (~100 tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_ref: Option<String>,
    /// Source refs; compression never drops these.
    pub refs: Vec<MemoryRef>,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidated_at: Option<Timestamp>,
}

impl Handoff {
    /// Whether this handoff belongs to the identity thread.
    pub fn in_identity_thread(&self) -> bool {
        self.becoming.as_deref().is_some_and(|b| !b.trim().is_empty())
    }

    /// The most compact text available for this handoff's current tier.
    pub fn tier_text(&self) -> Option<&str> {
        match self.compression_level {
            CompressionLevel::Full => None,
            CompressionLevel::Summary => self.summary.as_deref(),
            CompressionLevel::QuickRef | CompressionLevel::Integrated => {
                self.quick_ref.as_deref().or(self.summary.as_deref())
            }
        }
    }
}

/// SemanticPrinciple - timeless knowledge extracted from recurring handoff
/// themes. Confidence grows with reinforcement and decays over idle time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticPrinciple {
    pub principle_id: PrincipleId,
    pub tenant_id: TenantId,
    pub principle: String,
    pub context: String,
    pub category: String,
    pub confidence: f32,
    pub source_handoff_ids: Vec<HandoffId>,
    pub source_count: i32,
    pub last_reinforced_at: Timestamp,
    pub created_at: Timestamp,
}

/// KnowledgeNote - curated note shared into the retrieval pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNote {
    pub note_id: NoteId,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub sensitivity: Sensitivity,
    pub text: String,
    pub tags: Vec<String>,
    pub with_whom: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: Timestamp,
}

/// Items shared by a capsule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapsuleItems {
    #[serde(default)]
    pub chunks: Vec<ChunkId>,
    #[serde(default)]
    pub decisions: Vec<DecisionId>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactId>,
}

impl CapsuleItems {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.decisions.is_empty() && self.artifacts.is_empty()
    }
}

/// Capsule - curated, audience-scoped, TTL-bounded cross-agent share packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub capsule_id: CapsuleId,
    pub tenant_id: TenantId,
    pub scope: String,
    pub subject_type: String,
    pub subject_id: String,
    pub author_agent_id: AgentId,
    pub audience_agent_ids: Vec<AgentId>,
    pub items: CapsuleItems,
    pub risks: Vec<String>,
    pub ttl_days: i32,
    pub status: CapsuleStatus,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Capsule {
    /// Whether `agent` may read this capsule at time `now`.
    pub fn readable_by(&self, agent: &AgentId, now: Timestamp) -> bool {
        self.status == CapsuleStatus::Active
            && now < self.expires_at
            && self.audience_agent_ids.contains(agent)
    }
}

/// Patch carried by an `amend`/`attenuate`/`block` memory edit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EditPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance_delta: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

/// MemoryEdit - explicit surgical operation on existing memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdit {
    pub edit_id: EditId,
    pub tenant_id: TenantId,
    pub op: EditOp,
    pub target: MemoryRef,
    pub reason: String,
    pub proposed_by: Proposer,
    pub status: EditStatus,
    #[serde(default)]
    pub patch: EditPatch,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

impl MemoryEdit {
    /// Validate the op/patch pairing invariants.
    pub fn patch_is_valid(&self) -> bool {
        match self.op {
            EditOp::Amend => self.patch.text.is_some() || self.patch.importance.is_some(),
            EditOp::Attenuate => self.patch.importance_delta.is_some(),
            EditOp::Block => self.patch.channel.is_some(),
            EditOp::Retract | EditOp::Quarantine => true,
        }
    }
}

/// AuditEntry - append-only record of a security-relevant action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tenant_id: TenantId,
    pub event_type: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub actor: String,
    #[serde(default)]
    pub details: JsonValue,
    pub created_at: Timestamp,
}

/// Report written by every consolidation job, stored for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub tenant_id: TenantId,
    pub job_type: crate::JobType,
    pub items_processed: i64,
    pub items_affected: i64,
    pub tokens_saved: i64,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Timestamp,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryIdType;
    use chrono::{Duration, Utc};

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    #[test]
    fn test_identity_thread_requires_becoming() {
        let mut handoff = Handoff {
            handoff_id: HandoffId::generate(),
            tenant_id: tenant(),
            session_id: SessionId::new("s1").unwrap(),
            agent_id: AgentId::new("A").unwrap(),
            experienced: "built the retrieval layer".to_string(),
            noticed: "lexical scoring dominates".to_string(),
            learned: "cap candidate pools early".to_string(),
            story: "a long day".to_string(),
            becoming: None,
            remember: "check the pool cap".to_string(),
            significance: 0.4,
            tags: vec![],
            with_whom: vec![],
            compression_level: CompressionLevel::Full,
            summary: None,
            quick_ref: None,
            refs: vec![],
            created_at: Utc::now(),
            consolidated_at: None,
        };
        assert!(!handoff.in_identity_thread());
        handoff.becoming = Some("  ".to_string());
        assert!(!handoff.in_identity_thread());
        handoff.becoming = Some("more careful with budgets".to_string());
        assert!(handoff.in_identity_thread());
    }

    #[test]
    fn test_capsule_readability() {
        let now = Utc::now();
        let audience = AgentId::new("B").unwrap();
        let capsule = Capsule {
            capsule_id: CapsuleId::generate(),
            tenant_id: tenant(),
            scope: "project".to_string(),
            subject_type: "repo".to_string(),
            subject_id: "engram".to_string(),
            author_agent_id: AgentId::new("A").unwrap(),
            audience_agent_ids: vec![audience.clone()],
            items: CapsuleItems::default(),
            risks: vec![],
            ttl_days: 7,
            status: CapsuleStatus::Active,
            created_at: now,
            expires_at: now + Duration::days(7),
        };

        assert!(capsule.readable_by(&audience, now));
        assert!(!capsule.readable_by(&AgentId::new("C").unwrap(), now));
        assert!(!capsule.readable_by(&audience, now + Duration::days(8)));

        let revoked = Capsule {
            status: CapsuleStatus::Revoked,
            ..capsule
        };
        assert!(!revoked.readable_by(&audience, now));
    }

    #[test]
    fn test_edit_patch_invariants() {
        let base = MemoryEdit {
            edit_id: EditId::generate(),
            tenant_id: tenant(),
            op: EditOp::Amend,
            target: MemoryRef::Chunk(ChunkId::generate()),
            reason: "wrong fact".to_string(),
            proposed_by: Proposer::Human,
            status: EditStatus::Pending,
            patch: EditPatch::default(),
            created_at: Utc::now(),
            resolved_at: None,
        };
        assert!(!base.patch_is_valid());

        let amend = MemoryEdit {
            patch: EditPatch {
                text: Some("corrected".to_string()),
                ..EditPatch::default()
            },
            ..base.clone()
        };
        assert!(amend.patch_is_valid());

        let attenuate = MemoryEdit {
            op: EditOp::Attenuate,
            patch: EditPatch {
                importance_delta: Some(-0.2),
                ..EditPatch::default()
            },
            ..base.clone()
        };
        assert!(attenuate.patch_is_valid());

        let retract = MemoryEdit {
            op: EditOp::Retract,
            ..base
        };
        assert!(retract.patch_is_valid());
    }

    #[test]
    fn test_superseded_decision_lookup() {
        let predecessor = DecisionId::generate();
        let decision = Decision {
            decision_id: DecisionId::generate(),
            tenant_id: tenant(),
            session_id: SessionId::new("s1").unwrap(),
            agent_id: AgentId::new("A").unwrap(),
            channel: Channel::Private,
            status: DecisionStatus::Active,
            scope: DecisionScope::Project,
            decision: "store secrets encrypted".to_string(),
            rationale: "policy changed".to_string(),
            constraints: vec![],
            alternatives: vec![],
            consequences: vec![],
            refs: vec![
                MemoryRef::Event(EventId::generate()),
                MemoryRef::Decision(predecessor),
            ],
            pinned: false,
            created_at: Utc::now(),
            superseded_at: None,
        };
        assert_eq!(decision.superseded_decision(), Some(predecessor));
    }
}
