//! Engram Storage - Store Trait and Implementations
//!
//! Defines the storage abstraction for Engram entities. Every read takes the
//! tenant id and filters by it; there is no unscoped read path. Two
//! implementations ship: `MemoryStore` (tests, WAL replay targets) and
//! `PgStore` (production, deadpool-postgres).

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgConfig, PgStore};

use async_trait::async_trait;
use engram_core::{
    AgentId, Artifact, ArtifactId, AuditEntry, Capsule, CapsuleId, CapsuleStatus, Channel, Chunk,
    ChunkId, CompressionLevel, ConsolidationReport, ContentHash, Decision, DecisionId,
    DecisionStatus, EditId, EditStatus, EngramResult, Event, EventId, Handoff, HandoffId,
    KnowledgeNote, MemoryEdit, NoteId, SemanticPrinciple, SessionId, Task, TaskId, TenantId,
    Timestamp,
};
use std::collections::HashSet;

// ============================================================================
// WRITE PAYLOADS
// ============================================================================

/// Everything `append_event` persists in one atomic transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBundle {
    pub event: Event,
    pub chunks: Vec<Chunk>,
    /// Decision row derived from a `decision` event.
    pub decision: Option<Decision>,
    /// Predecessor flipped to `superseded` alongside the insert.
    pub supersedes: Option<DecisionId>,
    /// Task row upserted from a `task_update` event.
    pub task: Option<Task>,
    /// Artifact spilled from an oversized tool result.
    pub artifact: Option<Artifact>,
}

/// Patch applied to a chunk by an approved memory edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPatch {
    pub text: Option<String>,
    pub token_est: Option<i32>,
    pub terms: Option<Vec<String>>,
    pub content_hash: Option<ContentHash>,
    pub simhash: Option<u64>,
    pub importance: Option<f32>,
    pub importance_delta: Option<f32>,
    pub channel: Option<Channel>,
    pub active: Option<bool>,
}

/// Compression fields updated by a handoff tier transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffCompressionUpdate {
    pub compression_level: Option<CompressionLevel>,
    pub summary: Option<String>,
    pub quick_ref: Option<String>,
    pub consolidated_at: Option<Timestamp>,
    /// Set when the `integrated` transition drops the full text fields.
    pub clear_full_fields: bool,
}

/// Aggregate compression statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompressionStats {
    pub handoffs_total: i64,
    pub handoffs_full: i64,
    pub handoffs_summary: i64,
    pub handoffs_quick_ref: i64,
    pub handoffs_integrated: i64,
    pub principles_total: i64,
    pub decisions_active: i64,
    pub decisions_superseded: i64,
    pub tokens_saved_estimate: i64,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Storage trait for Engram entities.
///
/// Reads return newest-first unless documented otherwise. Every method takes
/// the request tenant; implementations must never return a row of another
/// tenant.
#[async_trait]
pub trait Store: Send + Sync {
    // === Events ===

    /// Insert an event bundle atomically: the event, its chunks, any derived
    /// decision/task row, any spilled artifact, and the predecessor-decision
    /// status flip. Either everything commits or nothing does.
    async fn insert_event_bundle(&self, bundle: &EventBundle) -> EngramResult<()>;

    async fn get_event(&self, tenant: &TenantId, id: EventId) -> EngramResult<Option<Event>>;

    /// Events for a session, newest-first, bounded.
    async fn list_session_events(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: usize,
    ) -> EngramResult<Vec<Event>>;

    /// All events for a tenant, oldest-first, bounded (export path).
    async fn list_events(&self, tenant: &TenantId, limit: usize) -> EngramResult<Vec<Event>>;

    // === Chunks ===

    async fn get_chunk(&self, tenant: &TenantId, id: ChunkId) -> EngramResult<Option<Chunk>>;

    /// The recency tail: newest active chunks for the tenant.
    async fn list_recent_chunks(&self, tenant: &TenantId, limit: usize)
        -> EngramResult<Vec<Chunk>>;

    /// The session hot set: newest active chunks in one session.
    async fn list_session_chunks(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>>;

    async fn list_pinned_chunks(&self, tenant: &TenantId, limit: usize)
        -> EngramResult<Vec<Chunk>>;

    /// Active chunks matching at least one normalised term, ordered by match
    /// count then recency.
    async fn search_chunks_lexical(
        &self,
        tenant: &TenantId,
        terms: &[String],
        limit: usize,
    ) -> EngramResult<Vec<Chunk>>;

    /// Active chunks carrying at least one of `tags` (tag-head candidates).
    async fn list_chunks_by_tags(
        &self,
        tenant: &TenantId,
        tags: &[String],
        limit: usize,
    ) -> EngramResult<Vec<Chunk>>;

    /// Nearest chunks by embedding cosine distance; empty when the backend
    /// has no vectors.
    async fn search_chunks_vector(
        &self,
        tenant: &TenantId,
        query: &[f32],
        limit: usize,
    ) -> EngramResult<Vec<(ChunkId, f32)>>;

    async fn update_chunk_embedding(
        &self,
        tenant: &TenantId,
        id: ChunkId,
        embedding: &[f32],
    ) -> EngramResult<()>;

    async fn apply_chunk_patch(
        &self,
        tenant: &TenantId,
        id: ChunkId,
        patch: &ChunkPatch,
    ) -> EngramResult<()>;

    async fn count_chunks(&self, tenant: &TenantId) -> EngramResult<i64>;

    /// Chunk ids referenced by active capsules whose audience excludes
    /// `agent`. Retrieval suppresses these before scoring.
    async fn restricted_chunk_ids(
        &self,
        tenant: &TenantId,
        agent: &AgentId,
    ) -> EngramResult<HashSet<ChunkId>>;

    // === Decisions ===

    async fn get_decision(
        &self,
        tenant: &TenantId,
        id: DecisionId,
    ) -> EngramResult<Option<Decision>>;

    /// Active decisions, newest-first, bounded top-M.
    async fn list_active_decisions(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Decision>>;

    async fn set_decision_status(
        &self,
        tenant: &TenantId,
        id: DecisionId,
        status: DecisionStatus,
        superseded_at: Option<Timestamp>,
    ) -> EngramResult<()>;

    /// Active, unpinned decisions created before `cutoff` (archival sweep).
    async fn list_decisions_for_archive(
        &self,
        tenant: &TenantId,
        cutoff: Timestamp,
    ) -> EngramResult<Vec<Decision>>;

    // === Tasks ===

    async fn get_task(&self, tenant: &TenantId, id: TaskId) -> EngramResult<Option<Task>>;

    /// Open and doing tasks, newest-updated first.
    async fn list_open_tasks(&self, tenant: &TenantId, limit: usize) -> EngramResult<Vec<Task>>;

    // === Artifacts ===

    async fn insert_artifact(&self, artifact: &Artifact) -> EngramResult<()>;

    /// Fetch an artifact, with inline bytes truncated to `max_bytes`.
    async fn get_artifact(
        &self,
        tenant: &TenantId,
        id: ArtifactId,
        max_bytes: usize,
    ) -> EngramResult<Option<Artifact>>;

    // === Handoffs ===

    async fn insert_handoff(&self, handoff: &Handoff) -> EngramResult<()>;

    async fn get_handoff(&self, tenant: &TenantId, id: HandoffId)
        -> EngramResult<Option<Handoff>>;

    /// Most recent handoff for the tenant, optionally scoped to one agent.
    async fn get_latest_handoff(
        &self,
        tenant: &TenantId,
        agent: Option<&AgentId>,
    ) -> EngramResult<Option<Handoff>>;

    /// Handoffs newest-first; `before` pages backwards in time.
    async fn list_handoffs(
        &self,
        tenant: &TenantId,
        limit: usize,
        before: Option<Timestamp>,
    ) -> EngramResult<Vec<Handoff>>;

    /// Handoffs with a non-empty `becoming`, newest-first.
    async fn list_identity_thread(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Handoff>>;

    /// Handoffs sitting at `level` that were created before `cutoff`.
    async fn list_handoffs_at_level(
        &self,
        tenant: &TenantId,
        level: CompressionLevel,
        cutoff: Timestamp,
    ) -> EngramResult<Vec<Handoff>>;

    async fn update_handoff_compression(
        &self,
        tenant: &TenantId,
        id: HandoffId,
        update: &HandoffCompressionUpdate,
    ) -> EngramResult<()>;

    // === Semantic principles ===

    async fn list_principles(&self, tenant: &TenantId) -> EngramResult<Vec<SemanticPrinciple>>;

    /// Insert or replace a principle row by id.
    async fn upsert_principle(&self, principle: &SemanticPrinciple) -> EngramResult<()>;

    // === Knowledge notes ===

    async fn insert_note(&self, note: &KnowledgeNote) -> EngramResult<()>;

    /// Notes newest-first, optionally filtered to those carrying any of `tags`.
    async fn list_notes(
        &self,
        tenant: &TenantId,
        tags: Option<&[String]>,
        limit: usize,
    ) -> EngramResult<Vec<KnowledgeNote>>;

    async fn get_note(&self, tenant: &TenantId, id: NoteId)
        -> EngramResult<Option<KnowledgeNote>>;

    // === Capsules ===

    async fn insert_capsule(&self, capsule: &Capsule) -> EngramResult<()>;

    async fn get_capsule(&self, tenant: &TenantId, id: CapsuleId)
        -> EngramResult<Option<Capsule>>;

    /// Active, unexpired capsules readable by `agent`, optionally filtered by
    /// subject.
    async fn list_capsules_for_audience(
        &self,
        tenant: &TenantId,
        agent: &AgentId,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        now: Timestamp,
    ) -> EngramResult<Vec<Capsule>>;

    async fn set_capsule_status(
        &self,
        tenant: &TenantId,
        id: CapsuleId,
        status: CapsuleStatus,
    ) -> EngramResult<()>;

    // === Memory edits ===

    async fn insert_edit(&self, edit: &MemoryEdit) -> EngramResult<()>;

    async fn get_edit(&self, tenant: &TenantId, id: EditId)
        -> EngramResult<Option<MemoryEdit>>;

    async fn set_edit_status(
        &self,
        tenant: &TenantId,
        id: EditId,
        status: EditStatus,
        resolved_at: Timestamp,
    ) -> EngramResult<()>;

    async fn list_edits(
        &self,
        tenant: &TenantId,
        status: Option<EditStatus>,
        limit: usize,
    ) -> EngramResult<Vec<MemoryEdit>>;

    // === Reports & audit ===

    async fn insert_report(&self, report: &ConsolidationReport) -> EngramResult<()>;

    async fn list_reports(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<ConsolidationReport>>;

    async fn append_audit(&self, entry: &AuditEntry) -> EngramResult<()>;

    // === Health & stats ===

    async fn health_check(&self) -> EngramResult<bool>;

    async fn compression_stats(&self, tenant: &TenantId) -> EngramResult<CompressionStats>;
}
