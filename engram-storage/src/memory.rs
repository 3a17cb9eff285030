//! In-memory store
//!
//! BTreeMaps under one RwLock, keyed by rendered id so iteration order is
//! chronological (ids are time-sorted). Used by the test suites, and as the
//! replay target in WAL tests. An availability switch simulates outages.

use crate::{
    ChunkPatch, CompressionStats, EventBundle, HandoffCompressionUpdate, Store,
};
use async_trait::async_trait;
use engram_core::{
    AgentId, Artifact, ArtifactId, AuditEntry, Capsule, CapsuleId, CapsuleStatus, Chunk, ChunkId,
    CompressionLevel, ConsolidationReport, Decision, DecisionId, DecisionStatus, EditId,
    EditStatus, EngramError, EngramResult, Event, EventId, Handoff, HandoffId, KnowledgeNote,
    MemoryEdit, MemoryIdType, NoteId, SemanticPrinciple, SessionId, Task, TaskId, TaskStatus,
    TenantId, Timestamp, estimate_tokens,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    events: BTreeMap<String, Event>,
    chunks: BTreeMap<String, Chunk>,
    decisions: BTreeMap<String, Decision>,
    tasks: BTreeMap<String, Task>,
    artifacts: BTreeMap<String, Artifact>,
    handoffs: BTreeMap<String, Handoff>,
    principles: BTreeMap<String, SemanticPrinciple>,
    notes: BTreeMap<String, KnowledgeNote>,
    capsules: BTreeMap<String, Capsule>,
    edits: BTreeMap<String, MemoryEdit>,
    reports: Vec<ConsolidationReport>,
    audit: Vec<AuditEntry>,
}

/// In-memory implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> EngramResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngramError::store_unavailable("memory store offline"))
        }
    }

    /// Number of audit entries written (test observability).
    pub async fn audit_len(&self) -> usize {
        self.inner.read().await.audit.len()
    }

    /// Latest consolidation reports (test observability).
    pub async fn reports(&self) -> Vec<ConsolidationReport> {
        self.inner.read().await.reports.clone()
    }
}

fn newest_first<T: Clone>(mut rows: Vec<T>) -> Vec<T> {
    rows.reverse();
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_event_bundle(&self, bundle: &EventBundle) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;

        // Validate the supersession target before touching anything so the
        // "transaction" cannot half-apply.
        if let Some(predecessor) = bundle.supersedes {
            let key = predecessor.render();
            match inner.decisions.get(&key) {
                Some(d) if d.tenant_id == bundle.event.tenant_id => {}
                Some(_) => {
                    return Err(EngramError::TenantMismatch {
                        request: bundle.event.tenant_id.to_string(),
                        resource: key,
                    })
                }
                None => {
                    return Err(EngramError::NotFound {
                        entity: "decision",
                        id: key,
                    })
                }
            }
        }

        inner
            .events
            .insert(bundle.event.event_id.render(), bundle.event.clone());
        for chunk in &bundle.chunks {
            inner.chunks.insert(chunk.chunk_id.render(), chunk.clone());
        }
        if let Some(artifact) = &bundle.artifact {
            inner
                .artifacts
                .insert(artifact.artifact_id.render(), artifact.clone());
        }
        if let Some(decision) = &bundle.decision {
            inner
                .decisions
                .insert(decision.decision_id.render(), decision.clone());
        }
        if let Some(predecessor) = bundle.supersedes {
            let row = inner
                .decisions
                .get_mut(&predecessor.render())
                .expect("validated above");
            row.status = DecisionStatus::Superseded;
            row.superseded_at = Some(bundle.event.created_at);
        }
        if let Some(task) = &bundle.task {
            let key = task.task_id.render();
            let mut row = task.clone();
            // Upsert semantics: an existing row keeps its creation time.
            if let Some(existing) = inner.tasks.get(&key) {
                row.created_at = existing.created_at;
            }
            inner.tasks.insert(key, row);
        }
        Ok(())
    }

    async fn get_event(&self, tenant: &TenantId, id: EventId) -> EngramResult<Option<Event>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .get(&id.render())
            .filter(|e| &e.tenant_id == tenant)
            .cloned())
    }

    async fn list_session_events(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: usize,
    ) -> EngramResult<Vec<Event>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Event> = inner
            .events
            .values()
            .filter(|e| &e.tenant_id == tenant && &e.session_id == session)
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn list_events(&self, tenant: &TenantId, limit: usize) -> EngramResult<Vec<Event>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .filter(|e| &e.tenant_id == tenant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_chunk(&self, tenant: &TenantId, id: ChunkId) -> EngramResult<Option<Chunk>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .chunks
            .get(&id.render())
            .filter(|c| &c.tenant_id == tenant)
            .cloned())
    }

    async fn list_recent_chunks(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| &c.tenant_id == tenant && c.active)
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn list_session_chunks(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| &c.tenant_id == tenant && &c.session_id == session && c.active)
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn list_pinned_chunks(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| &c.tenant_id == tenant && c.active && c.pinned)
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn search_chunks_lexical(
        &self,
        tenant: &TenantId,
        terms: &[String],
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        self.check_available()?;
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        let term_set: HashSet<&str> = terms.iter().map(String::as_str).collect();
        let mut matched: Vec<(usize, Chunk)> = inner
            .chunks
            .values()
            .filter(|c| &c.tenant_id == tenant && c.active)
            .filter_map(|c| {
                let hits = c
                    .terms
                    .iter()
                    .filter(|t| term_set.contains(t.as_str()))
                    .count();
                (hits > 0).then(|| (hits, c.clone()))
            })
            .collect();
        // Match count desc, then newest id first; id order is stable.
        matched.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.chunk_id.cmp(&a.1.chunk_id))
        });
        Ok(matched.into_iter().take(limit).map(|(_, c)| c).collect())
    }

    async fn list_chunks_by_tags(
        &self,
        tenant: &TenantId,
        tags: &[String],
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        self.check_available()?;
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        let tag_set: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let rows: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| {
                &c.tenant_id == tenant
                    && c.active
                    && c.tags.iter().any(|t| tag_set.contains(t.as_str()))
            })
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn search_chunks_vector(
        &self,
        tenant: &TenantId,
        query: &[f32],
        limit: usize,
    ) -> EngramResult<Vec<(ChunkId, f32)>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut scored: Vec<(ChunkId, f32)> = inner
            .chunks
            .values()
            .filter(|c| &c.tenant_id == tenant && c.active)
            .filter_map(|c| {
                c.embedding
                    .as_ref()
                    .map(|e| (c.chunk_id, engram_core::cosine_similarity(query, e)))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn update_chunk_embedding(
        &self,
        tenant: &TenantId,
        id: ChunkId,
        embedding: &[f32],
    ) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let chunk = inner
            .chunks
            .get_mut(&id.render())
            .filter(|c| &c.tenant_id == tenant)
            .ok_or(EngramError::NotFound {
                entity: "chunk",
                id: id.render(),
            })?;
        chunk.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn apply_chunk_patch(
        &self,
        tenant: &TenantId,
        id: ChunkId,
        patch: &ChunkPatch,
    ) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let chunk = inner
            .chunks
            .get_mut(&id.render())
            .filter(|c| &c.tenant_id == tenant)
            .ok_or(EngramError::NotFound {
                entity: "chunk",
                id: id.render(),
            })?;
        if let Some(text) = &patch.text {
            chunk.text = text.clone();
            chunk.token_est = patch.token_est.unwrap_or_else(|| estimate_tokens(text));
        }
        if let Some(terms) = &patch.terms {
            chunk.terms = terms.clone();
        }
        if let Some(hash) = patch.content_hash {
            chunk.content_hash = hash;
        }
        if let Some(simhash) = patch.simhash {
            chunk.simhash = simhash;
        }
        if let Some(importance) = patch.importance {
            chunk.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(delta) = patch.importance_delta {
            chunk.importance = (chunk.importance + delta).clamp(0.0, 1.0);
        }
        if let Some(channel) = patch.channel {
            chunk.channel = channel;
        }
        if let Some(active) = patch.active {
            chunk.active = active;
        }
        Ok(())
    }

    async fn count_chunks(&self, tenant: &TenantId) -> EngramResult<i64> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .chunks
            .values()
            .filter(|c| &c.tenant_id == tenant)
            .count() as i64)
    }

    async fn restricted_chunk_ids(
        &self,
        tenant: &TenantId,
        agent: &AgentId,
    ) -> EngramResult<HashSet<ChunkId>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut restricted = HashSet::new();
        for capsule in inner.capsules.values() {
            if &capsule.tenant_id == tenant
                && capsule.status == CapsuleStatus::Active
                && !capsule.audience_agent_ids.contains(agent)
            {
                restricted.extend(capsule.items.chunks.iter().copied());
            }
        }
        Ok(restricted)
    }

    async fn get_decision(
        &self,
        tenant: &TenantId,
        id: DecisionId,
    ) -> EngramResult<Option<Decision>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .decisions
            .get(&id.render())
            .filter(|d| &d.tenant_id == tenant)
            .cloned())
    }

    async fn list_active_decisions(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Decision>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Decision> = inner
            .decisions
            .values()
            .filter(|d| &d.tenant_id == tenant && d.status == DecisionStatus::Active)
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn set_decision_status(
        &self,
        tenant: &TenantId,
        id: DecisionId,
        status: DecisionStatus,
        superseded_at: Option<Timestamp>,
    ) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let row = inner
            .decisions
            .get_mut(&id.render())
            .filter(|d| &d.tenant_id == tenant)
            .ok_or(EngramError::NotFound {
                entity: "decision",
                id: id.render(),
            })?;
        row.status = status;
        if superseded_at.is_some() {
            row.superseded_at = superseded_at;
        }
        Ok(())
    }

    async fn list_decisions_for_archive(
        &self,
        tenant: &TenantId,
        cutoff: Timestamp,
    ) -> EngramResult<Vec<Decision>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .decisions
            .values()
            .filter(|d| {
                &d.tenant_id == tenant
                    && d.status == DecisionStatus::Active
                    && !d.pinned
                    && d.created_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn get_task(&self, tenant: &TenantId, id: TaskId) -> EngramResult<Option<Task>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .get(&id.render())
            .filter(|t| &t.tenant_id == tenant)
            .cloned())
    }

    async fn list_open_tasks(&self, tenant: &TenantId, limit: usize) -> EngramResult<Vec<Task>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut rows: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| &t.tenant_id == tenant && t.status != TaskStatus::Done)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner
            .artifacts
            .insert(artifact.artifact_id.render(), artifact.clone());
        Ok(())
    }

    async fn get_artifact(
        &self,
        tenant: &TenantId,
        id: ArtifactId,
        max_bytes: usize,
    ) -> EngramResult<Option<Artifact>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .artifacts
            .get(&id.render())
            .filter(|a| &a.tenant_id == tenant)
            .map(|a| {
                let mut artifact = a.clone();
                if artifact.bytes.len() > max_bytes {
                    artifact.bytes.truncate(max_bytes);
                }
                artifact
            }))
    }

    async fn insert_handoff(&self, handoff: &Handoff) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner
            .handoffs
            .insert(handoff.handoff_id.render(), handoff.clone());
        Ok(())
    }

    async fn get_handoff(
        &self,
        tenant: &TenantId,
        id: HandoffId,
    ) -> EngramResult<Option<Handoff>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .handoffs
            .get(&id.render())
            .filter(|h| &h.tenant_id == tenant)
            .cloned())
    }

    async fn get_latest_handoff(
        &self,
        tenant: &TenantId,
        agent: Option<&AgentId>,
    ) -> EngramResult<Option<Handoff>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .handoffs
            .values()
            .filter(|h| &h.tenant_id == tenant)
            .filter(|h| agent.is_none_or(|a| &h.agent_id == a))
            .next_back()
            .cloned())
    }

    async fn list_handoffs(
        &self,
        tenant: &TenantId,
        limit: usize,
        before: Option<Timestamp>,
    ) -> EngramResult<Vec<Handoff>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Handoff> = inner
            .handoffs
            .values()
            .filter(|h| &h.tenant_id == tenant)
            .filter(|h| before.is_none_or(|cutoff| h.created_at < cutoff))
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn list_identity_thread(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Handoff>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Handoff> = inner
            .handoffs
            .values()
            .filter(|h| &h.tenant_id == tenant && h.in_identity_thread())
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn list_handoffs_at_level(
        &self,
        tenant: &TenantId,
        level: CompressionLevel,
        cutoff: Timestamp,
    ) -> EngramResult<Vec<Handoff>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .handoffs
            .values()
            .filter(|h| {
                &h.tenant_id == tenant
                    && h.compression_level == level
                    && h.created_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn update_handoff_compression(
        &self,
        tenant: &TenantId,
        id: HandoffId,
        update: &HandoffCompressionUpdate,
    ) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let row = inner
            .handoffs
            .get_mut(&id.render())
            .filter(|h| &h.tenant_id == tenant)
            .ok_or(EngramError::NotFound {
                entity: "handoff",
                id: id.render(),
            })?;
        if let Some(level) = update.compression_level {
            row.compression_level = level;
        }
        if let Some(summary) = &update.summary {
            row.summary = Some(summary.clone());
        }
        if let Some(quick_ref) = &update.quick_ref {
            row.quick_ref = Some(quick_ref.clone());
        }
        if let Some(at) = update.consolidated_at {
            row.consolidated_at = Some(at);
        }
        if update.clear_full_fields {
            row.experienced.clear();
            row.noticed.clear();
            row.learned.clear();
            row.story.clear();
        }
        Ok(())
    }

    async fn list_principles(&self, tenant: &TenantId) -> EngramResult<Vec<SemanticPrinciple>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<SemanticPrinciple> = inner
            .principles
            .values()
            .filter(|p| &p.tenant_id == tenant)
            .cloned()
            .collect();
        Ok(newest_first(rows))
    }

    async fn upsert_principle(&self, principle: &SemanticPrinciple) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner
            .principles
            .insert(principle.principle_id.render(), principle.clone());
        Ok(())
    }

    async fn insert_note(&self, note: &KnowledgeNote) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.notes.insert(note.note_id.render(), note.clone());
        Ok(())
    }

    async fn list_notes(
        &self,
        tenant: &TenantId,
        tags: Option<&[String]>,
        limit: usize,
    ) -> EngramResult<Vec<KnowledgeNote>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<KnowledgeNote> = inner
            .notes
            .values()
            .filter(|n| &n.tenant_id == tenant)
            .filter(|n| match tags {
                Some(wanted) if !wanted.is_empty() => {
                    n.tags.iter().any(|t| wanted.contains(t))
                }
                _ => true,
            })
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn get_note(
        &self,
        tenant: &TenantId,
        id: NoteId,
    ) -> EngramResult<Option<KnowledgeNote>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .notes
            .get(&id.render())
            .filter(|n| &n.tenant_id == tenant)
            .cloned())
    }

    async fn insert_capsule(&self, capsule: &Capsule) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner
            .capsules
            .insert(capsule.capsule_id.render(), capsule.clone());
        Ok(())
    }

    async fn get_capsule(
        &self,
        tenant: &TenantId,
        id: CapsuleId,
    ) -> EngramResult<Option<Capsule>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .capsules
            .get(&id.render())
            .filter(|c| &c.tenant_id == tenant)
            .cloned())
    }

    async fn list_capsules_for_audience(
        &self,
        tenant: &TenantId,
        agent: &AgentId,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        now: Timestamp,
    ) -> EngramResult<Vec<Capsule>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<Capsule> = inner
            .capsules
            .values()
            .filter(|c| &c.tenant_id == tenant && c.readable_by(agent, now))
            .filter(|c| subject_type.is_none_or(|s| c.subject_type == s))
            .filter(|c| subject_id.is_none_or(|s| c.subject_id == s))
            .cloned()
            .collect();
        Ok(newest_first(rows))
    }

    async fn set_capsule_status(
        &self,
        tenant: &TenantId,
        id: CapsuleId,
        status: CapsuleStatus,
    ) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let row = inner
            .capsules
            .get_mut(&id.render())
            .filter(|c| &c.tenant_id == tenant)
            .ok_or(EngramError::NotFound {
                entity: "capsule",
                id: id.render(),
            })?;
        row.status = status;
        Ok(())
    }

    async fn insert_edit(&self, edit: &MemoryEdit) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.edits.insert(edit.edit_id.render(), edit.clone());
        Ok(())
    }

    async fn get_edit(
        &self,
        tenant: &TenantId,
        id: EditId,
    ) -> EngramResult<Option<MemoryEdit>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .edits
            .get(&id.render())
            .filter(|e| &e.tenant_id == tenant)
            .cloned())
    }

    async fn set_edit_status(
        &self,
        tenant: &TenantId,
        id: EditId,
        status: EditStatus,
        resolved_at: Timestamp,
    ) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let row = inner
            .edits
            .get_mut(&id.render())
            .filter(|e| &e.tenant_id == tenant)
            .ok_or(EngramError::NotFound {
                entity: "memory_edit",
                id: id.render(),
            })?;
        row.status = status;
        row.resolved_at = Some(resolved_at);
        Ok(())
    }

    async fn list_edits(
        &self,
        tenant: &TenantId,
        status: Option<EditStatus>,
        limit: usize,
    ) -> EngramResult<Vec<MemoryEdit>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<MemoryEdit> = inner
            .edits
            .values()
            .filter(|e| &e.tenant_id == tenant)
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn insert_report(&self, report: &ConsolidationReport) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.reports.push(report.clone());
        Ok(())
    }

    async fn list_reports(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<ConsolidationReport>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let rows: Vec<ConsolidationReport> = inner
            .reports
            .iter()
            .filter(|r| &r.tenant_id == tenant)
            .cloned()
            .collect();
        Ok(newest_first(rows).into_iter().take(limit).collect())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> EngramResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.audit.push(entry.clone());
        Ok(())
    }

    async fn health_check(&self) -> EngramResult<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn compression_stats(&self, tenant: &TenantId) -> EngramResult<CompressionStats> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut stats = CompressionStats::default();
        for handoff in inner.handoffs.values() {
            if &handoff.tenant_id != tenant {
                continue;
            }
            stats.handoffs_total += 1;
            match handoff.compression_level {
                CompressionLevel::Full => stats.handoffs_full += 1,
                CompressionLevel::Summary => stats.handoffs_summary += 1,
                CompressionLevel::QuickRef => stats.handoffs_quick_ref += 1,
                CompressionLevel::Integrated => stats.handoffs_integrated += 1,
            }
        }
        for decision in inner.decisions.values() {
            if &decision.tenant_id != tenant {
                continue;
            }
            match decision.status {
                DecisionStatus::Active => stats.decisions_active += 1,
                DecisionStatus::Superseded => stats.decisions_superseded += 1,
            }
        }
        stats.principles_total = inner
            .principles
            .values()
            .filter(|p| &p.tenant_id == tenant)
            .count() as i64;
        stats.tokens_saved_estimate = inner
            .reports
            .iter()
            .filter(|r| &r.tenant_id == tenant)
            .map(|r| r.tokens_saved)
            .sum();
        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_core::{
        Actor, ActorKind, Channel, EventContent, EventKind, MemoryRef, Sensitivity,
        compute_content_hash, normalize_terms, simhash64,
    };

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn session() -> SessionId {
        SessionId::new("s1").unwrap()
    }

    fn make_event(text: &str) -> Event {
        Event {
            event_id: EventId::generate(),
            tenant_id: tenant(),
            session_id: session(),
            agent_id: AgentId::new("A").unwrap(),
            channel: Channel::Private,
            actor: Actor {
                kind: ActorKind::Human,
                id: "user".to_string(),
            },
            kind: EventKind::Message,
            sensitivity: Sensitivity::None,
            tags: vec![],
            content: EventContent::Message {
                text: text.to_string(),
            },
            refs: vec![],
            content_hash: compute_content_hash(text.as_bytes()),
            created_at: Utc::now(),
        }
    }

    fn make_chunk(event: &Event, text: &str) -> Chunk {
        Chunk {
            chunk_id: ChunkId::generate(),
            event_id: event.event_id,
            tenant_id: event.tenant_id.clone(),
            session_id: event.session_id.clone(),
            agent_id: event.agent_id.clone(),
            channel: event.channel,
            kind: event.kind,
            sensitivity: event.sensitivity,
            tags: event.tags.clone(),
            seq: 0,
            text: text.to_string(),
            token_est: engram_core::estimate_tokens(text),
            importance: 0.25,
            pinned: false,
            active: true,
            terms: normalize_terms(text),
            content_hash: compute_content_hash(text.as_bytes()),
            simhash: simhash64(text),
            embedding: None,
            created_at: event.created_at,
        }
    }

    fn bundle(event: Event, chunks: Vec<Chunk>) -> EventBundle {
        EventBundle {
            event,
            chunks,
            decision: None,
            supersedes: None,
            task: None,
            artifact: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_event() {
        let store = MemoryStore::new();
        let event = make_event("what is this project for?");
        let chunk = make_chunk(&event, "what is this project for?");
        let chunk_id = chunk.chunk_id;
        store
            .insert_event_bundle(&bundle(event.clone(), vec![chunk]))
            .await
            .unwrap();

        let fetched = store.get_event(&tenant(), event.event_id).await.unwrap();
        assert_eq!(fetched, Some(event));
        let fetched_chunk = store.get_chunk(&tenant(), chunk_id).await.unwrap();
        assert!(fetched_chunk.is_some());
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let store = MemoryStore::new();
        let event = make_event("tenant one data");
        store
            .insert_event_bundle(&bundle(event.clone(), vec![]))
            .await
            .unwrap();

        let other = TenantId::new("t2").unwrap();
        assert_eq!(store.get_event(&other, event.event_id).await.unwrap(), None);
        assert!(store
            .list_session_events(&other, &session(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lexical_search_orders_by_match_count() {
        let store = MemoryStore::new();
        let e1 = make_event("budget planning");
        let c1 = make_chunk(&e1, "budget planning for retrieval");
        let e2 = make_event("budget budget");
        let c2 = make_chunk(&e2, "budget review and budget planning review");
        store.insert_event_bundle(&bundle(e1, vec![c1])).await.unwrap();
        store
            .insert_event_bundle(&bundle(e2, vec![c2.clone()]))
            .await
            .unwrap();

        let hits = store
            .search_chunks_lexical(
                &tenant(),
                &["budget".to_string(), "planning".to_string()],
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, c2.chunk_id);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store
            .insert_event_bundle(&bundle(make_event("x"), vec![]))
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
        store.set_available(true);
        assert!(store
            .insert_event_bundle(&bundle(make_event("x"), vec![]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_supersession_is_atomic() {
        let store = MemoryStore::new();

        // Seed D1 via a decision bundle.
        let e1 = make_event("seed");
        let d1 = Decision {
            decision_id: DecisionId::generate(),
            tenant_id: tenant(),
            session_id: session(),
            agent_id: AgentId::new("A").unwrap(),
            channel: Channel::Private,
            status: DecisionStatus::Active,
            scope: engram_core::DecisionScope::Project,
            decision: "never store secrets".to_string(),
            rationale: "policy".to_string(),
            constraints: vec![],
            alternatives: vec![],
            consequences: vec![],
            refs: vec![MemoryRef::Event(e1.event_id)],
            pinned: false,
            created_at: Utc::now(),
            superseded_at: None,
        };
        store
            .insert_event_bundle(&EventBundle {
                event: e1,
                chunks: vec![],
                decision: Some(d1.clone()),
                supersedes: None,
                task: None,
                artifact: None,
            })
            .await
            .unwrap();

        // D2 supersedes D1 in one bundle.
        let e2 = make_event("supersede");
        let d2 = Decision {
            decision_id: DecisionId::generate(),
            decision: "store secrets encrypted".to_string(),
            refs: vec![
                MemoryRef::Event(e2.event_id),
                MemoryRef::Decision(d1.decision_id),
            ],
            ..d1.clone()
        };
        store
            .insert_event_bundle(&EventBundle {
                event: e2,
                chunks: vec![],
                decision: Some(d2.clone()),
                supersedes: Some(d1.decision_id),
                task: None,
                artifact: None,
            })
            .await
            .unwrap();

        let active = store.list_active_decisions(&tenant(), 100).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision_id, d2.decision_id);
        let old = store
            .get_decision(&tenant(), d1.decision_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, DecisionStatus::Superseded);
        assert!(old.superseded_at.is_some());
    }

    #[tokio::test]
    async fn test_supersession_missing_predecessor_rejected() {
        let store = MemoryStore::new();
        let event = make_event("supersede nothing");
        let result = store
            .insert_event_bundle(&EventBundle {
                event,
                chunks: vec![],
                decision: None,
                supersedes: Some(DecisionId::generate()),
                task: None,
                artifact: None,
            })
            .await;
        assert!(matches!(result, Err(EngramError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_artifact_bytes_bounded() {
        let store = MemoryStore::new();
        let artifact = Artifact {
            artifact_id: ArtifactId::generate(),
            tenant_id: tenant(),
            session_id: session(),
            kind: "tool_output".to_string(),
            bytes: vec![7u8; 1000],
            uri: None,
            metadata: serde_json::json!({}),
            refs: vec![],
            created_at: Utc::now(),
        };
        store.insert_artifact(&artifact).await.unwrap();
        let fetched = store
            .get_artifact(&tenant(), artifact.artifact_id, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.bytes.len(), 100);
    }

    #[tokio::test]
    async fn test_capsule_restriction_set() {
        let store = MemoryStore::new();
        let restricted_chunk = ChunkId::generate();
        let author = AgentId::new("A").unwrap();
        let audience = AgentId::new("B").unwrap();
        let outsider = AgentId::new("C").unwrap();
        let now = Utc::now();
        let capsule = Capsule {
            capsule_id: CapsuleId::generate(),
            tenant_id: tenant(),
            scope: "project".to_string(),
            subject_type: "repo".to_string(),
            subject_id: "engram".to_string(),
            author_agent_id: author,
            audience_agent_ids: vec![audience.clone()],
            items: engram_core::CapsuleItems {
                chunks: vec![restricted_chunk],
                decisions: vec![],
                artifacts: vec![],
            },
            risks: vec![],
            ttl_days: 7,
            status: CapsuleStatus::Active,
            created_at: now,
            expires_at: now + chrono::Duration::days(7),
        };
        store.insert_capsule(&capsule).await.unwrap();

        let for_outsider = store
            .restricted_chunk_ids(&tenant(), &outsider)
            .await
            .unwrap();
        assert!(for_outsider.contains(&restricted_chunk));
        let for_audience = store
            .restricted_chunk_ids(&tenant(), &audience)
            .await
            .unwrap();
        assert!(!for_audience.contains(&restricted_chunk));
    }
}
