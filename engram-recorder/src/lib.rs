//! Engram Recorder - the single write path
//!
//! Every mutation of ground truth funnels through [`Recorder::append`]:
//! validate, classify sensitivity, normalise tool output, derive chunks with
//! token estimates and importance, then hand the store one atomic bundle.
//! Decision supersession and task upserts ride in the same transaction.

mod chunker;
mod normalize;
mod sensitivity;

pub use chunker::{derive_chunks, importance_for};
pub use normalize::{NormalizedToolResult, normalize_tool_result};
pub use sensitivity::{REDACTION_MARKER, Redaction, classify, compile_extra_patterns, redact};

use chrono::Utc;
use engram_core::{
    Actor, Channel, ChunkId, Decision, DecisionId, DecisionStatus, DraftContent, EngramConfig,
    EngramError, EngramResult, Event, EventContent, EventId, MemoryIdType, MemoryRef,
    PolicyError, SecretPolicy, Sensitivity, SessionId, Task, TaskId, TenantId, Timestamp,
    compute_content_hash,
};
use engram_storage::{EventBundle, Store};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_TAGS: usize = 16;
const MAX_TAG_LEN: usize = 64;
const MAX_REFS: usize = 32;
const MAX_LIST_ITEMS: usize = 32;

// ============================================================================
// DRAFT AND OUTCOME TYPES
// ============================================================================

/// An event as submitted by a caller, before the write pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: engram_core::AgentId,
    pub channel: Channel,
    pub actor: Actor,
    pub content: DraftContent,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub refs: Vec<MemoryRef>,
    /// Caller-declared sensitivity; classification only raises it.
    #[serde(default)]
    pub sensitivity: Option<Sensitivity>,
    #[serde(default)]
    pub pinned: bool,
}

/// What `record_event` returns to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub event_id: EventId,
    pub chunk_ids: Vec<ChunkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<engram_core::ArtifactId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<DecisionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub redacted: bool,
}

// ============================================================================
// RECORDER
// ============================================================================

/// The single write path. Cheap to clone; holds only configuration.
#[derive(Clone)]
pub struct Recorder {
    config: Arc<EngramConfig>,
    extra_patterns: Arc<Vec<Regex>>,
}

impl Recorder {
    pub fn new(config: Arc<EngramConfig>) -> Self {
        let extra_patterns = Arc::new(compile_extra_patterns(
            &config.privacy.redact_patterns,
        ));
        Self {
            config,
            extra_patterns,
        }
    }

    /// Run the full pipeline and commit the bundle.
    pub async fn append(
        &self,
        store: &dyn Store,
        draft: EventDraft,
    ) -> EngramResult<RecordOutcome> {
        let now = Utc::now();
        let bundle = self.prepare(draft, now)?;
        self.verify_refs(store, &bundle).await?;
        store.insert_event_bundle(&bundle).await?;

        tracing::debug!(
            event_id = %bundle.event.event_id,
            tenant_id = %bundle.event.tenant_id,
            kind = %bundle.event.kind,
            chunks = bundle.chunks.len(),
            "Event appended"
        );
        Ok(outcome_of(&bundle))
    }

    /// Run validation, classification, normalisation and derivation without
    /// touching the store. The WAL replay path re-enters here.
    pub fn prepare(&self, draft: EventDraft, now: Timestamp) -> EngramResult<EventBundle> {
        validate_draft(&draft)?;
        let event_id = EventId::generate();

        // Sensitivity classification over the raw text, then policy.
        let raw_text = draft_text(&draft.content);
        let declared = draft.sensitivity.unwrap_or(Sensitivity::None);
        let mut sensitivity = classify(&raw_text, declared);

        let refused = self
            .config
            .privacy
            .never_store_kinds
            .contains(&sensitivity);
        let content = if refused {
            match self.config.privacy.secret_policy {
                SecretPolicy::Reject => {
                    let redaction = redact(&raw_text, &self.extra_patterns);
                    let pattern = redaction
                        .patterns_hit
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "declared".to_string());
                    return Err(EngramError::Policy(PolicyError::SecretRejected {
                        pattern,
                    }));
                }
                SecretPolicy::Redact => {
                    let (content, _) =
                        redact_content(draft.content.clone(), &self.extra_patterns);
                    // Redacted content no longer carries the secret itself.
                    sensitivity = Sensitivity::High;
                    content
                }
            }
        } else {
            draft.content.clone()
        };

        // Kind-specific normalisation (tool results become excerpts).
        let (content, artifact) = self.normalize_content(
            &draft.tenant_id,
            &draft.session_id,
            content,
        )?;

        let content_hash = compute_content_hash(
            &serde_json::to_vec(&content).map_err(|e| EngramError::Fatal {
                reason: e.to_string(),
            })?,
        );
        let event = Event {
            event_id,
            tenant_id: draft.tenant_id.clone(),
            session_id: draft.session_id.clone(),
            agent_id: draft.agent_id.clone(),
            channel: draft.channel,
            actor: draft.actor.clone(),
            kind: content.kind(),
            sensitivity,
            tags: draft.tags.clone(),
            content,
            refs: draft.refs.clone(),
            content_hash,
            created_at: now,
        };

        let chunks = derive_chunks(&event, &self.config.ingest, draft.pinned);
        let (decision, supersedes) = derive_decision(&event, &draft)?;
        let task = derive_task(&event, &draft, now);

        let artifact = artifact.map(|mut a| {
            a.created_at = now;
            normalize::link_artifact(&mut a, MemoryRef::Event(event_id));
            a
        });

        Ok(EventBundle {
            event,
            chunks,
            decision,
            supersedes,
            task,
            artifact,
        })
    }

    fn normalize_content(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        content: DraftContent,
    ) -> EngramResult<(EventContent, Option<engram_core::Artifact>)> {
        let absolute_max = self.config.limits.max_bytes_read_per_call as usize;
        match content {
            DraftContent::ToolResult { tool, path, output } => {
                let normalized = normalize_tool_result(
                    tenant_id,
                    session_id,
                    &tool,
                    path.as_deref(),
                    &output,
                    self.config.ingest.max_bytes_per_tool_result_event,
                    absolute_max,
                )?;
                Ok((
                    EventContent::ToolResult(normalized.excerpt),
                    normalized.artifact,
                ))
            }
            DraftContent::Message { text } => {
                if text.len() > absolute_max {
                    return Err(EngramError::OversizePayload {
                        bytes: text.len(),
                        max_bytes: absolute_max,
                    });
                }
                Ok((EventContent::Message { text }, None))
            }
            DraftContent::ToolCall { tool, args } => {
                Ok((EventContent::ToolCall { tool, args }, None))
            }
            DraftContent::Decision(d) => Ok((EventContent::Decision(d), None)),
            DraftContent::TaskUpdate(t) => Ok((EventContent::TaskUpdate(t), None)),
            DraftContent::ArtifactRef { artifact_id, note } => {
                Ok((EventContent::ArtifactRef { artifact_id, note }, None))
            }
        }
    }

    /// Every ref must resolve inside the request tenant. Lookups are
    /// tenant-scoped, so a foreign or missing id is indistinguishable and
    /// both reject with `tenant_mismatch`.
    async fn verify_refs(&self, store: &dyn Store, bundle: &EventBundle) -> EngramResult<()> {
        let tenant = &bundle.event.tenant_id;
        for r in &bundle.event.refs {
            let found = match r {
                MemoryRef::Event(id) => store.get_event(tenant, *id).await?.is_some(),
                MemoryRef::Chunk(id) => store.get_chunk(tenant, *id).await?.is_some(),
                MemoryRef::Decision(id) => store.get_decision(tenant, *id).await?.is_some(),
                MemoryRef::Artifact(id) => {
                    store.get_artifact(tenant, *id, 1).await?.is_some()
                }
                MemoryRef::Handoff(id) => store.get_handoff(tenant, *id).await?.is_some(),
                MemoryRef::Capsule(id) => store.get_capsule(tenant, *id).await?.is_some(),
            };
            if !found {
                return Err(EngramError::TenantMismatch {
                    request: tenant.to_string(),
                    resource: r.render(),
                });
            }
        }
        Ok(())
    }
}

fn outcome_of(bundle: &EventBundle) -> RecordOutcome {
    RecordOutcome {
        event_id: bundle.event.event_id,
        chunk_ids: bundle.chunks.iter().map(|c| c.chunk_id).collect(),
        artifact_id: bundle.artifact.as_ref().map(|a| a.artifact_id),
        decision_id: bundle.decision.as_ref().map(|d| d.decision_id),
        task_id: bundle.task.as_ref().map(|t| t.task_id),
        redacted: content_is_redacted(&bundle.event.content),
    }
}

fn content_is_redacted(content: &EventContent) -> bool {
    content.excerpt_text().contains(REDACTION_MARKER)
}

// ============================================================================
// VALIDATION
// ============================================================================

fn validate_draft(draft: &EventDraft) -> EngramResult<()> {
    if draft.actor.id.trim().is_empty() {
        return Err(EngramError::missing_field("actor.id"));
    }
    if draft.tags.len() > MAX_TAGS {
        return Err(EngramError::invalid_value(
            "tags",
            format!("at most {} tags", MAX_TAGS),
        ));
    }
    if draft.tags.iter().any(|t| t.is_empty() || t.len() > MAX_TAG_LEN) {
        return Err(EngramError::invalid_value(
            "tags",
            "tags must be non-empty and at most 64 bytes",
        ));
    }
    if draft.refs.len() > MAX_REFS {
        return Err(EngramError::invalid_value(
            "refs",
            format!("at most {} refs", MAX_REFS),
        ));
    }

    match &draft.content {
        DraftContent::Message { text } => {
            if text.trim().is_empty() {
                return Err(EngramError::missing_field("content.text"));
            }
        }
        DraftContent::ToolCall { tool, .. } | DraftContent::ToolResult { tool, .. } => {
            if tool.trim().is_empty() {
                return Err(EngramError::missing_field("content.tool"));
            }
        }
        DraftContent::Decision(d) => {
            if d.decision.trim().is_empty() {
                return Err(EngramError::missing_field("content.decision"));
            }
            for (name, list) in [
                ("constraints", &d.constraints),
                ("alternatives", &d.alternatives),
                ("consequences", &d.consequences),
            ] {
                if list.len() > MAX_LIST_ITEMS {
                    return Err(EngramError::invalid_value(
                        format!("content.{}", name),
                        format!("at most {} entries", MAX_LIST_ITEMS),
                    ));
                }
            }
        }
        DraftContent::TaskUpdate(t) => {
            if t.title.trim().is_empty() {
                return Err(EngramError::missing_field("content.title"));
            }
        }
        DraftContent::ArtifactRef { .. } => {}
    }
    Ok(())
}

// ============================================================================
// CLASSIFICATION AND REDACTION HELPERS
// ============================================================================

/// The text a draft is classified on, per kind.
fn draft_text(content: &DraftContent) -> String {
    match content {
        DraftContent::Message { text } => text.clone(),
        DraftContent::ToolCall { tool, args } => format!("{} {}", tool, args),
        DraftContent::ToolResult { output, .. } => output.clone(),
        DraftContent::Decision(d) => format!("{}\n{}", d.decision, d.rationale),
        DraftContent::TaskUpdate(t) => match &t.details {
            Some(details) => format!("{}\n{}", t.title, details),
            None => t.title.clone(),
        },
        DraftContent::ArtifactRef { note, .. } => note.clone().unwrap_or_default(),
    }
}

fn redact_content(content: DraftContent, extra: &[Regex]) -> (DraftContent, bool) {
    let mut was_redacted = false;
    let mut redact_string = |s: String| {
        let redaction = redact(&s, extra);
        was_redacted |= redaction.was_redacted();
        redaction.text
    };

    let content = match content {
        DraftContent::Message { text } => DraftContent::Message {
            text: redact_string(text),
        },
        DraftContent::ToolResult { tool, path, output } => DraftContent::ToolResult {
            tool,
            path,
            output: redact_string(output),
        },
        DraftContent::ToolCall { tool, args } => {
            let raw = args.to_string();
            let cleaned = redact_string(raw);
            let args = serde_json::from_str(&cleaned)
                .unwrap_or_else(|_| serde_json::json!({ "redacted": true }));
            DraftContent::ToolCall { tool, args }
        }
        DraftContent::Decision(mut d) => {
            d.decision = redact_string(d.decision);
            d.rationale = redact_string(d.rationale);
            DraftContent::Decision(d)
        }
        DraftContent::TaskUpdate(mut t) => {
            t.title = redact_string(t.title);
            t.details = t.details.map(&mut redact_string);
            DraftContent::TaskUpdate(t)
        }
        DraftContent::ArtifactRef { artifact_id, note } => DraftContent::ArtifactRef {
            artifact_id,
            note: note.map(&mut redact_string),
        },
    };
    (content, was_redacted)
}

// ============================================================================
// DERIVED ROWS
// ============================================================================

fn derive_decision(
    event: &Event,
    draft: &EventDraft,
) -> EngramResult<(Option<Decision>, Option<DecisionId>)> {
    let EventContent::Decision(content) = &event.content else {
        return Ok((None, None));
    };

    // The decision always cites its recording event, so refs are never empty.
    let mut refs = vec![MemoryRef::Event(event.event_id)];
    for r in &draft.refs {
        if !refs.contains(r) {
            refs.push(*r);
        }
    }
    if let Some(predecessor) = content.supersedes {
        let r = MemoryRef::Decision(predecessor);
        if !refs.contains(&r) {
            refs.push(r);
        }
    }

    let decision = Decision {
        decision_id: DecisionId::generate(),
        tenant_id: event.tenant_id.clone(),
        session_id: event.session_id.clone(),
        agent_id: event.agent_id.clone(),
        channel: event.channel,
        status: DecisionStatus::Active,
        scope: content.scope,
        decision: content.decision.clone(),
        rationale: content.rationale.clone(),
        constraints: content.constraints.clone(),
        alternatives: content.alternatives.clone(),
        consequences: content.consequences.clone(),
        refs,
        pinned: draft.pinned,
        created_at: event.created_at,
        superseded_at: None,
    };
    Ok((Some(decision), content.supersedes))
}

fn derive_task(event: &Event, draft: &EventDraft, now: Timestamp) -> Option<Task> {
    let EventContent::TaskUpdate(content) = &event.content else {
        return None;
    };
    let mut refs = vec![MemoryRef::Event(event.event_id)];
    for r in &draft.refs {
        if !refs.contains(r) {
            refs.push(*r);
        }
    }
    Some(Task {
        task_id: content.task_id.unwrap_or_else(TaskId::generate),
        tenant_id: event.tenant_id.clone(),
        session_id: event.session_id.clone(),
        status: content.status,
        title: content.title.clone(),
        details: content.details.clone(),
        refs,
        owner: content.owner.clone(),
        created_at: now,
        updated_at: now,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::{
        ActorKind, AgentId, DecisionContent, DecisionScope, TaskStatus, TaskUpdateContent,
    };
    use engram_storage::MemoryStore;

    fn recorder() -> Recorder {
        Recorder::new(Arc::new(EngramConfig::default()))
    }

    fn draft(content: DraftContent) -> EventDraft {
        EventDraft {
            tenant_id: TenantId::new("t1").unwrap(),
            session_id: SessionId::new("s1").unwrap(),
            agent_id: AgentId::new("A").unwrap(),
            channel: Channel::Private,
            actor: Actor {
                kind: ActorKind::Human,
                id: "user".to_string(),
            },
            content,
            tags: vec![],
            refs: vec![],
            sensitivity: None,
            pinned: false,
        }
    }

    fn message(text: &str) -> EventDraft {
        draft(DraftContent::Message {
            text: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_append_message_produces_event_and_chunk() {
        let store = MemoryStore::new();
        let outcome = recorder()
            .append(&store, message("what is this project for?"))
            .await
            .unwrap();
        assert_eq!(outcome.chunk_ids.len(), 1);
        assert!(!outcome.redacted);

        let tenant = TenantId::new("t1").unwrap();
        let event = store
            .get_event(&tenant, outcome.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, engram_core::EventKind::Message);
        let chunk = store
            .get_chunk(&tenant, outcome.chunk_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.event_id, event.event_id);
        assert_eq!(chunk.tenant_id, event.tenant_id);
        assert!(chunk.token_est > 0);
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_message() {
        let store = MemoryStore::new();
        let err = recorder().append(&store, message("   ")).await.unwrap_err();
        assert_eq!(err.kind(), engram_core::ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_secret_content_is_redacted_by_default() {
        let store = MemoryStore::new();
        let outcome = recorder()
            .append(
                &store,
                message("use api_key = sk-abcdefghijklmnop12345678 for the deploy"),
            )
            .await
            .unwrap();
        assert!(outcome.redacted);

        let tenant = TenantId::new("t1").unwrap();
        let event = store
            .get_event(&tenant, outcome.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sensitivity, Sensitivity::High);
        let text = event.content.excerpt_text();
        assert!(text.contains(REDACTION_MARKER));
        assert!(!text.contains("sk-abcdefghijklmnop12345678"));
    }

    #[tokio::test]
    async fn test_secret_policy_reject() {
        let mut config = EngramConfig::default();
        config.privacy.secret_policy = SecretPolicy::Reject;
        let recorder = Recorder::new(Arc::new(config));
        let store = MemoryStore::new();
        let err = recorder
            .append(&store, message("password = hunter2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), engram_core::ErrorKind::PolicyRejected);
    }

    #[tokio::test]
    async fn test_oversized_tool_result_spills() {
        let store = MemoryStore::new();
        let output = "log line\n".repeat(10_000); // ~90 KB > 64 KB default
        let outcome = recorder()
            .append(
                &store,
                draft(DraftContent::ToolResult {
                    tool: "read_file".to_string(),
                    path: Some("build.log".to_string()),
                    output,
                }),
            )
            .await
            .unwrap();

        let artifact_id = outcome.artifact_id.expect("artifact expected");
        assert_eq!(outcome.chunk_ids.len(), 1, "exactly one excerpt chunk");

        let tenant = TenantId::new("t1").unwrap();
        let event = store
            .get_event(&tenant, outcome.event_id)
            .await
            .unwrap()
            .unwrap();
        let EventContent::ToolResult(excerpt) = &event.content else {
            panic!("expected tool result content");
        };
        assert!(excerpt.truncated);
        assert_eq!(excerpt.artifact_id, Some(artifact_id));

        let artifact = store
            .get_artifact(&tenant, artifact_id, usize::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.refs, vec![MemoryRef::Event(outcome.event_id)]);
    }

    #[tokio::test]
    async fn test_decision_event_derives_row() {
        let store = MemoryStore::new();
        let outcome = recorder()
            .append(
                &store,
                draft(DraftContent::Decision(DecisionContent {
                    decision: "never store secrets".to_string(),
                    rationale: "compliance".to_string(),
                    constraints: vec![],
                    alternatives: vec![],
                    consequences: vec![],
                    scope: DecisionScope::Project,
                    supersedes: None,
                })),
            )
            .await
            .unwrap();
        let decision_id = outcome.decision_id.expect("decision row expected");

        let tenant = TenantId::new("t1").unwrap();
        let row = store
            .get_decision(&tenant, decision_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DecisionStatus::Active);
        assert!(!row.refs.is_empty());
        assert!(row.refs.contains(&MemoryRef::Event(outcome.event_id)));
    }

    #[tokio::test]
    async fn test_supersession_round_trip() {
        let store = MemoryStore::new();
        let rec = recorder();
        let first = rec
            .append(
                &store,
                draft(DraftContent::Decision(DecisionContent {
                    decision: "never store secrets".to_string(),
                    rationale: "compliance".to_string(),
                    constraints: vec![],
                    alternatives: vec![],
                    consequences: vec![],
                    scope: DecisionScope::Project,
                    supersedes: None,
                })),
            )
            .await
            .unwrap();
        let d1 = first.decision_id.unwrap();

        let second = rec
            .append(
                &store,
                draft(DraftContent::Decision(DecisionContent {
                    decision: "store secrets encrypted".to_string(),
                    rationale: "requirements changed".to_string(),
                    constraints: vec![],
                    alternatives: vec![],
                    consequences: vec![],
                    scope: DecisionScope::Project,
                    supersedes: Some(d1),
                })),
            )
            .await
            .unwrap();
        let d2 = second.decision_id.unwrap();

        let tenant = TenantId::new("t1").unwrap();
        let active = store.list_active_decisions(&tenant, 100).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision_id, d2);
        assert!(active[0].refs.contains(&MemoryRef::Decision(d1)));
        let old = store.get_decision(&tenant, d1).await.unwrap().unwrap();
        assert_eq!(old.status, DecisionStatus::Superseded);
    }

    #[tokio::test]
    async fn test_task_update_upserts() {
        let store = MemoryStore::new();
        let rec = recorder();
        let created = rec
            .append(
                &store,
                draft(DraftContent::TaskUpdate(TaskUpdateContent {
                    task_id: None,
                    title: "wire up retrieval".to_string(),
                    details: None,
                    status: TaskStatus::Open,
                    owner: Some("A".to_string()),
                })),
            )
            .await
            .unwrap();
        let task_id = created.task_id.unwrap();

        rec.append(
            &store,
            draft(DraftContent::TaskUpdate(TaskUpdateContent {
                task_id: Some(task_id),
                title: "wire up retrieval".to_string(),
                details: Some("candidates done".to_string()),
                status: TaskStatus::Doing,
                owner: Some("A".to_string()),
            })),
        )
        .await
        .unwrap();

        let tenant = TenantId::new("t1").unwrap();
        let open = store.list_open_tasks(&tenant, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].task_id, task_id);
        assert_eq!(open[0].status, TaskStatus::Doing);
    }

    #[tokio::test]
    async fn test_unknown_ref_is_tenant_mismatch() {
        let store = MemoryStore::new();
        let mut d = message("citing a ghost");
        d.refs = vec![MemoryRef::Event(EventId::generate())];
        let err = recorder().append(&store, d).await.unwrap_err();
        assert_eq!(err.kind(), engram_core::ErrorKind::TenantMismatch);
    }
}
