//! PostgreSQL store
//!
//! Connection pooling via deadpool-postgres; plain SQL against `schema.sql`.
//! Every statement is tenant-scoped by parameter. Pool and connection errors
//! surface as `store_unavailable` so the daemon can fall back to the WAL.

use crate::{
    ChunkPatch, CompressionStats, EventBundle, HandoffCompressionUpdate, Store,
};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use engram_core::{
    Actor, ActorKind, AgentId, Artifact, ArtifactId, AuditEntry, Capsule, CapsuleId,
    CapsuleItems, CapsuleStatus, Channel, Chunk, ChunkId, CompressionLevel, ConsolidationReport,
    Decision, DecisionId, DecisionScope, DecisionStatus, EditId, EditOp, EditPatch, EditStatus,
    EngramError, EngramResult, Event, EventId, EventKind, Handoff, HandoffId, JobType,
    KnowledgeNote, MemoryEdit, MemoryIdType, MemoryRef, NoteId, Proposer, SemanticPrinciple,
    Sensitivity, SessionId, StoreError, Task, TaskId, TaskStatus, TenantId, Timestamp,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub max_size: usize,
    pub timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "engram".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PgConfig {
    /// Create a configuration from `ENGRAM_DB_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("ENGRAM_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("ENGRAM_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("ENGRAM_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("ENGRAM_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("ENGRAM_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("ENGRAM_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: Duration::from_secs(
                std::env::var("ENGRAM_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> EngramResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| EngramError::store_unavailable(format!("failed to create pool: {}", e)))
    }
}

// ============================================================================
// STORE IMPLEMENTATION
// ============================================================================

/// PostgreSQL implementation of [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &PgConfig) -> EngramResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Current pool size, for the health endpoint.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn conn(&self) -> EngramResult<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| EngramError::store_unavailable(format!("pool: {}", e)))
    }
}

fn db_err(e: tokio_postgres::Error) -> EngramError {
    if e.is_closed() {
        EngramError::store_unavailable(format!("connection closed: {}", e))
    } else {
        EngramError::Store(StoreError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

fn corrupt(table: &'static str, reason: impl Into<String>) -> EngramError {
    EngramError::Store(StoreError::CorruptRow {
        table,
        reason: reason.into(),
    })
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_id<T: MemoryIdType>(table: &'static str, raw: &str) -> EngramResult<T> {
    raw.parse()
        .map_err(|_| corrupt(table, format!("bad id {}", raw)))
}

fn parse_refs(table: &'static str, raw: Vec<String>) -> EngramResult<Vec<MemoryRef>> {
    raw.iter()
        .map(|s| {
            MemoryRef::from_str(s).map_err(|_| corrupt(table, format!("bad ref {}", s)))
        })
        .collect()
}

fn render_refs(refs: &[MemoryRef]) -> Vec<String> {
    refs.iter().map(MemoryRef::render).collect()
}

fn parse_enum<T: FromStr>(table: &'static str, raw: &str) -> EngramResult<T> {
    raw.parse()
        .map_err(|_| corrupt(table, format!("bad enum value {}", raw)))
}

fn scope_key<T: FromStr>(table: &'static str, raw: String) -> EngramResult<T> {
    raw.parse()
        .map_err(|_| corrupt(table, "bad isolation key"))
}

fn hash_from_bytes(table: &'static str, raw: Vec<u8>) -> EngramResult<[u8; 32]> {
    raw.try_into()
        .map_err(|_| corrupt(table, "content hash is not 32 bytes"))
}

fn event_from_row(row: &Row) -> EngramResult<Event> {
    const T: &str = "events";
    Ok(Event {
        event_id: parse_id(T, row.get::<_, &str>("event_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        session_id: scope_key(T, row.get("session_id"))?,
        agent_id: scope_key(T, row.get("agent_id"))?,
        channel: parse_enum::<Channel>(T, row.get("channel"))?,
        actor: Actor {
            kind: parse_enum::<ActorKind>(T, row.get("actor_kind"))?,
            id: row.get("actor_id"),
        },
        kind: parse_enum::<EventKind>(T, row.get("kind"))?,
        sensitivity: parse_enum::<Sensitivity>(T, row.get("sensitivity"))?,
        tags: row.get("tags"),
        content: serde_json::from_value(row.get("content"))
            .map_err(|e| corrupt(T, format!("bad content: {}", e)))?,
        refs: parse_refs(T, row.get("refs"))?,
        content_hash: hash_from_bytes(T, row.get("content_hash"))?,
        created_at: row.get("created_at"),
    })
}

fn chunk_from_row(row: &Row) -> EngramResult<Chunk> {
    const T: &str = "chunks";
    Ok(Chunk {
        chunk_id: parse_id(T, row.get::<_, &str>("chunk_id"))?,
        event_id: parse_id(T, row.get::<_, &str>("event_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        session_id: scope_key(T, row.get("session_id"))?,
        agent_id: scope_key(T, row.get("agent_id"))?,
        channel: parse_enum::<Channel>(T, row.get("channel"))?,
        kind: parse_enum::<EventKind>(T, row.get("kind"))?,
        sensitivity: parse_enum::<Sensitivity>(T, row.get("sensitivity"))?,
        tags: row.get("tags"),
        seq: row.get("seq"),
        text: row.get("body"),
        token_est: row.get("token_est"),
        importance: row.get("importance"),
        pinned: row.get("pinned"),
        active: row.get("active"),
        terms: row.get("terms"),
        content_hash: hash_from_bytes(T, row.get("content_hash"))?,
        simhash: row.get::<_, i64>("simhash") as u64,
        embedding: row.get("embedding"),
        created_at: row.get("created_at"),
    })
}

fn decision_from_row(row: &Row) -> EngramResult<Decision> {
    const T: &str = "decisions";
    Ok(Decision {
        decision_id: parse_id(T, row.get::<_, &str>("decision_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        session_id: scope_key(T, row.get("session_id"))?,
        agent_id: scope_key(T, row.get("agent_id"))?,
        channel: parse_enum::<Channel>(T, row.get("channel"))?,
        status: parse_enum::<DecisionStatus>(T, row.get("status"))?,
        scope: parse_enum::<DecisionScope>(T, row.get("scope"))?,
        decision: row.get("decision"),
        rationale: row.get("rationale"),
        constraints: row.get("constraints"),
        alternatives: row.get("alternatives"),
        consequences: row.get("consequences"),
        refs: parse_refs(T, row.get("refs"))?,
        pinned: row.get("pinned"),
        created_at: row.get("created_at"),
        superseded_at: row.get("superseded_at"),
    })
}

fn task_from_row(row: &Row) -> EngramResult<Task> {
    const T: &str = "tasks";
    Ok(Task {
        task_id: parse_id(T, row.get::<_, &str>("task_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        session_id: scope_key(T, row.get("session_id"))?,
        status: parse_enum::<TaskStatus>(T, row.get("status"))?,
        title: row.get("title"),
        details: row.get("details"),
        refs: parse_refs(T, row.get("refs"))?,
        owner: row.get("owner"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn artifact_from_row(row: &Row) -> EngramResult<Artifact> {
    const T: &str = "artifacts";
    Ok(Artifact {
        artifact_id: parse_id(T, row.get::<_, &str>("artifact_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        session_id: scope_key(T, row.get("session_id"))?,
        kind: row.get("kind"),
        bytes: row.get("bytes"),
        uri: row.get("uri"),
        metadata: row.get("metadata"),
        refs: parse_refs(T, row.get("refs"))?,
        created_at: row.get("created_at"),
    })
}

fn handoff_from_row(row: &Row) -> EngramResult<Handoff> {
    const T: &str = "handoffs";
    Ok(Handoff {
        handoff_id: parse_id(T, row.get::<_, &str>("handoff_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        session_id: scope_key(T, row.get("session_id"))?,
        agent_id: scope_key(T, row.get("agent_id"))?,
        experienced: row.get("experienced"),
        noticed: row.get("noticed"),
        learned: row.get("learned"),
        story: row.get("story"),
        becoming: row.get("becoming"),
        remember: row.get("remember"),
        significance: row.get("significance"),
        tags: row.get("tags"),
        with_whom: row.get("with_whom"),
        compression_level: parse_enum::<CompressionLevel>(T, row.get("compression_level"))?,
        summary: row.get("summary"),
        quick_ref: row.get("quick_ref"),
        refs: parse_refs(T, row.get("refs"))?,
        created_at: row.get("created_at"),
        consolidated_at: row.get("consolidated_at"),
    })
}

fn principle_from_row(row: &Row) -> EngramResult<SemanticPrinciple> {
    const T: &str = "semantic_principles";
    let handoff_ids: Vec<String> = row.get("source_handoff_ids");
    Ok(SemanticPrinciple {
        principle_id: parse_id(T, row.get::<_, &str>("principle_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        principle: row.get("principle"),
        context: row.get("context"),
        category: row.get("category"),
        confidence: row.get("confidence"),
        source_handoff_ids: handoff_ids
            .iter()
            .map(|s| parse_id::<HandoffId>(T, s))
            .collect::<EngramResult<_>>()?,
        source_count: row.get("source_count"),
        last_reinforced_at: row.get("last_reinforced_at"),
        created_at: row.get("created_at"),
    })
}

fn note_from_row(row: &Row) -> EngramResult<KnowledgeNote> {
    const T: &str = "knowledge_notes";
    Ok(KnowledgeNote {
        note_id: parse_id(T, row.get::<_, &str>("note_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        agent_id: scope_key(T, row.get("agent_id"))?,
        channel: parse_enum::<Channel>(T, row.get("channel"))?,
        sensitivity: parse_enum::<Sensitivity>(T, row.get("sensitivity"))?,
        text: row.get("body"),
        tags: row.get("tags"),
        with_whom: row.get("with_whom"),
        embedding: row.get("embedding"),
        created_at: row.get("created_at"),
    })
}

fn capsule_from_row(row: &Row) -> EngramResult<Capsule> {
    const T: &str = "capsules";
    let audience: Vec<String> = row.get("audience_agent_ids");
    Ok(Capsule {
        capsule_id: parse_id(T, row.get::<_, &str>("capsule_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        scope: row.get("scope"),
        subject_type: row.get("subject_type"),
        subject_id: row.get("subject_id"),
        author_agent_id: scope_key(T, row.get("author_agent_id"))?,
        audience_agent_ids: audience
            .into_iter()
            .map(|s| scope_key::<AgentId>(T, s))
            .collect::<EngramResult<_>>()?,
        items: serde_json::from_value(row.get("items"))
            .map_err(|e| corrupt(T, format!("bad items: {}", e)))?,
        risks: row.get("risks"),
        ttl_days: row.get("ttl_days"),
        status: parse_enum::<CapsuleStatus>(T, row.get("status"))?,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

fn edit_from_row(row: &Row) -> EngramResult<MemoryEdit> {
    const T: &str = "memory_edits";
    Ok(MemoryEdit {
        edit_id: parse_id(T, row.get::<_, &str>("edit_id"))?,
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        op: parse_enum::<EditOp>(T, row.get("op"))?,
        target: MemoryRef::from_str(row.get("target"))
            .map_err(|_| corrupt(T, "bad target ref"))?,
        reason: row.get("reason"),
        proposed_by: parse_enum::<Proposer>(T, row.get("proposed_by"))?,
        status: parse_enum::<EditStatus>(T, row.get("status"))?,
        patch: serde_json::from_value::<EditPatch>(row.get("patch"))
            .map_err(|e| corrupt(T, format!("bad patch: {}", e)))?,
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
    })
}

fn report_from_row(row: &Row) -> EngramResult<ConsolidationReport> {
    const T: &str = "consolidation_reports";
    Ok(ConsolidationReport {
        tenant_id: scope_key(T, row.get("tenant_id"))?,
        job_type: parse_enum::<JobType>(T, row.get("job_type"))?,
        items_processed: row.get("items_processed"),
        items_affected: row.get("items_affected"),
        tokens_saved: row.get("tokens_saved"),
        details: row.get("details"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

// ============================================================================
// SQL FRAGMENTS
// ============================================================================

const INSERT_EVENT: &str = "INSERT INTO events \
    (event_id, tenant_id, session_id, agent_id, channel, actor_kind, actor_id, kind, \
     sensitivity, tags, content, refs, content_hash, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)";

const INSERT_CHUNK: &str = "INSERT INTO chunks \
    (chunk_id, event_id, tenant_id, session_id, agent_id, channel, kind, sensitivity, \
     tags, seq, body, token_est, importance, pinned, active, terms, content_hash, \
     simhash, embedding, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
     $18, $19, $20)";

const INSERT_DECISION: &str = "INSERT INTO decisions \
    (decision_id, tenant_id, session_id, agent_id, channel, status, scope, decision, \
     rationale, constraints, alternatives, consequences, refs, pinned, created_at, \
     superseded_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";

const UPSERT_TASK: &str = "INSERT INTO tasks \
    (task_id, tenant_id, session_id, status, title, details, refs, owner, created_at, \
     updated_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
    ON CONFLICT (task_id) DO UPDATE SET \
     status = EXCLUDED.status, title = EXCLUDED.title, details = EXCLUDED.details, \
     refs = EXCLUDED.refs, owner = EXCLUDED.owner, updated_at = EXCLUDED.updated_at \
    WHERE tasks.tenant_id = EXCLUDED.tenant_id";

const INSERT_ARTIFACT: &str = "INSERT INTO artifacts \
    (artifact_id, tenant_id, session_id, kind, bytes, uri, metadata, refs, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

#[async_trait]
impl Store for PgStore {
    async fn insert_event_bundle(&self, bundle: &EventBundle) -> EngramResult<()> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        let event = &bundle.event;

        // Flip the predecessor first so a missing/foreign row aborts before
        // any insert.
        if let Some(predecessor) = bundle.supersedes {
            let updated = tx
                .execute(
                    "UPDATE decisions SET status = 'superseded', superseded_at = $3 \
                     WHERE decision_id = $1 AND tenant_id = $2 AND status = 'active'",
                    &[
                        &predecessor.render(),
                        &event.tenant_id.as_str(),
                        &event.created_at,
                    ],
                )
                .await
                .map_err(db_err)?;
            if updated == 0 {
                return Err(EngramError::NotFound {
                    entity: "decision",
                    id: predecessor.render(),
                });
            }
        }

        let content = serde_json::to_value(&event.content)
            .map_err(|e| EngramError::Fatal { reason: e.to_string() })?;
        tx.execute(
            INSERT_EVENT,
            &[
                &event.event_id.render(),
                &event.tenant_id.as_str(),
                &event.session_id.as_str(),
                &event.agent_id.as_str(),
                &event.channel.as_db_str(),
                &event.actor.kind.as_db_str(),
                &event.actor.id,
                &event.kind.as_db_str(),
                &event.sensitivity.as_db_str(),
                &event.tags,
                &content,
                &render_refs(&event.refs),
                &event.content_hash.as_slice(),
                &event.created_at,
            ],
        )
        .await
        .map_err(db_err)?;

        for chunk in &bundle.chunks {
            tx.execute(
                INSERT_CHUNK,
                &[
                    &chunk.chunk_id.render(),
                    &chunk.event_id.render(),
                    &chunk.tenant_id.as_str(),
                    &chunk.session_id.as_str(),
                    &chunk.agent_id.as_str(),
                    &chunk.channel.as_db_str(),
                    &chunk.kind.as_db_str(),
                    &chunk.sensitivity.as_db_str(),
                    &chunk.tags,
                    &chunk.seq,
                    &chunk.text,
                    &chunk.token_est,
                    &chunk.importance,
                    &chunk.pinned,
                    &chunk.active,
                    &chunk.terms,
                    &chunk.content_hash.as_slice(),
                    &(chunk.simhash as i64),
                    &chunk.embedding,
                    &chunk.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        if let Some(artifact) = &bundle.artifact {
            tx.execute(
                INSERT_ARTIFACT,
                &[
                    &artifact.artifact_id.render(),
                    &artifact.tenant_id.as_str(),
                    &artifact.session_id.as_str(),
                    &artifact.kind,
                    &artifact.bytes,
                    &artifact.uri,
                    &artifact.metadata,
                    &render_refs(&artifact.refs),
                    &artifact.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        if let Some(decision) = &bundle.decision {
            tx.execute(
                INSERT_DECISION,
                &[
                    &decision.decision_id.render(),
                    &decision.tenant_id.as_str(),
                    &decision.session_id.as_str(),
                    &decision.agent_id.as_str(),
                    &decision.channel.as_db_str(),
                    &decision.status.as_db_str(),
                    &decision.scope.as_db_str(),
                    &decision.decision,
                    &decision.rationale,
                    &decision.constraints,
                    &decision.alternatives,
                    &decision.consequences,
                    &render_refs(&decision.refs),
                    &decision.pinned,
                    &decision.created_at,
                    &decision.superseded_at,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        if let Some(task) = &bundle.task {
            tx.execute(
                UPSERT_TASK,
                &[
                    &task.task_id.render(),
                    &task.tenant_id.as_str(),
                    &task.session_id.as_str(),
                    &task.status.as_db_str(),
                    &task.title,
                    &task.details,
                    &render_refs(&task.refs),
                    &task.owner,
                    &task.created_at,
                    &task.updated_at,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn get_event(&self, tenant: &TenantId, id: EventId) -> EngramResult<Option<Event>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM events WHERE event_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_session_events(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: usize,
    ) -> EngramResult<Vec<Event>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM events WHERE tenant_id = $1 AND session_id = $2 \
                 ORDER BY event_id DESC LIMIT $3",
                &[&tenant.as_str(), &session.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn list_events(&self, tenant: &TenantId, limit: usize) -> EngramResult<Vec<Event>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM events WHERE tenant_id = $1 ORDER BY event_id ASC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_chunk(&self, tenant: &TenantId, id: ChunkId) -> EngramResult<Option<Chunk>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM chunks WHERE chunk_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn list_recent_chunks(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM chunks WHERE tenant_id = $1 AND active \
                 ORDER BY chunk_id DESC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn list_session_chunks(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM chunks WHERE tenant_id = $1 AND session_id = $2 AND active \
                 ORDER BY chunk_id DESC LIMIT $3",
                &[&tenant.as_str(), &session.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn list_pinned_chunks(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM chunks WHERE tenant_id = $1 AND active AND pinned \
                 ORDER BY chunk_id DESC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn search_chunks_lexical(
        &self,
        tenant: &TenantId,
        terms: &[String],
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        // Rank by how many of the chunk's terms appear in the query set; the
        // same counting the in-memory store does.
        let rows = conn
            .query(
                "SELECT *, \
                   (SELECT count(*) FROM unnest(terms) t WHERE t = ANY($2)) AS hits \
                 FROM chunks \
                 WHERE tenant_id = $1 AND active AND terms && $2 \
                 ORDER BY hits DESC, chunk_id DESC LIMIT $3",
                &[&tenant.as_str(), &terms, &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn list_chunks_by_tags(
        &self,
        tenant: &TenantId,
        tags: &[String],
        limit: usize,
    ) -> EngramResult<Vec<Chunk>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM chunks WHERE tenant_id = $1 AND active AND tags && $2 \
                 ORDER BY chunk_id DESC LIMIT $3",
                &[&tenant.as_str(), &tags, &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn search_chunks_vector(
        &self,
        tenant: &TenantId,
        query: &[f32],
        limit: usize,
    ) -> EngramResult<Vec<(ChunkId, f32)>> {
        // Without the pgvector extension installed, rank in process over the
        // stored arrays. Candidate count is bounded by the recency index.
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT chunk_id, embedding FROM chunks \
                 WHERE tenant_id = $1 AND active AND embedding IS NOT NULL \
                 ORDER BY chunk_id DESC LIMIT 4000",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        let mut scored: Vec<(ChunkId, f32)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: ChunkId = parse_id("chunks", row.get::<_, &str>("chunk_id"))?;
            let embedding: Vec<f32> = row.get("embedding");
            scored.push((id, engram_core::cosine_similarity(query, &embedding)));
        }
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
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE chunks SET embedding = $3 WHERE chunk_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str(), &embedding.to_vec()],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(EngramError::NotFound {
                entity: "chunk",
                id: id.render(),
            });
        }
        Ok(())
    }

    async fn apply_chunk_patch(
        &self,
        tenant: &TenantId,
        id: ChunkId,
        patch: &ChunkPatch,
    ) -> EngramResult<()> {
        let conn = self.conn().await?;
        let content_hash = patch.content_hash.map(|h| h.to_vec());
        let simhash = patch.simhash.map(|s| s as i64);
        let importance = patch.importance.map(|i| i.clamp(0.0, 1.0));
        let channel = patch.channel.map(|c| c.as_db_str());
        // When `importance` is absent the stored value shifts by
        // `importance_delta` (or stays put), clamped to [0, 1].
        let updated = conn
            .execute(
                "UPDATE chunks SET \
                   body = COALESCE($3, body), \
                   token_est = COALESCE($4, token_est), \
                   terms = COALESCE($5, terms), \
                   content_hash = COALESCE($6, content_hash), \
                   simhash = COALESCE($7, simhash), \
                   importance = greatest(0.0, least(1.0, \
                     COALESCE($8, importance + COALESCE($9, 0.0)))), \
                   channel = COALESCE($10, channel), \
                   active = COALESCE($11, active) \
                 WHERE chunk_id = $1 AND tenant_id = $2",
                &[
                    &id.render(),
                    &tenant.as_str(),
                    &patch.text,
                    &patch.token_est,
                    &patch.terms,
                    &content_hash,
                    &simhash,
                    &importance,
                    &patch.importance_delta,
                    &channel,
                    &patch.active,
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(EngramError::NotFound {
                entity: "chunk",
                id: id.render(),
            });
        }
        Ok(())
    }

    async fn count_chunks(&self, tenant: &TenantId) -> EngramResult<i64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT count(*) FROM chunks WHERE tenant_id = $1",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get(0))
    }

    async fn restricted_chunk_ids(
        &self,
        tenant: &TenantId,
        agent: &AgentId,
    ) -> EngramResult<HashSet<ChunkId>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT items FROM capsules \
                 WHERE tenant_id = $1 AND status = 'active' AND NOT ($2 = ANY(audience_agent_ids))",
                &[&tenant.as_str(), &agent.as_str()],
            )
            .await
            .map_err(db_err)?;
        let mut restricted = HashSet::new();
        for row in &rows {
            let items: CapsuleItems = serde_json::from_value(row.get("items"))
                .map_err(|e| corrupt("capsules", format!("bad items: {}", e)))?;
            restricted.extend(items.chunks);
        }
        Ok(restricted)
    }

    async fn get_decision(
        &self,
        tenant: &TenantId,
        id: DecisionId,
    ) -> EngramResult<Option<Decision>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM decisions WHERE decision_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(decision_from_row).transpose()
    }

    async fn list_active_decisions(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Decision>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM decisions WHERE tenant_id = $1 AND status = 'active' \
                 ORDER BY decision_id DESC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(decision_from_row).collect()
    }

    async fn set_decision_status(
        &self,
        tenant: &TenantId,
        id: DecisionId,
        status: DecisionStatus,
        superseded_at: Option<Timestamp>,
    ) -> EngramResult<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE decisions SET status = $3, \
                   superseded_at = COALESCE($4, superseded_at) \
                 WHERE decision_id = $1 AND tenant_id = $2",
                &[
                    &id.render(),
                    &tenant.as_str(),
                    &status.as_db_str(),
                    &superseded_at,
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(EngramError::NotFound {
                entity: "decision",
                id: id.render(),
            });
        }
        Ok(())
    }

    async fn list_decisions_for_archive(
        &self,
        tenant: &TenantId,
        cutoff: Timestamp,
    ) -> EngramResult<Vec<Decision>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM decisions \
                 WHERE tenant_id = $1 AND status = 'active' AND NOT pinned \
                   AND created_at < $2",
                &[&tenant.as_str(), &cutoff],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(decision_from_row).collect()
    }

    async fn get_task(&self, tenant: &TenantId, id: TaskId) -> EngramResult<Option<Task>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM tasks WHERE task_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_open_tasks(&self, tenant: &TenantId, limit: usize) -> EngramResult<Vec<Task>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM tasks WHERE tenant_id = $1 AND status <> 'done' \
                 ORDER BY updated_at DESC, task_id DESC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> EngramResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            INSERT_ARTIFACT,
            &[
                &artifact.artifact_id.render(),
                &artifact.tenant_id.as_str(),
                &artifact.session_id.as_str(),
                &artifact.kind,
                &artifact.bytes,
                &artifact.uri,
                &artifact.metadata,
                &render_refs(&artifact.refs),
                &artifact.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_artifact(
        &self,
        tenant: &TenantId,
        id: ArtifactId,
        max_bytes: usize,
    ) -> EngramResult<Option<Artifact>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT artifact_id, tenant_id, session_id, kind, \
                   substring(bytes from 1 for $3) AS bytes, uri, metadata, refs, created_at \
                 FROM artifacts WHERE artifact_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str(), &(max_bytes as i32)],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn insert_handoff(&self, handoff: &Handoff) -> EngramResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO handoffs \
             (handoff_id, tenant_id, session_id, agent_id, experienced, noticed, learned, \
              story, becoming, remember, significance, tags, with_whom, compression_level, \
              summary, quick_ref, refs, created_at, consolidated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
              $16, $17, $18, $19)",
            &[
                &handoff.handoff_id.render(),
                &handoff.tenant_id.as_str(),
                &handoff.session_id.as_str(),
                &handoff.agent_id.as_str(),
                &handoff.experienced,
                &handoff.noticed,
                &handoff.learned,
                &handoff.story,
                &handoff.becoming,
                &handoff.remember,
                &handoff.significance,
                &handoff.tags,
                &handoff.with_whom,
                &handoff.compression_level.as_db_str(),
                &handoff.summary,
                &handoff.quick_ref,
                &render_refs(&handoff.refs),
                &handoff.created_at,
                &handoff.consolidated_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_handoff(
        &self,
        tenant: &TenantId,
        id: HandoffId,
    ) -> EngramResult<Option<Handoff>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM handoffs WHERE handoff_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(handoff_from_row).transpose()
    }

    async fn get_latest_handoff(
        &self,
        tenant: &TenantId,
        agent: Option<&AgentId>,
    ) -> EngramResult<Option<Handoff>> {
        let conn = self.conn().await?;
        let row = match agent {
            Some(agent) => conn
                .query_opt(
                    "SELECT * FROM handoffs WHERE tenant_id = $1 AND agent_id = $2 \
                     ORDER BY handoff_id DESC LIMIT 1",
                    &[&tenant.as_str(), &agent.as_str()],
                )
                .await
                .map_err(db_err)?,
            None => conn
                .query_opt(
                    "SELECT * FROM handoffs WHERE tenant_id = $1 \
                     ORDER BY handoff_id DESC LIMIT 1",
                    &[&tenant.as_str()],
                )
                .await
                .map_err(db_err)?,
        };
        row.as_ref().map(handoff_from_row).transpose()
    }

    async fn list_handoffs(
        &self,
        tenant: &TenantId,
        limit: usize,
        before: Option<Timestamp>,
    ) -> EngramResult<Vec<Handoff>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM handoffs WHERE tenant_id = $1 \
                   AND ($2::timestamptz IS NULL OR created_at < $2) \
                 ORDER BY handoff_id DESC LIMIT $3",
                &[&tenant.as_str(), &before, &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(handoff_from_row).collect()
    }

    async fn list_identity_thread(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<Handoff>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM handoffs \
                 WHERE tenant_id = $1 AND becoming IS NOT NULL AND btrim(becoming) <> '' \
                 ORDER BY handoff_id DESC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(handoff_from_row).collect()
    }

    async fn list_handoffs_at_level(
        &self,
        tenant: &TenantId,
        level: CompressionLevel,
        cutoff: Timestamp,
    ) -> EngramResult<Vec<Handoff>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM handoffs \
                 WHERE tenant_id = $1 AND compression_level = $2 AND created_at < $3",
                &[&tenant.as_str(), &level.as_db_str(), &cutoff],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(handoff_from_row).collect()
    }

    async fn update_handoff_compression(
        &self,
        tenant: &TenantId,
        id: HandoffId,
        update: &HandoffCompressionUpdate,
    ) -> EngramResult<()> {
        let conn = self.conn().await?;
        let level = update.compression_level.map(|l| l.as_db_str());
        let updated = conn
            .execute(
                "UPDATE handoffs SET \
                   compression_level = COALESCE($3, compression_level), \
                   summary = COALESCE($4, summary), \
                   quick_ref = COALESCE($5, quick_ref), \
                   consolidated_at = COALESCE($6, consolidated_at), \
                   experienced = CASE WHEN $7 THEN '' ELSE experienced END, \
                   noticed = CASE WHEN $7 THEN '' ELSE noticed END, \
                   learned = CASE WHEN $7 THEN '' ELSE learned END, \
                   story = CASE WHEN $7 THEN '' ELSE story END \
                 WHERE handoff_id = $1 AND tenant_id = $2",
                &[
                    &id.render(),
                    &tenant.as_str(),
                    &level,
                    &update.summary,
                    &update.quick_ref,
                    &update.consolidated_at,
                    &update.clear_full_fields,
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(EngramError::NotFound {
                entity: "handoff",
                id: id.render(),
            });
        }
        Ok(())
    }

    async fn list_principles(&self, tenant: &TenantId) -> EngramResult<Vec<SemanticPrinciple>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM semantic_principles WHERE tenant_id = $1 \
                 ORDER BY principle_id DESC",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(principle_from_row).collect()
    }

    async fn upsert_principle(&self, principle: &SemanticPrinciple) -> EngramResult<()> {
        let conn = self.conn().await?;
        let handoff_ids: Vec<String> = principle
            .source_handoff_ids
            .iter()
            .map(|id| id.render())
            .collect();
        conn.execute(
            "INSERT INTO semantic_principles \
             (principle_id, tenant_id, principle, context, category, confidence, \
              source_handoff_ids, source_count, last_reinforced_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (principle_id) DO UPDATE SET \
              principle = EXCLUDED.principle, context = EXCLUDED.context, \
              confidence = EXCLUDED.confidence, \
              source_handoff_ids = EXCLUDED.source_handoff_ids, \
              source_count = EXCLUDED.source_count, \
              last_reinforced_at = EXCLUDED.last_reinforced_at",
            &[
                &principle.principle_id.render(),
                &principle.tenant_id.as_str(),
                &principle.principle,
                &principle.context,
                &principle.category,
                &principle.confidence,
                &handoff_ids,
                &principle.source_count,
                &principle.last_reinforced_at,
                &principle.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_note(&self, note: &KnowledgeNote) -> EngramResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO knowledge_notes \
             (note_id, tenant_id, agent_id, channel, sensitivity, body, tags, with_whom, \
              embedding, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (note_id) DO UPDATE SET embedding = EXCLUDED.embedding",
            &[
                &note.note_id.render(),
                &note.tenant_id.as_str(),
                &note.agent_id.as_str(),
                &note.channel.as_db_str(),
                &note.sensitivity.as_db_str(),
                &note.text,
                &note.tags,
                &note.with_whom,
                &note.embedding,
                &note.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_notes(
        &self,
        tenant: &TenantId,
        tags: Option<&[String]>,
        limit: usize,
    ) -> EngramResult<Vec<KnowledgeNote>> {
        let conn = self.conn().await?;
        let rows = match tags {
            Some(tags) if !tags.is_empty() => conn
                .query(
                    "SELECT * FROM knowledge_notes \
                     WHERE tenant_id = $1 AND tags && $2 \
                     ORDER BY note_id DESC LIMIT $3",
                    &[&tenant.as_str(), &tags, &(limit as i64)],
                )
                .await
                .map_err(db_err)?,
            _ => conn
                .query(
                    "SELECT * FROM knowledge_notes WHERE tenant_id = $1 \
                     ORDER BY note_id DESC LIMIT $2",
                    &[&tenant.as_str(), &(limit as i64)],
                )
                .await
                .map_err(db_err)?,
        };
        rows.iter().map(note_from_row).collect()
    }

    async fn get_note(
        &self,
        tenant: &TenantId,
        id: NoteId,
    ) -> EngramResult<Option<KnowledgeNote>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM knowledge_notes WHERE note_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(note_from_row).transpose()
    }

    async fn insert_capsule(&self, capsule: &Capsule) -> EngramResult<()> {
        let conn = self.conn().await?;
        let audience: Vec<&str> = capsule
            .audience_agent_ids
            .iter()
            .map(|a| a.as_str())
            .collect();
        let items = serde_json::to_value(&capsule.items)
            .map_err(|e| EngramError::Fatal { reason: e.to_string() })?;
        conn.execute(
            "INSERT INTO capsules \
             (capsule_id, tenant_id, scope, subject_type, subject_id, author_agent_id, \
              audience_agent_ids, items, risks, ttl_days, status, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            &[
                &capsule.capsule_id.render(),
                &capsule.tenant_id.as_str(),
                &capsule.scope,
                &capsule.subject_type,
                &capsule.subject_id,
                &capsule.author_agent_id.as_str(),
                &audience,
                &items,
                &capsule.risks,
                &capsule.ttl_days,
                &capsule.status.as_db_str(),
                &capsule.created_at,
                &capsule.expires_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_capsule(
        &self,
        tenant: &TenantId,
        id: CapsuleId,
    ) -> EngramResult<Option<Capsule>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM capsules WHERE capsule_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(capsule_from_row).transpose()
    }

    async fn list_capsules_for_audience(
        &self,
        tenant: &TenantId,
        agent: &AgentId,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        now: Timestamp,
    ) -> EngramResult<Vec<Capsule>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM capsules \
                 WHERE tenant_id = $1 AND status = 'active' AND expires_at > $2 \
                   AND $3 = ANY(audience_agent_ids) \
                   AND ($4::text IS NULL OR subject_type = $4) \
                   AND ($5::text IS NULL OR subject_id = $5) \
                 ORDER BY capsule_id DESC",
                &[
                    &tenant.as_str(),
                    &now,
                    &agent.as_str(),
                    &subject_type,
                    &subject_id,
                ],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(capsule_from_row).collect()
    }

    async fn set_capsule_status(
        &self,
        tenant: &TenantId,
        id: CapsuleId,
        status: CapsuleStatus,
    ) -> EngramResult<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE capsules SET status = $3 WHERE capsule_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str(), &status.as_db_str()],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(EngramError::NotFound {
                entity: "capsule",
                id: id.render(),
            });
        }
        Ok(())
    }

    async fn insert_edit(&self, edit: &MemoryEdit) -> EngramResult<()> {
        let conn = self.conn().await?;
        let patch = serde_json::to_value(&edit.patch)
            .map_err(|e| EngramError::Fatal { reason: e.to_string() })?;
        conn.execute(
            "INSERT INTO memory_edits \
             (edit_id, tenant_id, op, target, reason, proposed_by, status, patch, \
              created_at, resolved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &edit.edit_id.render(),
                &edit.tenant_id.as_str(),
                &edit.op.as_db_str(),
                &edit.target.render(),
                &edit.reason,
                &edit.proposed_by.as_db_str(),
                &edit.status.as_db_str(),
                &patch,
                &edit.created_at,
                &edit.resolved_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_edit(
        &self,
        tenant: &TenantId,
        id: EditId,
    ) -> EngramResult<Option<MemoryEdit>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM memory_edits WHERE edit_id = $1 AND tenant_id = $2",
                &[&id.render(), &tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(edit_from_row).transpose()
    }

    async fn set_edit_status(
        &self,
        tenant: &TenantId,
        id: EditId,
        status: EditStatus,
        resolved_at: Timestamp,
    ) -> EngramResult<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE memory_edits SET status = $3, resolved_at = $4 \
                 WHERE edit_id = $1 AND tenant_id = $2",
                &[
                    &id.render(),
                    &tenant.as_str(),
                    &status.as_db_str(),
                    &resolved_at,
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(EngramError::NotFound {
                entity: "memory_edit",
                id: id.render(),
            });
        }
        Ok(())
    }

    async fn list_edits(
        &self,
        tenant: &TenantId,
        status: Option<EditStatus>,
        limit: usize,
    ) -> EngramResult<Vec<MemoryEdit>> {
        let conn = self.conn().await?;
        let status_str = status.map(|s| s.as_db_str());
        let rows = conn
            .query(
                "SELECT * FROM memory_edits \
                 WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2) \
                 ORDER BY edit_id DESC LIMIT $3",
                &[&tenant.as_str(), &status_str, &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(edit_from_row).collect()
    }

    async fn insert_report(&self, report: &ConsolidationReport) -> EngramResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO consolidation_reports \
             (tenant_id, job_type, items_processed, items_affected, tokens_saved, \
              details, error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &report.tenant_id.as_str(),
                &report.job_type.as_db_str(),
                &report.items_processed,
                &report.items_affected,
                &report.tokens_saved,
                &report.details,
                &report.error,
                &report.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_reports(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> EngramResult<Vec<ConsolidationReport>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation_reports WHERE tenant_id = $1 \
                 ORDER BY id DESC LIMIT $2",
                &[&tenant.as_str(), &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(report_from_row).collect()
    }

    async fn append_audit(&self, entry: &AuditEntry) -> EngramResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO audit_log \
             (tenant_id, event_type, action, outcome, resource_type, resource_id, actor, \
              details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &entry.tenant_id.as_str(),
                &entry.event_type,
                &entry.action,
                &entry.outcome.as_db_str(),
                &entry.resource_type,
                &entry.resource_id,
                &entry.actor,
                &entry.details,
                &entry.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn health_check(&self) -> EngramResult<bool> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await.map_err(db_err)?;
        Ok(true)
    }

    async fn compression_stats(&self, tenant: &TenantId) -> EngramResult<CompressionStats> {
        let conn = self.conn().await?;
        let handoffs = conn
            .query(
                "SELECT compression_level, count(*) AS n FROM handoffs \
                 WHERE tenant_id = $1 GROUP BY compression_level",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        let mut stats = CompressionStats::default();
        for row in &handoffs {
            let level: CompressionLevel =
                parse_enum("handoffs", row.get("compression_level"))?;
            let count: i64 = row.get("n");
            stats.handoffs_total += count;
            match level {
                CompressionLevel::Full => stats.handoffs_full = count,
                CompressionLevel::Summary => stats.handoffs_summary = count,
                CompressionLevel::QuickRef => stats.handoffs_quick_ref = count,
                CompressionLevel::Integrated => stats.handoffs_integrated = count,
            }
        }

        let decisions = conn
            .query(
                "SELECT status, count(*) AS n FROM decisions \
                 WHERE tenant_id = $1 GROUP BY status",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        for row in &decisions {
            let status: DecisionStatus = parse_enum("decisions", row.get("status"))?;
            let count: i64 = row.get("n");
            match status {
                DecisionStatus::Active => stats.decisions_active = count,
                DecisionStatus::Superseded => stats.decisions_superseded = count,
            }
        }

        let principles = conn
            .query_one(
                "SELECT count(*) FROM semantic_principles WHERE tenant_id = $1",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        stats.principles_total = principles.get(0);

        let saved = conn
            .query_one(
                "SELECT COALESCE(sum(tokens_saved), 0) FROM consolidation_reports \
                 WHERE tenant_id = $1",
                &[&tenant.as_str()],
            )
            .await
            .map_err(db_err)?;
        stats.tokens_saved_estimate = saved.get(0);

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_config_defaults() {
        let config = PgConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "engram");
        assert_eq!(config.max_size, 16);
    }

    #[test]
    fn test_render_and_parse_refs() {
        let event = EventId::generate();
        let decision = DecisionId::generate();
        let refs = vec![MemoryRef::Event(event), MemoryRef::Decision(decision)];
        let rendered = render_refs(&refs);
        assert_eq!(rendered.len(), 2);
        let parsed = parse_refs("events", rendered).unwrap();
        assert_eq!(parsed, refs);
    }

    #[test]
    fn test_parse_refs_rejects_garbage() {
        let result = parse_refs("events", vec!["nonsense".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_hash_from_bytes_length_check() {
        assert!(hash_from_bytes("events", vec![0u8; 32]).is_ok());
        assert!(hash_from_bytes("events", vec![0u8; 31]).is_err());
    }
}
