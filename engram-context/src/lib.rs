//! Engram Context - Active Context Bundle assembly
//!
//! Builds the budgeted payload for one model call: small pinned views first,
//! then decisions, retrieved evidence, the recent window and tool state,
//! greedily packed by descending score under per-section caps and the overall
//! `max_tokens - reserve_tokens` budget. Duplicates collapse via content hash
//! and SimHash; every exclusion is recorded in the omissions list; provenance
//! makes the whole assembly reproducible.

use chrono::Utc;
use engram_core::{
    AgentId, Capsule, Channel, Chunk, ContentHash, Decision, EngramConfig, EngramError,
    EngramResult, EmbeddingProvider, Handoff, Intent, MemoryIdType, OmissionReason,
    SectionName, SessionId, TenantId, Timestamp, compute_content_hash, estimate_tokens,
    hamming_distance, simhash64, unique_terms,
};
use engram_retrieval::{RetrievalQuery, Retriever, ScoredChunk};
use engram_storage::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ============================================================================
// REQUEST AND BUNDLE TYPES
// ============================================================================

/// A bundle-assembly request.
#[derive(Debug, Clone)]
pub struct AcbRequest {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub intent: Intent,
    pub query_text: String,
    pub tag_filters: Vec<String>,
    /// Overall cap; defaults to the configured `acb.total_max_tokens`.
    pub max_tokens: Option<i32>,
    /// Headroom for the subsequent user/tool payload; defaults configured.
    pub reserve_tokens: Option<i32>,
    /// Wall-clock deadline; sections not assembled in time are omitted with
    /// reason `deadline`.
    pub deadline: Option<Instant>,
}

impl AcbRequest {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        agent_id: AgentId,
        channel: Channel,
        query_text: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            session_id,
            agent_id,
            channel,
            intent: Intent::default(),
            query_text: query_text.into(),
            tag_filters: Vec::new(),
            max_tokens: None,
            reserve_tokens: None,
            deadline: None,
        }
    }
}

/// One packed item. Text is inlined so callers need no second round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcbItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub text: String,
    pub refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub token_est: i32,
}

/// One packed section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcbSection {
    pub name: SectionName,
    pub items: Vec<AcbItem>,
    pub token_est: i32,
}

/// Why candidates were left out, grouped by reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Omission {
    pub reason: OmissionReason,
    pub candidates: Vec<String>,
}

/// Scoring parameters as applied, reported for reproducibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringProvenance {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub recency_tau_seconds: f64,
    pub rrf_k: f64,
    pub semantic_used: bool,
}

/// Everything needed to explain (and reproduce) the assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub policy_version: String,
    pub intent: String,
    pub query_terms: Vec<String>,
    pub candidate_pool_size: usize,
    pub filters: serde_json::Value,
    pub scoring: ScoringProvenance,
    pub store_reads: u32,
    /// Always "none": assembly is fully deterministic.
    pub deterministic_seed: String,
}

/// The Active Context Bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acb {
    pub acb_id: String,
    pub budget_tokens: i32,
    pub token_used_est: i32,
    pub sections: Vec<AcbSection>,
    pub omissions: Vec<Omission>,
    pub provenance: Provenance,
}

impl Acb {
    /// Find a section by name.
    pub fn section(&self, name: SectionName) -> Option<&AcbSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// All omitted candidate ids for one reason.
    pub fn omitted(&self, reason: OmissionReason) -> Vec<&str> {
        self.omissions
            .iter()
            .filter(|o| o.reason == reason)
            .flat_map(|o| o.candidates.iter().map(String::as_str))
            .collect()
    }
}

// ============================================================================
// INTERNAL PACKING STATE
// ============================================================================

/// A candidate item before packing, with the hashes dedupe needs.
struct PendingItem {
    item_type: &'static str,
    text: String,
    refs: Vec<String>,
    score: Option<f64>,
    token_est: i32,
    hash: ContentHash,
    simhash: u64,
    /// Id recorded in the omissions list if this item is dropped.
    omission_id: String,
}

impl PendingItem {
    fn from_text(
        item_type: &'static str,
        text: String,
        refs: Vec<String>,
        score: Option<f64>,
        omission_id: String,
    ) -> Self {
        let token_est = estimate_tokens(&text);
        let hash = compute_content_hash(text.as_bytes());
        let simhash = simhash64(&text);
        Self {
            item_type,
            text,
            refs,
            score,
            token_est,
            hash,
            simhash,
            omission_id,
        }
    }

    fn from_chunk(sc: &ScoredChunk) -> Self {
        let chunk = &sc.chunk;
        Self {
            item_type: "chunk",
            text: chunk.text.clone(),
            refs: vec![chunk.chunk_id.render(), chunk.event_id.render()],
            score: Some(sc.score),
            token_est: chunk.token_est,
            hash: chunk.content_hash,
            simhash: chunk.simhash,
            omission_id: chunk.chunk_id.render(),
        }
    }

    fn from_plain_chunk(chunk: &Chunk, extra_ref: Option<String>) -> Self {
        let mut refs = vec![chunk.chunk_id.render(), chunk.event_id.render()];
        if let Some(r) = extra_ref {
            refs.push(r);
        }
        Self {
            item_type: "chunk",
            text: chunk.text.clone(),
            refs,
            score: None,
            token_est: chunk.token_est,
            hash: chunk.content_hash,
            simhash: chunk.simhash,
            omission_id: chunk.chunk_id.render(),
        }
    }
}

/// Dedupe state shared across sections.
struct DedupeState {
    hashes: std::collections::HashSet<ContentHash>,
    simhashes: Vec<u64>,
    hamming_max: u32,
}

impl DedupeState {
    fn new(hamming_max: u32) -> Self {
        Self {
            hashes: std::collections::HashSet::new(),
            simhashes: Vec::new(),
            hamming_max,
        }
    }

    fn is_duplicate(&self, item: &PendingItem) -> bool {
        if self.hashes.contains(&item.hash) {
            return true;
        }
        item.simhash != 0
            && self
                .simhashes
                .iter()
                .any(|&s| hamming_distance(s, item.simhash) <= self.hamming_max)
    }

    fn register(&mut self, item: &PendingItem) {
        self.hashes.insert(item.hash);
        if item.simhash != 0 {
            self.simhashes.push(item.simhash);
        }
    }
}

/// Greedy packer enforcing both the section cap and the overall budget.
struct Packer {
    budget_remaining: i32,
    dedupe: DedupeState,
    omitted: Vec<(OmissionReason, String)>,
}

impl Packer {
    fn new(budget: i32, hamming_max: u32) -> Self {
        Self {
            budget_remaining: budget,
            dedupe: DedupeState::new(hamming_max),
            omitted: Vec::new(),
        }
    }

    fn pack_section(
        &mut self,
        name: SectionName,
        cap: i32,
        items: Vec<PendingItem>,
    ) -> AcbSection {
        let mut kept = Vec::new();
        let mut used = 0i32;
        for item in items {
            if item.token_est <= 0 {
                continue;
            }
            if self.dedupe.is_duplicate(&item) {
                self.omitted
                    .push((OmissionReason::Dedupe, item.omission_id));
                continue;
            }
            if used + item.token_est > cap || item.token_est > self.budget_remaining {
                self.omitted
                    .push((OmissionReason::Budget, item.omission_id));
                continue;
            }
            used += item.token_est;
            self.budget_remaining -= item.token_est;
            self.dedupe.register(&item);
            kept.push(AcbItem {
                item_type: item.item_type.to_string(),
                text: item.text,
                refs: item.refs,
                score: item.score,
                token_est: item.token_est,
            });
        }
        AcbSection {
            name,
            items: kept,
            token_est: used,
        }
    }

    fn omit(&mut self, reason: OmissionReason, id: String) {
        self.omitted.push((reason, id));
    }

    fn into_omissions(self) -> Vec<Omission> {
        let mut grouped: Vec<Omission> = Vec::new();
        for (reason, id) in self.omitted {
            match grouped.iter_mut().find(|o| o.reason == reason) {
                Some(entry) => entry.candidates.push(id),
                None => grouped.push(Omission {
                    reason,
                    candidates: vec![id],
                }),
            }
        }
        grouped
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles Active Context Bundles. Holds no per-tenant state between calls.
#[derive(Clone)]
pub struct AcbBuilder {
    config: Arc<EngramConfig>,
    retriever: Retriever,
}

impl AcbBuilder {
    pub fn new(config: Arc<EngramConfig>) -> Self {
        let retriever = Retriever::new(Arc::clone(&config));
        Self { config, retriever }
    }

    /// Build one bundle.
    pub async fn build(
        &self,
        store: &dyn Store,
        embedder: Option<&dyn EmbeddingProvider>,
        req: &AcbRequest,
    ) -> EngramResult<Acb> {
        let now = Utc::now();
        let max_tokens = req
            .max_tokens
            .unwrap_or(self.config.acb.total_max_tokens)
            .min(self.config.acb.total_max_tokens);
        let reserve = req
            .reserve_tokens
            .unwrap_or(self.config.acb.reserve_tokens)
            .max(0);
        let budget = max_tokens - reserve;
        if budget <= 0 {
            return Err(EngramError::BudgetImpossible {
                required: reserve as i64,
                max_tokens: max_tokens as i64,
            });
        }

        let query_terms = unique_terms(&req.query_text);
        let query_simhash = simhash64(&req.query_text);
        let mut store_reads = 0u32;
        let mut packer = Packer::new(budget, self.config.dedupe.simhash_hamming_max);

        // Small pinned views, fetched once.
        let principles = store.list_principles(&req.tenant_id).await?;
        store_reads += 1;
        let latest_handoff = store.get_latest_handoff(&req.tenant_id, None).await?;
        store_reads += 1;
        let rules_notes = store
            .list_notes(&req.tenant_id, Some(&["rules".to_string()]), 50)
            .await?;
        store_reads += 1;

        let mut identity_items =
            Some(self.identity_items(&principles, latest_handoff.as_ref(), &mut packer));
        let mut rules_items: Option<Vec<PendingItem>> = Some(
            rules_notes
                .iter()
                .filter(|n| self.note_visible(req.channel, n))
                .map(|n| {
                    PendingItem::from_text(
                        "view",
                        n.text.clone(),
                        vec![n.note_id.render()],
                        None,
                        n.note_id.render(),
                    )
                })
                .collect(),
        );

        // The required views must fit on their own.
        let sections_cfg = &self.config.acb.sections;
        let identity_required: i32 = required_tokens(
            identity_items.as_deref().unwrap_or_default(),
            sections_cfg.get(SectionName::Identity).max_tokens,
        );
        let rules_required: i32 = required_tokens(
            rules_items.as_deref().unwrap_or_default(),
            sections_cfg.get(SectionName::Rules).max_tokens,
        );
        if identity_required + rules_required > budget {
            return Err(EngramError::BudgetImpossible {
                required: (identity_required + rules_required) as i64,
                max_tokens: budget as i64,
            });
        }

        // Session hot set feeds recent_window and tool_state.
        let session_chunks = store
            .list_session_chunks(
                &req.tenant_id,
                &req.session_id,
                self.config.retrieval.hotset_recent_events_max,
            )
            .await?;
        store_reads += 1;

        // Active decisions (bounded top-M), channel-filtered.
        let decisions = store
            .list_active_decisions(
                &req.tenant_id,
                self.config.retrieval.active_decisions_max,
            )
            .await?;
        store_reads += 1;

        // Open tasks.
        let tasks = store.list_open_tasks(&req.tenant_id, 50).await?;
        store_reads += 1;

        // Retrieval, unless the intent takes the fast path.
        let fast_path = req.intent.is_fast_path();
        let (evidence_scored, pool_size, suppressed, semantic_used) = if fast_path {
            (Vec::new(), 0usize, Vec::new(), false)
        } else {
            let rq = RetrievalQuery {
                tenant_id: req.tenant_id.clone(),
                session_id: req.session_id.clone(),
                agent_id: req.agent_id.clone(),
                channel: req.channel,
                query_text: req.query_text.clone(),
                intent: req.intent.clone(),
                tag_filters: req.tag_filters.clone(),
                since: None,
                candidate_pool_max: None,
                retrieved_chunks_max: None,
            };
            let outcome = self
                .retriever
                .retrieve(store, embedder, &rq, now)
                .await?;
            store_reads += 6; // candidate sources + restriction set
            (
                outcome.scored,
                outcome.candidate_pool_size,
                outcome.suppressed,
                outcome.semantic_used,
            )
        };
        for id in &suppressed {
            packer.omit(OmissionReason::Privacy, id.render());
        }

        // Capsule merge: shared items whose subject matches this request.
        let capsule_items = if fast_path {
            Vec::new()
        } else {
            let capsules = store
                .list_capsules_for_audience(&req.tenant_id, &req.agent_id, None, None, now)
                .await?;
            store_reads += 1;
            let (items, skipped) = self
                .capsule_evidence(store, req, &capsules, &query_terms, &mut store_reads)
                .await?;
            // The per-call read budget bounds capsule fetches; what could
            // not be fetched is a recorded omission, never silent.
            for id in skipped {
                packer.omit(OmissionReason::Budget, id);
            }
            items
        };

        // Knowledge notes share the retrieval pool: lexically relevant (or
        // tag-matched) visible notes join the evidence candidates.
        let note_items: Vec<PendingItem> = if fast_path {
            Vec::new()
        } else {
            let notes = store.list_notes(&req.tenant_id, None, 100).await?;
            store_reads += 1;
            notes
                .iter()
                .filter(|n| self.note_visible(req.channel, n))
                .filter_map(|n| {
                    let terms = engram_core::normalize_terms(&n.text);
                    let lexical = engram_retrieval::lexical_score(&terms, &query_terms);
                    let tag_hit = !req.tag_filters.is_empty()
                        && n.tags.iter().any(|t| req.tag_filters.contains(t));
                    if lexical <= 0.0 && !tag_hit {
                        return None;
                    }
                    let s = &self.config.scoring;
                    let recency = engram_retrieval::recency_score(
                        n.created_at,
                        now,
                        s.recency_tau_seconds,
                    );
                    let score = s.alpha * lexical + s.beta * recency + s.gamma * 0.5;
                    Some(PendingItem::from_text(
                        "note",
                        n.text.clone(),
                        vec![n.note_id.render()],
                        Some(score),
                        n.note_id.render(),
                    ))
                })
                .collect()
        };

        // Assemble sections in priority order.
        let deadline_hit = |req: &AcbRequest| {
            req.deadline
                .map(|d| Instant::now() >= d)
                .unwrap_or(false)
        };
        let mut sections = Vec::new();
        let mut deadline_skipped: Vec<SectionName> = Vec::new();
        for (name, budget_cfg) in sections_cfg.ordered() {
            if deadline_hit(req) {
                deadline_skipped.push(name);
                continue;
            }
            let items = match name {
                SectionName::Identity => identity_items.take().unwrap_or_default(),
                SectionName::Rules => rules_items.take().unwrap_or_default(),
                SectionName::TaskState => tasks
                    .iter()
                    .map(|t| {
                        let text = match &t.details {
                            Some(details) => {
                                format!("[{}] {}: {}", t.status, t.title, details)
                            }
                            None => format!("[{}] {}", t.status, t.title),
                        };
                        PendingItem::from_text(
                            "task",
                            text,
                            vec![t.task_id.render()],
                            None,
                            t.task_id.render(),
                        )
                    })
                    .collect(),
                SectionName::RelevantDecisions => {
                    self.decision_items(&decisions, &query_terms, now)
                }
                SectionName::RetrievedEvidence => {
                    let mut items: Vec<PendingItem> = evidence_scored
                        .iter()
                        .filter(|sc| {
                            // Query echoes belong to the recent window.
                            sc.chunk.simhash == 0
                                || query_simhash == 0
                                || hamming_distance(sc.chunk.simhash, query_simhash)
                                    > self.config.dedupe.simhash_hamming_max
                        })
                        .map(PendingItem::from_chunk)
                        .collect();
                    items.extend(capsule_items.iter().map(|(chunk, capsule_id)| {
                        PendingItem::from_plain_chunk(chunk, Some(capsule_id.clone()))
                    }));
                    // Notes ride along after the ranked chunks, best first.
                    let mut notes: Vec<PendingItem> = note_items
                        .iter()
                        .map(|n| {
                            PendingItem::from_text(
                                "note",
                                n.text.clone(),
                                n.refs.clone(),
                                n.score,
                                n.omission_id.clone(),
                            )
                        })
                        .collect();
                    notes.sort_by(|a, b| {
                        b.score
                            .unwrap_or(0.0)
                            .total_cmp(&a.score.unwrap_or(0.0))
                            .then_with(|| a.omission_id.cmp(&b.omission_id))
                    });
                    items.extend(notes);
                    items
                }
                SectionName::RecentWindow => session_chunks
                    .iter()
                    .filter(|c| self.chunk_visible(req.channel, c))
                    .map(|c| PendingItem::from_plain_chunk(c, None))
                    .collect(),
                SectionName::ToolState => session_chunks
                    .iter()
                    .filter(|c| {
                        c.kind == engram_core::EventKind::ToolResult
                            && self.chunk_visible(req.channel, c)
                    })
                    .take(10)
                    .map(|c| PendingItem::from_plain_chunk(c, None))
                    .collect(),
            };
            sections.push(packer.pack_section(name, budget_cfg.max_tokens, items));
        }
        if !deadline_skipped.is_empty() {
            for name in &deadline_skipped {
                packer.omit(OmissionReason::Deadline, name.as_db_str().to_string());
            }
            tracing::warn!(
                tenant_id = %req.tenant_id,
                skipped = deadline_skipped.len(),
                "ACB assembly hit the request deadline"
            );
        }

        let token_used_est: i32 = sections.iter().map(|s| s.token_est).sum();
        debug_assert!(token_used_est <= budget);

        let acb = Acb {
            acb_id: format!("acb_{}", Uuid::now_v7().simple()),
            budget_tokens: max_tokens,
            token_used_est,
            sections,
            omissions: packer.into_omissions(),
            provenance: Provenance {
                policy_version: self.config.policy_version.0.clone(),
                intent: req.intent.as_str().to_string(),
                query_terms,
                candidate_pool_size: pool_size,
                filters: serde_json::json!({
                    "channel": req.channel,
                    "tag_filters": req.tag_filters,
                    "fast_path": fast_path,
                }),
                scoring: ScoringProvenance {
                    alpha: self.config.scoring.alpha,
                    beta: self.config.scoring.beta,
                    gamma: self.config.scoring.gamma,
                    recency_tau_seconds: self.config.scoring.recency_tau_seconds,
                    rrf_k: self.config.scoring.rrf_k,
                    semantic_used,
                },
                store_reads,
                deterministic_seed: "none".to_string(),
            },
        };
        tracing::debug!(
            tenant_id = %req.tenant_id,
            acb_id = %acb.acb_id,
            tokens = acb.token_used_est,
            sections = acb.sections.len(),
            "ACB assembled"
        );
        Ok(acb)
    }

    fn chunk_visible(&self, channel: Channel, chunk: &Chunk) -> bool {
        self.config
            .privacy
            .channels
            .allows(channel, chunk.sensitivity)
            && !(channel.suppresses_preferences()
                && chunk.tags.iter().any(|t| t == "preferences"))
    }

    fn note_visible(&self, channel: Channel, note: &engram_core::KnowledgeNote) -> bool {
        self.config
            .privacy
            .channels
            .allows(channel, note.sensitivity)
            && !(channel.suppresses_preferences()
                && note.tags.iter().any(|t| t == "preferences"))
    }

    /// Identity view: high-confidence principles plus the latest handoff.
    /// Compacted handoff text with no refs is ignored (summary-drift guard)
    /// and recorded as a `missing_refs` omission.
    fn identity_items(
        &self,
        principles: &[engram_core::SemanticPrinciple],
        latest_handoff: Option<&Handoff>,
        packer: &mut Packer,
    ) -> Vec<PendingItem> {
        let mut items = Vec::new();

        let mut sorted: Vec<_> = principles.iter().collect();
        sorted.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.principle_id.cmp(&b.principle_id))
        });
        for principle in sorted.into_iter().take(10) {
            if principle.source_handoff_ids.is_empty() {
                packer.omit(OmissionReason::MissingRefs, principle.principle_id.render());
                continue;
            }
            items.push(PendingItem::from_text(
                "principle",
                format!("{} ({})", principle.principle, principle.context),
                principle
                    .source_handoff_ids
                    .iter()
                    .map(|id| id.render())
                    .collect(),
                Some(principle.confidence as f64),
                principle.principle_id.render(),
            ));
        }

        if let Some(handoff) = latest_handoff {
            match handoff.tier_text() {
                Some(compact) => {
                    if handoff.refs.is_empty() {
                        packer.omit(
                            OmissionReason::MissingRefs,
                            handoff.handoff_id.render(),
                        );
                    } else {
                        items.push(PendingItem::from_text(
                            "handoff",
                            compact.to_string(),
                            handoff.refs.iter().map(|r| r.render()).collect(),
                            None,
                            handoff.handoff_id.render(),
                        ));
                    }
                }
                None => {
                    // Full tier: the continuity fields themselves.
                    let mut text = handoff.remember.clone();
                    if let Some(becoming) = &handoff.becoming {
                        if !becoming.trim().is_empty() {
                            text.push('\n');
                            text.push_str(becoming);
                        }
                    }
                    if !text.trim().is_empty() {
                        items.push(PendingItem::from_text(
                            "handoff",
                            text,
                            vec![handoff.handoff_id.render()],
                            None,
                            handoff.handoff_id.render(),
                        ));
                    }
                }
            }
        }
        items
    }

    /// Score active decisions against the query and emit them best-first.
    fn decision_items(
        &self,
        decisions: &[Decision],
        query_terms: &[String],
        now: Timestamp,
    ) -> Vec<PendingItem> {
        let s = &self.config.scoring;
        let mut scored: Vec<(f64, &Decision)> = decisions
            .iter()
            .map(|d| {
                let text = format!("{} {}", d.decision, d.rationale);
                let terms = engram_core::normalize_terms(&text);
                let lexical = engram_retrieval::lexical_score(&terms, query_terms);
                let recency =
                    engram_retrieval::recency_score(d.created_at, now, s.recency_tau_seconds);
                let score = s.alpha * lexical + s.beta * recency + s.gamma * 0.8;
                (score, d)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.decision_id.cmp(&b.1.decision_id))
        });

        scored
            .into_iter()
            .map(|(score, d)| {
                let mut text = format!("Decision: {}\nRationale: {}", d.decision, d.rationale);
                if !d.constraints.is_empty() {
                    text.push_str("\nConstraints: ");
                    text.push_str(&d.constraints.join("; "));
                }
                let mut refs = vec![d.decision_id.render()];
                refs.extend(d.refs.iter().map(|r| r.render()));
                PendingItem::from_text(
                    "decision",
                    text,
                    refs,
                    Some(score),
                    d.decision_id.render(),
                )
            })
            .collect()
    }

    /// Chunks shared via capsules whose subject matches this request.
    /// Fetches stop at the per-call read budget; unfetched ids come back in
    /// the skipped list.
    async fn capsule_evidence(
        &self,
        store: &dyn Store,
        req: &AcbRequest,
        capsules: &[Capsule],
        query_terms: &[String],
        store_reads: &mut u32,
    ) -> EngramResult<(Vec<(Chunk, String)>, Vec<String>)> {
        let read_cap = self.config.limits.max_file_reads_per_call;
        let mut out = Vec::new();
        let mut skipped = Vec::new();
        for capsule in capsules {
            if !capsule_subject_matches(capsule, &req.intent, query_terms) {
                continue;
            }
            for chunk_id in capsule.items.chunks.iter().take(20) {
                if *store_reads >= read_cap {
                    skipped.push(chunk_id.render());
                    continue;
                }
                *store_reads += 1;
                if let Some(chunk) = store.get_chunk(&req.tenant_id, *chunk_id).await? {
                    if self.chunk_visible(req.channel, &chunk) {
                        out.push((chunk, capsule.capsule_id.render()));
                    }
                }
            }
        }
        Ok((out, skipped))
    }
}

fn required_tokens(items: &[PendingItem], cap: i32) -> i32 {
    let total: i32 = items.iter().map(|i| i.token_est).sum();
    total.min(cap)
}

/// A capsule's subject matches when the intent names it or the query terms
/// mention its subject id.
fn capsule_subject_matches(capsule: &Capsule, intent: &Intent, query_terms: &[String]) -> bool {
    if capsule.subject_type == intent.as_str() || capsule.subject_id == intent.as_str() {
        return true;
    }
    let subject_terms = unique_terms(&capsule.subject_id);
    !subject_terms.is_empty() && subject_terms.iter().any(|t| query_terms.contains(t))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::{DraftContent, OmissionReason, Sensitivity};
    use engram_recorder::{EventDraft, Recorder};
    use engram_storage::{MemoryStore, Store};
    use engram_test_utils::{agent, handoff_fixture, session, tenant};

    fn config() -> Arc<EngramConfig> {
        Arc::new(EngramConfig::default())
    }

    fn builder() -> AcbBuilder {
        AcbBuilder::new(config())
    }

    fn recorder() -> Recorder {
        Recorder::new(config())
    }

    fn draft(content: DraftContent) -> EventDraft {
        EventDraft {
            tenant_id: tenant("t1"),
            session_id: session("s1"),
            agent_id: agent("A"),
            channel: engram_core::Channel::Private,
            actor: engram_core::Actor {
                kind: engram_core::ActorKind::Human,
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

    fn request(query: &str) -> AcbRequest {
        AcbRequest::new(
            tenant("t1"),
            session("s1"),
            agent("A"),
            engram_core::Channel::Private,
            query,
        )
    }

    #[tokio::test]
    async fn test_budget_inequality_always_holds() {
        let store = MemoryStore::new();
        let rec = recorder();
        for i in 0..30 {
            rec.append(&store, message(&format!("note {} about the budget", i)))
                .await
                .unwrap();
        }
        let acb = builder().build(&store, None, &request("budget")).await.unwrap();
        let config = EngramConfig::default();
        assert!(acb.token_used_est <= config.acb.total_max_tokens - config.acb.reserve_tokens);
        for section in &acb.sections {
            let cap = config.acb.sections.get(section.name).max_tokens;
            assert!(section.token_est <= cap);
            let sum: i32 = section.items.iter().map(|i| i.token_est).sum();
            assert_eq!(sum, section.token_est);
        }
    }

    #[tokio::test]
    async fn test_repo_onboarding_scenario() {
        let store = MemoryStore::new();
        let rec = recorder();
        rec.append(&store, message("what is this project for?"))
            .await
            .unwrap();
        rec.append(
            &store,
            draft(DraftContent::ToolCall {
                tool: "read_file".to_string(),
                args: serde_json::json!({"path": "README.md"}),
            }),
        )
        .await
        .unwrap();
        rec.append(
            &store,
            draft(DraftContent::ToolResult {
                tool: "read_file".to_string(),
                path: Some("README.md".to_string()),
                output: "# Demo\nThis project manages shared memory for agents.".to_string(),
            }),
        )
        .await
        .unwrap();
        rec.append(
            &store,
            draft(DraftContent::ToolResult {
                tool: "read_file".to_string(),
                path: Some("package.json".to_string()),
                output: "{\"name\": \"demo\", \"version\": \"1.0.0\"}".to_string(),
            }),
        )
        .await
        .unwrap();

        let mut req = request("what is this project for?");
        req.intent = Intent::new("repo_onboarding");
        let acb = builder().build(&store, None, &req).await.unwrap();

        // Evidence carries the file excerpts, not the query echo.
        let evidence = acb.section(SectionName::RetrievedEvidence).unwrap();
        assert!(evidence
            .items
            .iter()
            .any(|i| i.text.contains("manages shared memory")));
        assert!(evidence.items.iter().any(|i| i.text.contains("version")));
        assert!(evidence
            .items
            .iter()
            .all(|i| i.refs.iter().any(|r| r.starts_with("chk_"))));

        // The user question shows up in the recent window.
        let recent = acb.section(SectionName::RecentWindow).unwrap();
        assert!(recent
            .items
            .iter()
            .any(|i| i.text.contains("what is this project for?")));

        assert!(acb.provenance.candidate_pool_size <= 2000);
        assert!(acb.provenance.query_terms.contains(&"project".to_string()));
        assert!((acb.provenance.scoring.alpha - 0.6).abs() < f64::EPSILON);
        assert!((acb.provenance.scoring.beta - 0.3).abs() < f64::EPSILON);
        assert!((acb.provenance.scoring.gamma - 0.1).abs() < f64::EPSILON);
        assert_eq!(acb.provenance.deterministic_seed, "none");
    }

    #[tokio::test]
    async fn test_determinism_byte_identical_sections() {
        let store = MemoryStore::new();
        let rec = recorder();
        for i in 0..10 {
            rec.append(&store, message(&format!("retrieval note number {}", i)))
                .await
                .unwrap();
        }
        let b = builder();
        let acb1 = b.build(&store, None, &request("retrieval")).await.unwrap();
        let acb2 = b.build(&store, None, &request("retrieval")).await.unwrap();
        let s1 = serde_json::to_string(&acb1.sections).unwrap();
        let s2 = serde_json::to_string(&acb2.sections).unwrap();
        assert_eq!(s1, s2);
    }

    #[tokio::test]
    async fn test_dedupe_collapses_repeated_facts() {
        let store = MemoryStore::new();
        let rec = recorder();
        for i in 0..20 {
            // Same fact, light phrasing changes.
            let text = match i % 3 {
                0 => "our budget is 65K tokens",
                1 => "our budget is 65K tokens overall",
                _ => "the budget is 65K tokens",
            };
            rec.append(&store, message(text)).await.unwrap();
        }

        let acb = builder()
            .build(&store, None, &request("what's the budget?"))
            .await
            .unwrap();

        let fact_items: usize = acb
            .sections
            .iter()
            .flat_map(|s| s.items.iter())
            .filter(|i| i.text.contains("65K"))
            .count();
        assert!(fact_items <= 3, "expected <= 3 items, got {}", fact_items);

        let deduped = acb.omitted(OmissionReason::Dedupe);
        assert!(deduped.len() >= 17, "expected 17+ dedupe omissions, got {}", deduped.len());
    }

    #[tokio::test]
    async fn test_summary_drift_guard() {
        let store = MemoryStore::new();
        // A consolidator-style summary with no refs.
        let mut stale = handoff_fixture("t1", None);
        stale.compression_level = engram_core::CompressionLevel::Summary;
        stale.summary = Some("budget is 32K".to_string());
        stale.refs = vec![];
        store.insert_handoff(&stale).await.unwrap();

        let rec = recorder();
        rec.append(&store, message("our budget is 65K"))
            .await
            .unwrap();

        let acb = builder()
            .build(&store, None, &request("what's our budget?"))
            .await
            .unwrap();

        // The fresh event is present, the unreffed summary is not.
        let all_text: Vec<&str> = acb
            .sections
            .iter()
            .flat_map(|s| s.items.iter())
            .map(|i| i.text.as_str())
            .collect();
        assert!(all_text.iter().any(|t| t.contains("65K")));
        assert!(all_text.iter().all(|t| !t.contains("32K")));

        let missing = acb.omitted(OmissionReason::MissingRefs);
        assert!(missing.contains(&stale.handoff_id.render().as_str()));
    }

    #[tokio::test]
    async fn test_public_channel_suppression() {
        let store = MemoryStore::new();
        let rec = recorder();
        let mut pref = message("the user prefers dark mode and terse answers");
        pref.tags = vec!["preferences".to_string()];
        pref.sensitivity = Some(Sensitivity::High);
        let outcome = rec.append(&store, pref).await.unwrap();
        let pref_chunk = outcome.chunk_ids[0];

        let mut req = request("what are my preferences?");
        req.channel = engram_core::Channel::Public;
        let acb = builder().build(&store, None, &req).await.unwrap();

        for section in &acb.sections {
            for item in &section.items {
                assert!(!item.refs.contains(&pref_chunk.render()));
                assert!(!item.text.contains("dark mode"));
            }
        }
        let suppressed = acb.omitted(OmissionReason::Privacy);
        assert!(suppressed.contains(&pref_chunk.render().as_str()));
    }

    #[tokio::test]
    async fn test_fast_path_skips_retrieval() {
        let store = MemoryStore::new();
        let rec = recorder();
        rec.append(&store, message("continue writing tests"))
            .await
            .unwrap();

        let mut req = request("");
        req.intent = Intent::new("continue");
        let acb = builder().build(&store, None, &req).await.unwrap();

        assert_eq!(acb.provenance.candidate_pool_size, 0);
        assert!(acb.provenance.store_reads <= 12);
        let recent = acb.section(SectionName::RecentWindow).unwrap();
        assert!(recent
            .items
            .iter()
            .any(|i| i.text.contains("continue writing tests")));
        let config = EngramConfig::default();
        assert!(acb.token_used_est <= config.packing_budget());
    }

    #[tokio::test]
    async fn test_budget_impossible() {
        let store = MemoryStore::new();
        let note = engram_core::KnowledgeNote {
            note_id: engram_core::NoteId::generate(),
            tenant_id: tenant("t1"),
            agent_id: agent("A"),
            channel: engram_core::Channel::Private,
            sensitivity: Sensitivity::None,
            text: "rule ".repeat(2000),
            tags: vec!["rules".to_string()],
            with_whom: vec![],
            embedding: None,
            created_at: Utc::now(),
        };
        store.insert_note(&note).await.unwrap();

        let mut req = request("anything");
        req.max_tokens = Some(600);
        req.reserve_tokens = Some(100);
        let err = builder().build(&store, None, &req).await.unwrap_err();
        assert!(matches!(err, EngramError::BudgetImpossible { .. }));
    }

    #[tokio::test]
    async fn test_tool_state_kind_filter() {
        let store = MemoryStore::new();
        let rec = recorder();
        rec.append(&store, message("kick off the build"))
            .await
            .unwrap();
        rec.append(
            &store,
            draft(DraftContent::ToolResult {
                tool: "cargo_build".to_string(),
                path: None,
                output: "warning: unused variable `x`".to_string(),
            }),
        )
        .await
        .unwrap();

        let acb = builder()
            .build(&store, None, &request("unused variable"))
            .await
            .unwrap();
        let tool_state = acb.section(SectionName::ToolState).unwrap();
        for item in &tool_state.items {
            assert_eq!(item.item_type, "chunk");
        }
        // Only tool results feed tool_state; the message went elsewhere.
        assert!(tool_state
            .items
            .iter()
            .all(|i| !i.text.contains("kick off the build")));
    }
}
