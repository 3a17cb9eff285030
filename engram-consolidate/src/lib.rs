//! Engram Consolidate - compression without losing traceability
//!
//! Scheduled (and on-demand) jobs: handoff tier compression, decision
//! archival, identity principle extraction. Every job writes a report row;
//! item-level failures leave the job `partial` rather than rolling it back.

mod principles;
mod tiers;

pub use principles::{IdentitySweep, decayed_confidence, extract_identity};
pub use tiers::{TierSweep, compress_handoffs};

use chrono::{Duration, Utc};
use engram_core::{
    ConsolidationReport, DecisionStatus, EngramConfig, EngramResult, JobType, MemoryIdType,
    SummarizationProvider, TenantId, Timestamp,
};
use engram_storage::Store;
use std::sync::Arc;

/// Runs consolidation jobs for one tenant at a time.
#[derive(Clone)]
pub struct Consolidator {
    config: Arc<EngramConfig>,
}

impl Consolidator {
    pub fn new(config: Arc<EngramConfig>) -> Self {
        Self { config }
    }

    /// Run the selected job(s); returns one report per job executed.
    /// Reports are persisted before returning.
    pub async fn consolidate(
        &self,
        store: &dyn Store,
        tenant: &TenantId,
        job_type: JobType,
        summarizer: Option<&dyn SummarizationProvider>,
    ) -> EngramResult<Vec<ConsolidationReport>> {
        let now = Utc::now();
        let mut reports = Vec::new();

        if matches!(job_type, JobType::Handoffs | JobType::All) {
            reports.push(self.run_handoffs(store, tenant, summarizer, now).await);
        }
        if matches!(job_type, JobType::Decisions | JobType::All) {
            reports.push(self.run_decisions(store, tenant, now).await);
        }
        if matches!(job_type, JobType::Identity | JobType::All) {
            reports.push(self.run_identity(store, tenant, now).await);
        }

        for report in &reports {
            store.insert_report(report).await?;
            tracing::info!(
                tenant_id = %tenant,
                job = %report.job_type,
                processed = report.items_processed,
                affected = report.items_affected,
                tokens_saved = report.tokens_saved,
                error = report.error.as_deref().unwrap_or(""),
                "Consolidation job finished"
            );
        }
        Ok(reports)
    }

    async fn run_handoffs(
        &self,
        store: &dyn Store,
        tenant: &TenantId,
        summarizer: Option<&dyn SummarizationProvider>,
        now: Timestamp,
    ) -> ConsolidationReport {
        match compress_handoffs(store, tenant, &self.config.consolidation, summarizer, now)
            .await
        {
            Ok(sweep) => ConsolidationReport {
                tenant_id: tenant.clone(),
                job_type: JobType::Handoffs,
                items_processed: sweep.processed,
                items_affected: sweep.affected,
                tokens_saved: sweep.tokens_saved,
                details: "handoff tier compression".to_string(),
                error: partial_error(&sweep.failures),
                created_at: now,
            },
            Err(e) => failed_report(tenant, JobType::Handoffs, e.to_string(), now),
        }
    }

    async fn run_decisions(
        &self,
        store: &dyn Store,
        tenant: &TenantId,
        now: Timestamp,
    ) -> ConsolidationReport {
        let cutoff =
            now - Duration::days(self.config.consolidation.decision_archive_threshold_days);
        let eligible = match store.list_decisions_for_archive(tenant, cutoff).await {
            Ok(rows) => rows,
            Err(e) => return failed_report(tenant, JobType::Decisions, e.to_string(), now),
        };

        let mut affected = 0i64;
        let mut failures = Vec::new();
        let processed = eligible.len() as i64;
        for decision in eligible {
            match store
                .set_decision_status(
                    tenant,
                    decision.decision_id,
                    DecisionStatus::Superseded,
                    Some(now),
                )
                .await
            {
                Ok(()) => affected += 1,
                Err(e) => {
                    tracing::warn!(
                        decision_id = %decision.decision_id,
                        error = %e,
                        "Decision archival failed"
                    );
                    failures.push(decision.decision_id.render());
                }
            }
        }

        ConsolidationReport {
            tenant_id: tenant.clone(),
            job_type: JobType::Decisions,
            items_processed: processed,
            items_affected: affected,
            tokens_saved: 0,
            details: "archived stale active decisions".to_string(),
            error: partial_error(&failures),
            created_at: now,
        }
    }

    async fn run_identity(
        &self,
        store: &dyn Store,
        tenant: &TenantId,
        now: Timestamp,
    ) -> ConsolidationReport {
        match extract_identity(store, tenant, &self.config.consolidation, now).await {
            Ok(sweep) => ConsolidationReport {
                tenant_id: tenant.clone(),
                job_type: JobType::Identity,
                items_processed: sweep.processed,
                items_affected: sweep.affected,
                tokens_saved: 0,
                details: "identity principle extraction".to_string(),
                error: partial_error(&sweep.failures),
                created_at: now,
            },
            Err(e) => failed_report(tenant, JobType::Identity, e.to_string(), now),
        }
    }
}

fn partial_error(failures: &[String]) -> Option<String> {
    if failures.is_empty() {
        None
    } else {
        Some(format!("partial: {} items failed: {}", failures.len(), failures.join(", ")))
    }
}

fn failed_report(
    tenant: &TenantId,
    job_type: JobType,
    error: String,
    now: Timestamp,
) -> ConsolidationReport {
    ConsolidationReport {
        tenant_id: tenant.clone(),
        job_type,
        items_processed: 0,
        items_affected: 0,
        tokens_saved: 0,
        details: "job aborted".to_string(),
        error: Some(error),
        created_at: now,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::{Channel, Decision, DecisionId, DecisionScope, MemoryRef};
    use engram_storage::{MemoryStore, Store};
    use engram_test_utils::{agent, handoff_fixture, session, tenant};

    fn consolidator() -> Consolidator {
        Consolidator::new(Arc::new(EngramConfig::default()))
    }

    fn decision(tenant_id: &str, age_days: i64, pinned: bool) -> Decision {
        Decision {
            decision_id: DecisionId::generate(),
            tenant_id: tenant(tenant_id),
            session_id: session("s1"),
            agent_id: agent("A"),
            channel: Channel::Private,
            status: DecisionStatus::Active,
            scope: DecisionScope::Project,
            decision: "use a bounded candidate pool".to_string(),
            rationale: "latency".to_string(),
            constraints: vec![],
            alternatives: vec![],
            consequences: vec![],
            refs: vec![MemoryRef::Decision(DecisionId::generate())],
            pinned,
            created_at: Utc::now() - Duration::days(age_days),
            superseded_at: None,
        }
    }

    async fn insert_decision(store: &MemoryStore, d: &Decision) {
        // Decisions normally arrive via event bundles; for consolidation
        // tests the row alone is enough.
        store
            .insert_event_bundle(&engram_storage::EventBundle {
                event: engram_test_utils::event_fixture("t1", "s1", "seed"),
                chunks: vec![],
                decision: Some(d.clone()),
                supersedes: None,
                task: None,
                artifact: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_decision_archival_respects_pinning() {
        let store = MemoryStore::new();
        let stale = decision("t1", 90, false);
        let pinned = decision("t1", 90, true);
        let fresh = decision("t1", 10, false);
        insert_decision(&store, &stale).await;
        insert_decision(&store, &pinned).await;
        insert_decision(&store, &fresh).await;

        let t = tenant("t1");
        let reports = consolidator()
            .consolidate(&store, &t, JobType::Decisions, None)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].items_affected, 1);
        assert!(reports[0].error.is_none());

        let active = store.list_active_decisions(&t, 100).await.unwrap();
        let active_ids: Vec<DecisionId> =
            active.iter().map(|d| d.decision_id).collect();
        assert!(active_ids.contains(&pinned.decision_id));
        assert!(active_ids.contains(&fresh.decision_id));
        assert!(!active_ids.contains(&stale.decision_id));
    }

    #[tokio::test]
    async fn test_all_runs_every_job_and_persists_reports() {
        let store = MemoryStore::new();
        let t = tenant("t1");
        let mut old = handoff_fixture("t1", Some("becoming thorough"));
        old.created_at = Utc::now() - Duration::days(45);
        // A long narrative makes the summary tier an actual compression.
        old.story = "a winding account of the whole session ".repeat(150);
        store.insert_handoff(&old).await.unwrap();

        let reports = consolidator()
            .consolidate(&store, &t, JobType::All, None)
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        let stored = store.list_reports(&t, 10).await.unwrap();
        assert_eq!(stored.len(), 3);

        let handoff_report = reports
            .iter()
            .find(|r| r.job_type == JobType::Handoffs)
            .unwrap();
        assert_eq!(handoff_report.items_affected, 1);
        assert!(handoff_report.tokens_saved > 0);
    }

    #[tokio::test]
    async fn test_store_outage_is_fatal_report() {
        let store = MemoryStore::new();
        let t = tenant("t1");
        store.set_available(false);
        // Listing fails, so the job aborts; persisting the report also fails
        // and surfaces as an error to the scheduler.
        let result = consolidator()
            .consolidate(&store, &t, JobType::Handoffs, None)
            .await;
        assert!(result.is_err());
    }
}
