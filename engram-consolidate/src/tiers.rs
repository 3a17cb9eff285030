//! Handoff tiered compression
//!
//! Handoffs age through `full -> summary -> quick_ref -> integrated`.
//! Transitions compute compact text from the structured fields; the source
//! refs always survive, so compression stays lossless-by-reference. The full
//! fields are removed only at the `integrated` transition.

use chrono::{Duration, Utc};
use engram_core::{
    CompressionLevel, ConsolidationSettings, EngramResult, Handoff, MemoryIdType,
    SummarizationProvider, TenantId, Timestamp, estimate_tokens, truncate_to_token_budget,
};
use engram_storage::{HandoffCompressionUpdate, Store};

/// Outcome of one handoff-compression sweep.
#[derive(Debug, Default)]
pub struct TierSweep {
    pub processed: i64,
    pub affected: i64,
    pub tokens_saved: i64,
    pub failures: Vec<String>,
}

/// Text tokens held by the full structured fields.
fn full_tokens(handoff: &Handoff) -> i64 {
    [
        handoff.experienced.as_str(),
        handoff.noticed.as_str(),
        handoff.learned.as_str(),
        handoff.story.as_str(),
    ]
    .iter()
    .map(|t| estimate_tokens(t) as i64)
    .sum()
}

/// Compose the summary-tier text from the full fields.
async fn compose_summary(
    handoff: &Handoff,
    target_tokens: i32,
    summarizer: Option<&dyn SummarizationProvider>,
) -> EngramResult<String> {
    let full = format!(
        "Experienced: {}\nNoticed: {}\nLearned: {}\nRemember: {}",
        handoff.experienced, handoff.noticed, handoff.learned, handoff.remember
    );
    match summarizer {
        Some(provider) => provider.summarize(&full, target_tokens).await,
        None => Ok(truncate_to_token_budget(&full, target_tokens)),
    }
}

/// Compose the quick-ref-tier text from the summary (or full fields).
async fn compose_quick_ref(
    handoff: &Handoff,
    target_tokens: i32,
    summarizer: Option<&dyn SummarizationProvider>,
) -> EngramResult<String> {
    let base = match &handoff.summary {
        Some(summary) => summary.clone(),
        None => format!("{}; {}", handoff.learned, handoff.remember),
    };
    match summarizer {
        Some(provider) => provider.summarize(&base, target_tokens).await,
        None => Ok(truncate_to_token_budget(&base, target_tokens)),
    }
}

/// Run one tier transition over every eligible handoff.
async fn run_transition(
    store: &dyn Store,
    tenant: &TenantId,
    from: CompressionLevel,
    cutoff: Timestamp,
    settings: &ConsolidationSettings,
    summarizer: Option<&dyn SummarizationProvider>,
    sweep: &mut TierSweep,
) -> EngramResult<()> {
    let eligible = store.list_handoffs_at_level(tenant, from, cutoff).await?;
    for handoff in eligible {
        sweep.processed += 1;
        let update = match from {
            CompressionLevel::Full => {
                let summary = compose_summary(
                    &handoff,
                    settings.summary_target_tokens,
                    summarizer,
                )
                .await?;
                sweep.tokens_saved +=
                    (full_tokens(&handoff) - estimate_tokens(&summary) as i64).max(0);
                HandoffCompressionUpdate {
                    compression_level: Some(CompressionLevel::Summary),
                    summary: Some(summary),
                    quick_ref: None,
                    consolidated_at: Some(Utc::now()),
                    clear_full_fields: false,
                }
            }
            CompressionLevel::Summary => {
                let quick_ref = compose_quick_ref(
                    &handoff,
                    settings.quick_ref_target_tokens,
                    summarizer,
                )
                .await?;
                let summary_tokens = handoff
                    .summary
                    .as_deref()
                    .map(|s| estimate_tokens(s) as i64)
                    .unwrap_or(0);
                sweep.tokens_saved +=
                    (summary_tokens - estimate_tokens(&quick_ref) as i64).max(0);
                HandoffCompressionUpdate {
                    compression_level: Some(CompressionLevel::QuickRef),
                    summary: None,
                    quick_ref: Some(quick_ref),
                    consolidated_at: Some(Utc::now()),
                    clear_full_fields: false,
                }
            }
            CompressionLevel::QuickRef => {
                // Integration: the quick-ref and refs remain; the full text
                // is dropped now that principles have absorbed it.
                sweep.tokens_saved += full_tokens(&handoff);
                HandoffCompressionUpdate {
                    compression_level: Some(CompressionLevel::Integrated),
                    summary: None,
                    quick_ref: None,
                    consolidated_at: Some(Utc::now()),
                    clear_full_fields: true,
                }
            }
            CompressionLevel::Integrated => continue,
        };

        match store
            .update_handoff_compression(tenant, handoff.handoff_id, &update)
            .await
        {
            Ok(()) => sweep.affected += 1,
            Err(e) => {
                tracing::warn!(
                    handoff_id = %handoff.handoff_id,
                    error = %e,
                    "Handoff tier transition failed"
                );
                sweep.failures.push(handoff.handoff_id.render());
            }
        }
    }
    Ok(())
}

/// Sweep every tier in age order (oldest transitions first so a very old
/// handoff can move more than one tier across consecutive runs).
pub async fn compress_handoffs(
    store: &dyn Store,
    tenant: &TenantId,
    settings: &ConsolidationSettings,
    summarizer: Option<&dyn SummarizationProvider>,
    now: Timestamp,
) -> EngramResult<TierSweep> {
    let mut sweep = TierSweep::default();

    let transitions = [
        (
            CompressionLevel::QuickRef,
            now - Duration::days(settings.integration_threshold_days),
        ),
        (
            CompressionLevel::Summary,
            now - Duration::days(settings.quick_ref_threshold_days),
        ),
        (
            CompressionLevel::Full,
            now - Duration::days(settings.summary_threshold_days),
        ),
    ];
    for (from, cutoff) in transitions {
        run_transition(store, tenant, from, cutoff, settings, summarizer, &mut sweep)
            .await?;
    }
    Ok(sweep)
}
