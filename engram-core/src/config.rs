//! Configuration types
//!
//! Loaded once at startup into an immutable struct. Every tunable named in
//! the public contract lives here with its documented default; `validate()`
//! rejects configurations that would make the packer or retrieval caps
//! meaningless.

use crate::{Channel, EngramError, EngramResult, SectionName, Sensitivity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// SECTION BUDGETS
// ============================================================================

/// Token cap and packing priority for one ACB section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionBudget {
    pub max_tokens: i32,
    pub priority: i32,
}

/// Per-section budgets for the ACB packer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionBudgets {
    pub identity: SectionBudget,
    pub rules: SectionBudget,
    pub task_state: SectionBudget,
    pub relevant_decisions: SectionBudget,
    pub retrieved_evidence: SectionBudget,
    pub recent_window: SectionBudget,
    pub tool_state: SectionBudget,
}

impl Default for SectionBudgets {
    fn default() -> Self {
        Self {
            identity: SectionBudget { max_tokens: 1200, priority: 10 },
            rules: SectionBudget { max_tokens: 6000, priority: 9 },
            task_state: SectionBudget { max_tokens: 3000, priority: 9 },
            relevant_decisions: SectionBudget { max_tokens: 8000, priority: 8 },
            retrieved_evidence: SectionBudget { max_tokens: 28000, priority: 7 },
            recent_window: SectionBudget { max_tokens: 12000, priority: 6 },
            tool_state: SectionBudget { max_tokens: 2000, priority: 6 },
        }
    }
}

impl SectionBudgets {
    /// Budget for a named section.
    pub fn get(&self, name: SectionName) -> SectionBudget {
        match name {
            SectionName::Identity => self.identity,
            SectionName::Rules => self.rules,
            SectionName::TaskState => self.task_state,
            SectionName::RelevantDecisions => self.relevant_decisions,
            SectionName::RetrievedEvidence => self.retrieved_evidence,
            SectionName::RecentWindow => self.recent_window,
            SectionName::ToolState => self.tool_state,
        }
    }

    /// All sections in packing order (descending priority, stable by name).
    pub fn ordered(&self) -> Vec<(SectionName, SectionBudget)> {
        let mut sections = vec![
            (SectionName::Identity, self.identity),
            (SectionName::Rules, self.rules),
            (SectionName::TaskState, self.task_state),
            (SectionName::RelevantDecisions, self.relevant_decisions),
            (SectionName::RetrievedEvidence, self.retrieved_evidence),
            (SectionName::RecentWindow, self.recent_window),
            (SectionName::ToolState, self.tool_state),
        ];
        sections.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
        sections
    }
}

// ============================================================================
// COMPONENT SETTINGS
// ============================================================================

/// Bundle-level token caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcbSettings {
    pub total_max_tokens: i32,
    pub reserve_tokens: i32,
    pub sections: SectionBudgets,
}

impl Default for AcbSettings {
    fn default() -> Self {
        Self {
            total_max_tokens: 65_000,
            reserve_tokens: 5_000,
            sections: SectionBudgets::default(),
        }
    }
}

/// Scoring weights and decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub recency_tau_seconds: f64,
    pub rrf_k: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.3,
            gamma: 0.1,
            recency_tau_seconds: 7.0 * 24.0 * 3600.0,
            rrf_k: 60.0,
        }
    }
}

/// Retrieval pool caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub candidate_pool_max: usize,
    pub retrieved_chunks_max: usize,
    pub recency_tail_window: usize,
    pub hotset_recent_events_max: usize,
    pub active_decisions_max: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            candidate_pool_max: 2000,
            retrieved_chunks_max: 200,
            recency_tail_window: 800,
            hotset_recent_events_max: 200,
            active_decisions_max: 100,
        }
    }
}

/// Ingestion caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub max_bytes_per_tool_result_event: usize,
    pub chunk_min_tokens: i32,
    pub chunk_max_tokens: i32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_bytes_per_tool_result_event: 64 * 1024,
            chunk_min_tokens: 80,
            chunk_max_tokens: 800,
        }
    }
}

/// Consolidation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSettings {
    pub summary_threshold_days: i64,
    pub quick_ref_threshold_days: i64,
    pub integration_threshold_days: i64,
    pub decision_archive_threshold_days: i64,
    pub identity_consolidation_min_count: usize,
    /// Jaccard similarity above which two `becoming` statements group.
    pub identity_similarity_threshold: f32,
    pub principle_reinforcement_increment: f32,
    pub principle_decay_factor: f32,
    pub principle_decay_idle_days: i64,
    pub principle_confidence_floor: f32,
    /// Handoffs at or above this significance also emit a decision row.
    pub handoff_decision_significance: f32,
    /// Target sizes for the compact tiers.
    pub summary_target_tokens: i32,
    pub quick_ref_target_tokens: i32,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self {
            summary_threshold_days: 30,
            quick_ref_threshold_days: 90,
            integration_threshold_days: 180,
            decision_archive_threshold_days: 60,
            identity_consolidation_min_count: 10,
            identity_similarity_threshold: 0.5,
            principle_reinforcement_increment: 0.05,
            principle_decay_factor: 0.9,
            principle_decay_idle_days: 30,
            principle_confidence_floor: 0.1,
            handoff_decision_significance: 0.8,
            summary_target_tokens: 500,
            quick_ref_target_tokens: 100,
        }
    }
}

/// Per-channel maximum loadable sensitivity. Secrets are never loadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPolicy {
    pub private: Sensitivity,
    pub public: Sensitivity,
    pub team: Sensitivity,
    pub agent: Sensitivity,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            private: Channel::Private.default_max_sensitivity(),
            public: Channel::Public.default_max_sensitivity(),
            team: Channel::Team.default_max_sensitivity(),
            agent: Channel::Agent.default_max_sensitivity(),
        }
    }
}

impl ChannelPolicy {
    /// Maximum sensitivity loadable under `channel` (never `Secret`).
    pub fn max_for(&self, channel: Channel) -> Sensitivity {
        let configured = match channel {
            Channel::Private => self.private,
            Channel::Public => self.public,
            Channel::Team => self.team,
            Channel::Agent => self.agent,
        };
        configured.min(Sensitivity::High)
    }

    /// Whether a record of `sensitivity` may be loaded under `channel`.
    pub fn allows(&self, channel: Channel, sensitivity: Sensitivity) -> bool {
        sensitivity != Sensitivity::Secret && sensitivity <= self.max_for(channel)
    }
}

/// What the Recorder does with content matching secret patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretPolicy {
    /// Replace matching spans with a redaction marker and store the rest.
    Redact,
    /// Reject the whole event with `policy_rejected`.
    Reject,
}

/// Privacy policy: storage refusal and redaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    /// Sensitivities refused at ingestion.
    pub never_store_kinds: Vec<Sensitivity>,
    /// Applied when content matches a secret pattern.
    pub secret_policy: SecretPolicy,
    /// Additional redaction regexes, applied after the built-in set.
    pub redact_patterns: Vec<String>,
    pub channels: ChannelPolicy,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            never_store_kinds: vec![Sensitivity::Secret],
            secret_policy: SecretPolicy::Redact,
            redact_patterns: Vec::new(),
            channels: ChannelPolicy::default(),
        }
    }
}

/// Per-request work bounds enforced by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_file_reads_per_call: u32,
    pub max_bytes_read_per_call: u64,
    pub deadline_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_file_reads_per_call: 20,
            max_bytes_read_per_call: 8 * 1024 * 1024,
            deadline_ms: 1500,
        }
    }
}

/// Near-duplicate collapse thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    /// SimHash Hamming distance at or below which two chunks collapse.
    pub simhash_hamming_max: u32,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            simhash_hamming_max: 3,
        }
    }
}

/// Durability: WAL location and the optional embedding service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilitySettings {
    pub wal_path: String,
    /// Embedding-service endpoint; absent means lexical-only retrieval.
    pub embedding_endpoint: Option<String>,
    pub embedding_dimensions: usize,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            wal_path: "engram.wal".to_string(),
            embedding_endpoint: None,
            embedding_dimensions: 1024,
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct, immutable after startup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngramConfig {
    pub policy_version: PolicyVersion,
    pub acb: AcbSettings,
    pub scoring: ScoringSettings,
    pub retrieval: RetrievalSettings,
    pub ingest: IngestSettings,
    pub consolidation: ConsolidationSettings,
    pub privacy: PrivacySettings,
    pub limits: LimitSettings,
    pub dedupe: DedupeSettings,
    pub durability: DurabilitySettings,
}

/// Version stamp reported in ACB provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyVersion(pub String);

impl Default for PolicyVersion {
    fn default() -> Self {
        Self("v1".to_string())
    }
}

impl EngramConfig {
    /// Load configuration from a TOML file; absent keys keep their defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - token caps are positive and reserve leaves usable budget
    /// - scoring weights are non-negative with a positive tau
    /// - retrieval caps are positive and internally consistent
    /// - chunk window bounds are ordered
    /// - consolidation thresholds are ordered and factors within (0, 1]
    pub fn validate(&self) -> EngramResult<()> {
        let acb = &self.acb;
        if acb.total_max_tokens <= 0 {
            return Err(EngramError::invalid_value(
                "acb.total_max_tokens",
                "must be greater than 0",
            ));
        }
        if acb.reserve_tokens < 0 || acb.reserve_tokens >= acb.total_max_tokens {
            return Err(EngramError::invalid_value(
                "acb.reserve_tokens",
                "must be in [0, total_max_tokens)",
            ));
        }
        for (name, budget) in acb.sections.ordered() {
            if budget.max_tokens < 0 {
                return Err(EngramError::invalid_value(
                    format!("acb.sections.{}", name.as_db_str()),
                    "max_tokens must be non-negative",
                ));
            }
        }

        let s = &self.scoring;
        if s.alpha < 0.0 || s.beta < 0.0 || s.gamma < 0.0 {
            return Err(EngramError::invalid_value(
                "scoring",
                "weights must be non-negative",
            ));
        }
        if s.recency_tau_seconds <= 0.0 {
            return Err(EngramError::invalid_value(
                "scoring.recency_tau_seconds",
                "must be positive",
            ));
        }
        if s.rrf_k <= 0.0 {
            return Err(EngramError::invalid_value(
                "scoring.rrf_k",
                "must be positive",
            ));
        }

        let r = &self.retrieval;
        if r.candidate_pool_max == 0 || r.retrieved_chunks_max == 0 {
            return Err(EngramError::invalid_value(
                "retrieval",
                "pool caps must be positive",
            ));
        }
        if r.retrieved_chunks_max > r.candidate_pool_max {
            return Err(EngramError::invalid_value(
                "retrieval.retrieved_chunks_max",
                "must not exceed candidate_pool_max",
            ));
        }

        let i = &self.ingest;
        if i.chunk_min_tokens <= 0 || i.chunk_max_tokens < i.chunk_min_tokens {
            return Err(EngramError::invalid_value(
                "ingest",
                "chunk token window must satisfy 0 < min <= max",
            ));
        }
        if i.max_bytes_per_tool_result_event == 0 {
            return Err(EngramError::invalid_value(
                "ingest.max_bytes_per_tool_result_event",
                "must be positive",
            ));
        }

        let c = &self.consolidation;
        if !(c.summary_threshold_days < c.quick_ref_threshold_days
            && c.quick_ref_threshold_days < c.integration_threshold_days)
        {
            return Err(EngramError::invalid_value(
                "consolidation",
                "tier thresholds must be strictly increasing",
            ));
        }
        if c.principle_decay_factor <= 0.0 || c.principle_decay_factor > 1.0 {
            return Err(EngramError::invalid_value(
                "consolidation.principle_decay_factor",
                "must be in (0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&c.principle_confidence_floor) {
            return Err(EngramError::invalid_value(
                "consolidation.principle_confidence_floor",
                "must be in [0, 1]",
            ));
        }
        if c.identity_consolidation_min_count == 0 {
            return Err(EngramError::invalid_value(
                "consolidation.identity_consolidation_min_count",
                "must be positive",
            ));
        }

        if self.limits.deadline_ms == 0 || self.limits.max_file_reads_per_call == 0 {
            return Err(EngramError::invalid_value(
                "limits",
                "deadline and read caps must be positive",
            ));
        }

        Ok(())
    }

    /// Usable packing budget: `total_max_tokens - reserve_tokens`.
    pub fn packing_budget(&self) -> i32 {
        self.acb.total_max_tokens - self.acb.reserve_tokens
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngramConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.packing_budget(), 60_000);
    }

    #[test]
    fn test_default_section_budgets() {
        let sections = SectionBudgets::default();
        assert_eq!(sections.get(SectionName::Identity).max_tokens, 1200);
        assert_eq!(sections.get(SectionName::RetrievedEvidence).max_tokens, 28_000);
        // Ordered by descending priority; identity first.
        let ordered = sections.ordered();
        assert_eq!(ordered.first().unwrap().0, SectionName::Identity);
        for pair in ordered.windows(2) {
            assert!(pair[0].1.priority >= pair[1].1.priority);
        }
    }

    #[test]
    fn test_validate_rejects_inverted_reserve() {
        let config = EngramConfig {
            acb: AcbSettings {
                total_max_tokens: 1000,
                reserve_tokens: 1000,
                ..AcbSettings::default()
            },
            ..EngramConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_chunk_window() {
        let config = EngramConfig {
            ingest: IngestSettings {
                chunk_min_tokens: 800,
                chunk_max_tokens: 80,
                ..IngestSettings::default()
            },
            ..EngramConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unordered_tiers() {
        let config = EngramConfig {
            consolidation: ConsolidationSettings {
                summary_threshold_days: 90,
                quick_ref_threshold_days: 30,
                ..ConsolidationSettings::default()
            },
            ..EngramConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_policy_never_loads_secrets() {
        let policy = ChannelPolicy {
            private: Sensitivity::Secret, // deliberately misconfigured
            ..ChannelPolicy::default()
        };
        assert!(!policy.allows(Channel::Private, Sensitivity::Secret));
        assert!(policy.allows(Channel::Private, Sensitivity::High));
        assert!(!policy.allows(Channel::Public, Sensitivity::High));
        assert!(policy.allows(Channel::Public, Sensitivity::Low));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngramConfig = toml::from_str(
            r#"
            [acb]
            total_max_tokens = 32000

            [scoring]
            alpha = 0.7
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(config.acb.total_max_tokens, 32_000);
        assert_eq!(config.acb.reserve_tokens, 5_000);
        assert!((config.scoring.alpha - 0.7).abs() < f64::EPSILON);
        assert!((config.scoring.beta - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.retrieval.candidate_pool_max, 2000);
    }
}
