//! Error types for Engram operations

use crate::{Channel, Sensitivity};
use thiserror::Error;

/// Validation errors raised at the write path and the daemon boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// Policy errors: content or access forbidden by configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    #[error("Secret content rejected by store policy (pattern: {pattern})")]
    SecretRejected { pattern: String },

    #[error("Sensitivity {sensitivity} is not loadable under channel {channel}")]
    ChannelForbidden {
        channel: Channel,
        sensitivity: Sensitivity,
    },

    #[error("Agent {agent_id} is not in the capsule audience")]
    NotInAudience { agent_id: String },
}

/// Store-layer errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Insert failed for {table}: {reason}")]
    InsertFailed { table: &'static str, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Master error type for all Engram operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngramError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Tenant mismatch: request tenant {request} does not own {resource}")]
    TenantMismatch { request: String, resource: String },

    #[error("Policy rejected: {0}")]
    Policy(#[from] PolicyError),

    #[error("Oversize payload: {bytes} bytes exceeds limit {max_bytes}")]
    OversizePayload { bytes: usize, max_bytes: usize },

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Budget impossible: required sections need {required} tokens, cap is {max_tokens}")]
    BudgetImpossible { required: i64, max_tokens: i64 },

    #[error("Deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {reason}")]
    Fatal { reason: String },
}

/// Wire-level error kind, stable across transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationError,
    TenantMismatch,
    PolicyRejected,
    OversizePayload,
    NotFound,
    Forbidden,
    BudgetImpossible,
    DeadlineExceeded,
    StoreUnavailable,
    FatalInternal,
}

impl ErrorKind {
    /// Stable snake_case rendering used in JSON-RPC error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::TenantMismatch => "tenant_mismatch",
            ErrorKind::PolicyRejected => "policy_rejected",
            ErrorKind::OversizePayload => "oversize_payload",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::BudgetImpossible => "budget_impossible",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::FatalInternal => "fatal_internal",
        }
    }
}

impl EngramError {
    /// Map this error onto the wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngramError::Validation(_) => ErrorKind::ValidationError,
            EngramError::TenantMismatch { .. } => ErrorKind::TenantMismatch,
            EngramError::Policy(_) => ErrorKind::PolicyRejected,
            EngramError::OversizePayload { .. } => ErrorKind::OversizePayload,
            EngramError::NotFound { .. } => ErrorKind::NotFound,
            EngramError::Forbidden { .. } => ErrorKind::Forbidden,
            EngramError::BudgetImpossible { .. } => ErrorKind::BudgetImpossible,
            EngramError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            EngramError::Store(StoreError::Unavailable { .. }) => ErrorKind::StoreUnavailable,
            EngramError::Store(_) => ErrorKind::FatalInternal,
            EngramError::Fatal { .. } => ErrorKind::FatalInternal,
        }
    }

    /// Shorthand for a missing-field validation error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        EngramError::Validation(ValidationError::RequiredFieldMissing {
            field: field.into(),
        })
    }

    /// Shorthand for an invalid-value validation error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngramError::Validation(ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// Shorthand for a store-unavailable error.
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        EngramError::Store(StoreError::Unavailable {
            reason: reason.into(),
        })
    }

    /// Whether the daemon may fall back to the WAL for this error.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, EngramError::Store(StoreError::Unavailable { .. }))
    }
}

/// Result type alias for Engram operations.
pub type EngramResult<T> = Result<T, EngramError>;
