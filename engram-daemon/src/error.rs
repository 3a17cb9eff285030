//! JSON-RPC error mapping
//!
//! The domain taxonomy (`engram_core::ErrorKind`) maps onto JSON-RPC error
//! objects with stable codes. Transport-level failures (parse, unknown
//! method, auth) use the reserved -32xxx range; domain errors live in the
//! -320xx application range with the kind string in `data.kind`.

use engram_core::{EngramError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.data = Some(serde_json::json!({ "kind": kind }));
        self
    }

    /// -32700: body is not valid JSON.
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(-32700, format!("Parse error: {}", detail.into()))
    }

    /// -32600: envelope is not a valid JSON-RPC 2.0 request.
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(-32600, format!("Invalid request: {}", detail.into()))
    }

    /// -32601: unknown method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {}", method))
    }

    /// -32602: params failed to deserialize.
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(-32602, format!("Invalid params: {}", detail.into()))
            .with_kind(ErrorKind::ValidationError.as_str())
    }

    /// -32001: missing or invalid bearer token.
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(-32001, detail.into())
    }

    /// -32002: per-tenant rate limit tripped.
    pub fn rate_limited() -> Self {
        Self::new(-32002, "Rate limit exceeded")
            .with_kind(ErrorKind::Forbidden.as_str())
    }

    /// The stable application code for a domain error kind.
    fn code_for(kind: ErrorKind) -> i64 {
        match kind {
            ErrorKind::ValidationError => -32010,
            ErrorKind::TenantMismatch => -32011,
            ErrorKind::PolicyRejected => -32012,
            ErrorKind::OversizePayload => -32013,
            ErrorKind::NotFound => -32014,
            ErrorKind::Forbidden => -32015,
            ErrorKind::BudgetImpossible => -32016,
            ErrorKind::DeadlineExceeded => -32017,
            ErrorKind::StoreUnavailable => -32018,
            ErrorKind::FatalInternal => -32019,
        }
    }
}

impl From<&EngramError> for RpcError {
    fn from(err: &EngramError) -> Self {
        let kind = err.kind();
        // Internal detail stays in the log, not on the wire.
        let message = match kind {
            ErrorKind::FatalInternal => "Internal error".to_string(),
            _ => err.to_string(),
        };
        Self::new(Self::code_for(kind), message).with_kind(kind.as_str())
    }
}

impl From<EngramError> for RpcError {
    fn from(err: EngramError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::{PolicyError, StoreError};

    #[test]
    fn test_domain_error_mapping() {
        let err = EngramError::missing_field("tenant_id");
        let rpc = RpcError::from(&err);
        assert_eq!(rpc.code, -32010);
        assert_eq!(rpc.data.unwrap()["kind"], "validation_error");

        let err = EngramError::Policy(PolicyError::SecretRejected {
            pattern: "api_key".to_string(),
        });
        let rpc = RpcError::from(&err);
        assert_eq!(rpc.code, -32012);
        assert_eq!(rpc.data.unwrap()["kind"], "policy_rejected");
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = EngramError::Store(StoreError::TransactionFailed {
            reason: "constraint chunks_token_est_check violated".to_string(),
        });
        let rpc = RpcError::from(&err);
        assert_eq!(rpc.message, "Internal error");
        assert_eq!(rpc.data.unwrap()["kind"], "fatal_internal");
    }

    #[test]
    fn test_store_unavailable_keeps_kind() {
        let rpc = RpcError::from(EngramError::store_unavailable("pool: timeout"));
        assert_eq!(rpc.code, -32018);
        assert_eq!(rpc.data.unwrap()["kind"], "store_unavailable");
    }
}
