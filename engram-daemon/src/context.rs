//! Per-request context
//!
//! Every RPC call binds to a context carrying the isolation keys, a request
//! id, and the deadline. The context also cross-checks the key's tenant
//! binding, which is the first line of the tenant-mismatch defence.

use crate::auth::AuthContext;
use engram_core::{AgentId, Channel, EngramError, EngramResult, SessionId, TenantId};
use serde::Deserialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The isolation keys every request must carry in `params`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeParams {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
}

/// Bound request context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub request_id: String,
    pub started: Instant,
    pub deadline: Instant,
}

impl RequestContext {
    /// Bind a context from validated scope params, enforcing the key's
    /// tenant binding.
    pub fn bind(
        scope: ScopeParams,
        auth: &AuthContext,
        deadline_ms: u64,
    ) -> EngramResult<Self> {
        if let Some(bound) = &auth.tenant_binding {
            if bound != &scope.tenant_id {
                return Err(EngramError::TenantMismatch {
                    request: scope.tenant_id.to_string(),
                    resource: format!("key bound to tenant {}", bound),
                });
            }
        }
        let started = Instant::now();
        Ok(Self {
            tenant_id: scope.tenant_id,
            session_id: scope.session_id,
            agent_id: scope.agent_id,
            channel: scope.channel,
            request_id: format!("req_{}", Uuid::now_v7().simple()),
            started,
            deadline: started + Duration::from_millis(deadline_ms),
        })
    }

    /// Remaining time before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Milliseconds elapsed since the request started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ScopeParams {
        ScopeParams {
            tenant_id: TenantId::new("t1").unwrap(),
            session_id: SessionId::new("s1").unwrap(),
            agent_id: AgentId::new("A").unwrap(),
            channel: Channel::Private,
        }
    }

    #[test]
    fn test_bind_respects_tenant_binding() {
        let auth = AuthContext {
            tenant_binding: Some(TenantId::new("other").unwrap()),
            key_id: "abcd1234".to_string(),
        };
        let err = RequestContext::bind(scope(), &auth, 1500).unwrap_err();
        assert_eq!(err.kind(), engram_core::ErrorKind::TenantMismatch);

        let auth = AuthContext {
            tenant_binding: Some(TenantId::new("t1").unwrap()),
            key_id: "abcd1234".to_string(),
        };
        assert!(RequestContext::bind(scope(), &auth, 1500).is_ok());
    }

    #[test]
    fn test_request_id_shape() {
        let auth = AuthContext {
            tenant_binding: None,
            key_id: "dev".to_string(),
        };
        let ctx = RequestContext::bind(scope(), &auth, 1500).unwrap();
        assert!(ctx.request_id.starts_with("req_"));
        assert!(ctx.remaining() <= Duration::from_millis(1500));
    }
}
