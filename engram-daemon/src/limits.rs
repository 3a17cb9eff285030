//! Per-tenant rate limiting
//!
//! One governor limiter per tenant, created on first sight and kept in a
//! DashMap. The limiter map only grows with distinct tenants, which is
//! bounded by the key configuration in practice.

use crate::config::DaemonConfig;
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use std::num::NonZeroU32;
use std::sync::Arc;

type TenantLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-tenant rate limits.
pub struct RateLimits {
    enabled: bool,
    per_minute: NonZeroU32,
    burst: u32,
    limiters: DashMap<String, Arc<TenantLimiter>>,
}

impl RateLimits {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            enabled: config.rate_limit_enabled,
            per_minute: NonZeroU32::new(config.rate_limit_per_minute.max(1))
                .expect("max(1) is non-zero"),
            burst: config.rate_limit_burst,
            limiters: DashMap::new(),
        }
    }

    /// Check (and consume) one request slot for a tenant.
    pub fn check(&self, tenant: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let limiter = self
            .limiters
            .entry(tenant.to_string())
            .or_insert_with(|| {
                let burst = NonZeroU32::new(self.per_minute.get() + self.burst)
                    .expect("positive burst");
                Arc::new(RateLimiter::direct(
                    Quota::per_minute(self.per_minute).allow_burst(burst),
                ))
            })
            .clone();
        limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_trips_after_burst() {
        let config = DaemonConfig {
            rate_limit_per_minute: 1,
            rate_limit_burst: 2,
            ..DaemonConfig::default()
        };
        let limits = RateLimits::new(&config);
        // Quota allows 1/min with burst 3: three immediate slots, then deny.
        assert!(limits.check("t1"));
        assert!(limits.check("t1"));
        assert!(limits.check("t1"));
        assert!(!limits.check("t1"));
        // Other tenants are unaffected.
        assert!(limits.check("t2"));
    }

    #[test]
    fn test_disabled_always_allows() {
        let config = DaemonConfig {
            rate_limit_enabled: false,
            rate_limit_per_minute: 1,
            rate_limit_burst: 0,
            ..DaemonConfig::default()
        };
        let limits = RateLimits::new(&config);
        for _ in 0..100 {
            assert!(limits.check("t1"));
        }
    }
}
