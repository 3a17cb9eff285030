//! Daemon configuration
//!
//! Transport, auth and scheduling knobs come from environment variables with
//! development defaults; the memory-pipeline configuration (budgets, caps,
//! thresholds) comes from the TOML file loaded in `main`.

use std::time::Duration;

/// Daemon-level configuration (transport, scheduling, rate limits).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Bind host.
    pub bind: String,
    /// Bind port.
    pub port: u16,
    /// Whether per-tenant rate limiting is enabled.
    pub rate_limit_enabled: bool,
    /// Requests per minute per tenant.
    pub rate_limit_per_minute: u32,
    /// Burst capacity beyond the steady rate.
    pub rate_limit_burst: u32,
    /// How often the WAL replayer probes a previously unreachable store.
    pub wal_replay_interval: Duration,
    /// Interval of the light consolidation sweep.
    pub consolidation_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            rate_limit_enabled: true,
            rate_limit_per_minute: 600,
            rate_limit_burst: 20,
            wal_replay_interval: Duration::from_secs(5),
            consolidation_interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl DaemonConfig {
    /// Create from environment variables.
    ///
    /// - `ENGRAM_BIND`: bind host (default `0.0.0.0`)
    /// - `ENGRAM_PORT` / `PORT`: bind port (default 3000)
    /// - `ENGRAM_RATE_LIMIT_ENABLED`: `true`/`false` (default true)
    /// - `ENGRAM_RATE_LIMIT_PER_MINUTE`: per tenant (default 600)
    /// - `ENGRAM_RATE_LIMIT_BURST`: burst capacity (default 20)
    /// - `ENGRAM_WAL_REPLAY_INTERVAL_SECS`: probe interval (default 5)
    /// - `ENGRAM_CONSOLIDATION_INTERVAL_SECS`: sweep interval (default 86400)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: std::env::var("ENGRAM_BIND").unwrap_or(defaults.bind),
            port: std::env::var("ENGRAM_PORT")
                .ok()
                .or_else(|| std::env::var("PORT").ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            rate_limit_enabled: std::env::var("ENGRAM_RATE_LIMIT_ENABLED")
                .map(|v| v != "false")
                .unwrap_or(defaults.rate_limit_enabled),
            rate_limit_per_minute: std::env::var("ENGRAM_RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_per_minute),
            rate_limit_burst: std::env::var("ENGRAM_RATE_LIMIT_BURST")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_burst),
            wal_replay_interval: Duration::from_secs(
                std::env::var("ENGRAM_WAL_REPLAY_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            consolidation_interval: Duration::from_secs(
                std::env::var("ENGRAM_CONSOLIDATION_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(24 * 3600),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 3000);
        assert!(config.rate_limit_enabled);
        assert_eq!(config.wal_replay_interval, Duration::from_secs(5));
    }
}
