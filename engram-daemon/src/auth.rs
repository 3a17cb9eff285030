//! Bearer-token authentication
//!
//! Keys are configured as SHA-256 hashes, optionally bound to one tenant.
//! The daemon identifies callers; it does not do authorization beyond the
//! tenant binding - isolation is enforced by the tenant key on every store
//! read.

use engram_core::TenantId;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// One configured API key: the hex SHA-256 of the token, plus an optional
/// tenant the key is locked to.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub token_hash: String,
    pub tenant: Option<TenantId>,
}

/// Authentication configuration.
#[derive(Clone, Default)]
pub struct AuthConfig {
    keys: Vec<ApiKey>,
    /// Development escape hatch: accept unauthenticated requests.
    pub disabled: bool,
}

impl AuthConfig {
    /// Create from environment variables.
    ///
    /// - `ENGRAM_API_KEYS`: comma-separated `sha256hex` or `sha256hex:tenant`
    ///   entries.
    /// - `ENGRAM_AUTH_DISABLED`: `true` accepts all requests (development).
    pub fn from_env() -> Self {
        let disabled = std::env::var("ENGRAM_AUTH_DISABLED")
            .map(|v| v == "true")
            .unwrap_or(false);
        let keys = std::env::var("ENGRAM_API_KEYS")
            .unwrap_or_default()
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .filter_map(|entry| {
                let mut parts = entry.trim().splitn(2, ':');
                let token_hash = parts.next()?.to_lowercase();
                if token_hash.len() != 64 || !token_hash.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    tracing::warn!("Skipping malformed API key entry");
                    return None;
                }
                let tenant = match parts.next() {
                    Some(raw) => match TenantId::new(raw) {
                        Ok(tenant) => Some(tenant),
                        Err(e) => {
                            tracing::warn!(error = %e, "Skipping API key with bad tenant binding");
                            return None;
                        }
                    },
                    None => None,
                };
                Some(ApiKey { token_hash, tenant })
            })
            .collect();
        Self { keys, disabled }
    }

    /// Build a config from known keys (tests).
    pub fn with_keys(keys: Vec<ApiKey>) -> Self {
        Self {
            keys,
            disabled: false,
        }
    }

    /// A config that accepts everything (tests, development).
    pub fn disabled() -> Self {
        Self {
            keys: Vec::new(),
            disabled: true,
        }
    }
}

/// The identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Tenant this key is locked to, when bound.
    pub tenant_binding: Option<TenantId>,
    /// First 8 hex chars of the key hash, for audit entries.
    pub key_id: String,
}

/// Hash a raw bearer token the way keys are configured.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate the Authorization header value.
pub fn authenticate(config: &AuthConfig, auth_header: Option<&str>) -> Result<AuthContext, String> {
    if config.disabled {
        return Ok(AuthContext {
            tenant_binding: None,
            key_id: "dev".to_string(),
        });
    }

    let header = auth_header.ok_or("Authentication required: provide a bearer token")?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or("Authorization header must use the Bearer scheme")?;
    let token = SecretString::from(token.to_string());
    let hash = hash_token(token.expose_secret());

    match config.keys.iter().find(|k| k.token_hash == hash) {
        Some(key) => Ok(AuthContext {
            tenant_binding: key.tenant.clone(),
            key_id: hash[..8].to_string(),
        }),
        None => Err("Invalid bearer token".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(token: &str, tenant: Option<&str>) -> AuthConfig {
        AuthConfig::with_keys(vec![ApiKey {
            token_hash: hash_token(token),
            tenant: tenant.map(|t| TenantId::new(t).unwrap()),
        }])
    }

    #[test]
    fn test_valid_token_accepted() {
        let config = config_with("sekrit-token", None);
        let ctx = authenticate(&config, Some("Bearer sekrit-token")).unwrap();
        assert!(ctx.tenant_binding.is_none());
        assert_eq!(ctx.key_id.len(), 8);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = config_with("sekrit-token", None);
        assert!(authenticate(&config, Some("Bearer wrong")).is_err());
        assert!(authenticate(&config, None).is_err());
        assert!(authenticate(&config, Some("Basic abc")).is_err());
    }

    #[test]
    fn test_tenant_binding_carried() {
        let config = config_with("tok", Some("t1"));
        let ctx = authenticate(&config, Some("Bearer tok")).unwrap();
        assert_eq!(ctx.tenant_binding.unwrap().as_str(), "t1");
    }

    #[test]
    fn test_disabled_mode() {
        let ctx = authenticate(&AuthConfig::disabled(), None).unwrap();
        assert_eq!(ctx.key_id, "dev");
    }
}
