//! Engram daemon entry point
//!
//! Loads the pipeline configuration, connects the Postgres store, replays
//! any pending WAL entries, and serves the RPC surface until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;

use engram_core::{EngramConfig, EngramError, EngramResult};
use engram_daemon::{
    AppState, AuthConfig, DaemonConfig, create_router, spawn_background_tasks,
};
use engram_daemon::embedding::HttpEmbeddingProvider;
use engram_daemon::limits::RateLimits;
use engram_storage::{PgConfig, PgStore};

#[tokio::main]
async fn main() -> EngramResult<()> {
    init_tracing();

    let config = load_config()?;
    config.validate()?;
    let config = Arc::new(config);

    let store = Arc::new(PgStore::from_config(&PgConfig::from_env())?);
    let daemon_config = DaemonConfig::from_env();
    let limits = Arc::new(RateLimits::new(&daemon_config));

    let embedder = match &config.durability.embedding_endpoint {
        Some(endpoint) => {
            tracing::info!(endpoint = %endpoint, "Embedding provider configured");
            Some(Arc::new(HttpEmbeddingProvider::new(
                endpoint.clone(),
                config.durability.embedding_dimensions,
            )?) as Arc<dyn engram_core::EmbeddingProvider>)
        }
        None => {
            tracing::info!("No embedding endpoint; retrieval is lexical-only");
            None
        }
    };

    let state = AppState::new(store, Arc::clone(&config), limits, embedder);

    // Drain anything deferred by a previous run before accepting traffic.
    match state
        .wal
        .replay(&state.recorder, state.store.as_ref())
        .await
    {
        Ok(outcome) if outcome.replayed > 0 || outcome.remaining > 0 => {
            tracing::info!(
                replayed = outcome.replayed,
                remaining = outcome.remaining,
                "Startup WAL replay"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Startup WAL replay failed"),
    }

    spawn_background_tasks(state.clone(), &daemon_config);

    let auth_config = AuthConfig::from_env();
    let app = create_router(state, auth_config);

    let addr: SocketAddr = format!("{}:{}", daemon_config.bind, daemon_config.port)
        .parse()
        .map_err(|e| EngramError::invalid_value("bind", format!("{}", e)))?;
    tracing::info!(%addr, "Starting Engram daemon");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| EngramError::Fatal {
            reason: format!("failed to bind {}: {}", addr, e),
        })?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| EngramError::Fatal {
                reason: format!("server error: {}", e),
            })?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,engram_daemon=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("ENGRAM_LOG_JSON").map(|v| v == "true").unwrap_or(false) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// The pipeline config comes from `ENGRAM_CONFIG` (TOML path) or defaults.
fn load_config() -> EngramResult<EngramConfig> {
    match std::env::var("ENGRAM_CONFIG") {
        Ok(path) => EngramConfig::load(&path).map_err(|e| EngramError::Fatal {
            reason: e.to_string(),
        }),
        Err(_) => Ok(EngramConfig::default()),
    }
}
