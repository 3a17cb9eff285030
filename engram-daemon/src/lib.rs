//! Engram Daemon - HTTP/JSON-RPC surface for the shared memory service
//!
//! One authenticated POST route carries the whole tool surface; a health
//! endpoint reports store reachability and WAL depth. Background workers
//! drain the WAL when the store returns and run the consolidation sweep.

pub mod auth;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod limits;
pub mod methods;
pub mod rpc;
pub mod state;
pub mod wal;

pub use auth::{AuthConfig, AuthContext};
pub use config::DaemonConfig;
pub use error::RpcError;
pub use state::AppState;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use engram_core::JobType;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the daemon router: the RPC route behind auth, health outside it.
pub fn create_router(state: AppState, auth_config: AuthConfig) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle_rpc))
        .layer(middleware::from_fn_with_state(
            Arc::new(auth_config),
            auth_middleware,
        ))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Validates the bearer token and injects the AuthContext extension.
async fn auth_middleware(
    State(config): State<Arc<AuthConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    match auth::authenticate(&config, header.as_deref()) {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            Ok(next.run(request).await)
        }
        Err(message) => Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": RpcError::unauthorized(message),
            })),
        )
            .into_response()),
    }
}

/// GET /healthz
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.unwrap_or(false);
    let wal_depth = state.wal.depth().await;
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "store": if store_ok { "ok" } else { "unreachable" },
            "wal_depth": wal_depth,
            "uptime_secs": state.start_time.elapsed().as_secs(),
        })),
    )
}

/// Spawn the WAL replayer and the consolidation scheduler.
///
/// The replayer probes on a short interval but only touches the store when
/// the WAL has depth; the consolidation sweep visits every tenant seen since
/// startup.
pub fn spawn_background_tasks(state: AppState, daemon_config: &DaemonConfig) {
    let replay_state = state.clone();
    let replay_interval = daemon_config.wal_replay_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(replay_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if replay_state.wal.depth().await == 0 {
                continue;
            }
            if !replay_state
                .store
                .health_check()
                .await
                .unwrap_or(false)
            {
                continue;
            }
            if let Err(e) = replay_state
                .wal
                .replay(&replay_state.recorder, replay_state.store.as_ref())
                .await
            {
                tracing::warn!(error = %e, "WAL replay pass failed");
            }
        }
    });

    let sweep_state = state;
    let sweep_interval = daemon_config.consolidation_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let tenants: Vec<String> = sweep_state
                .known_tenants
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for raw in tenants {
                let Ok(tenant) = engram_core::TenantId::new(raw) else {
                    continue;
                };
                if let Err(e) = sweep_state
                    .consolidator
                    .consolidate(sweep_state.store.as_ref(), &tenant, JobType::All, None)
                    .await
                {
                    tracing::warn!(tenant_id = %tenant, error = %e, "Scheduled consolidation failed");
                }
            }
        }
    });
}
