//! Shared application state for the Axum router.

use crate::limits::RateLimits;
use crate::wal::Wal;
use dashmap::DashMap;
use engram_consolidate::Consolidator;
use engram_context::AcbBuilder;
use engram_core::{EmbeddingProvider, EngramConfig};
use engram_recorder::Recorder;
use engram_storage::Store;
use std::sync::Arc;
use std::time::Instant;

/// Application-wide state shared across all requests.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub recorder: Recorder,
    pub builder: AcbBuilder,
    pub consolidator: Consolidator,
    pub wal: Arc<Wal>,
    pub config: Arc<EngramConfig>,
    pub limits: Arc<RateLimits>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    /// Tenants seen since startup; the consolidation scheduler sweeps these.
    pub known_tenants: Arc<DashMap<String, ()>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<EngramConfig>,
        limits: Arc<RateLimits>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            recorder: Recorder::new(Arc::clone(&config)),
            builder: AcbBuilder::new(Arc::clone(&config)),
            consolidator: Consolidator::new(Arc::clone(&config)),
            wal: Arc::new(Wal::new(config.durability.wal_path.clone())),
            store,
            config,
            limits,
            embedder,
            known_tenants: Arc::new(DashMap::new()),
            start_time: Instant::now(),
        }
    }
}
