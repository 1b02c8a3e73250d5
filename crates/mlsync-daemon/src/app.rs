use axum::{routing::get, Router};
use mlsync_scheduler::SchedulerHandle;
use mlsync_store::ListingStore;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::http::status::StatusSnapshot;

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub store: ListingStore,
    /// `None` when the status server runs without a scheduler (tests).
    pub scheduler: Option<SchedulerHandle>,
    pub cache_ttl: Duration,
    pub started_at: Instant,
    pub status_cache: Mutex<Option<(Instant, StatusSnapshot)>>,
}

impl AppState {
    pub fn new(store: ListingStore, scheduler: Option<SchedulerHandle>, cache_ttl: Duration) -> Self {
        Self {
            store,
            scheduler,
            cache_ttl,
            started_at: Instant::now(),
            status_cache: Mutex::new(None),
        }
    }
}

/// Assemble the status router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/status", get(crate::http::status::status_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
