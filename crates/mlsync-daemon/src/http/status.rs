use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use mlsync_core::{RunLog, SyncCursor, SyncType};
use mlsync_scheduler::{SchedulerHandle, TriggerState};
use mlsync_store::ListingStore;

use crate::app::AppState;

/// Runs included in the HTTP snapshot.
const RECENT_RUNS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct LeaseView {
    pub sync_type: SyncType,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Point-in-time view of the sync state, shared by `GET /status` and
/// `mlsyncd status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub listings: u64,
    pub cursors: Vec<SyncCursor>,
    pub leases: Vec<LeaseView>,
    pub triggers: Vec<TriggerState>,
    pub recent_runs: Vec<RunLog>,
}

pub fn build_snapshot(
    store: &ListingStore,
    scheduler: Option<&SchedulerHandle>,
    runs: usize,
) -> anyhow::Result<StatusSnapshot> {
    let mut leases = Vec::new();
    for sync_type in SyncType::ALL {
        if let Some((holder, expires_at)) = store.lease_holder(&sync_type.lease_name())? {
            leases.push(LeaseView {
                sync_type,
                holder,
                expires_at,
            });
        }
    }
    let triggers = match scheduler {
        Some(handle) => handle.list_triggers()?,
        None => Vec::new(),
    };

    Ok(StatusSnapshot {
        generated_at: Utc::now(),
        listings: store.listing_count()?,
        cursors: store.cursors()?,
        leases,
        triggers,
        recent_runs: store.recent_runs(runs)?,
    })
}

/// GET /status: cursors, leases, triggers and recent runs. The snapshot is
/// cached for `sync.cache_ttl_secs`.
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusSnapshot>, (StatusCode, Json<Value>)> {
    let mut cache = state.status_cache.lock().map_err(|_| {
        internal("status cache lock poisoned".to_string())
    })?;

    if let Some((taken, snapshot)) = cache.as_ref() {
        if taken.elapsed() < state.cache_ttl {
            debug!("serving cached status snapshot");
            return Ok(Json(snapshot.clone()));
        }
    }

    let snapshot = build_snapshot(&state.store, state.scheduler.as_ref(), RECENT_RUNS)
        .map_err(|e| {
            error!(error = %e, "status snapshot failed");
            internal(e.to_string())
        })?;
    *cache = Some((Instant::now(), snapshot.clone()));
    Ok(Json(snapshot))
}

fn internal(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}
