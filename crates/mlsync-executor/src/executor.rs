use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mlsync_ampre::{
    decode_media, decode_property, group_photos, query, ListingSource, PropertyQuery,
};
use mlsync_core::{ListingRecord, MlsyncConfig, RunLog, RunStatus, SyncCursor, SyncType};
use mlsync_store::ListingStore;

use crate::error::{ExecutorError, Result};
use crate::rotation::{self, Watermark};

/// Executor policy, usually built from [`MlsyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// `$top` of one HTTP request.
    pub page_size: u32,
    pub max_properties: u64,
    pub lock_ttl: Duration,
    pub incremental_lookback: chrono::Duration,
    pub media_batch_size: usize,
}

impl SyncSettings {
    pub fn from_config(config: &MlsyncConfig) -> Self {
        Self {
            page_size: config.ampre.page_size,
            max_properties: config.sync.max_properties,
            lock_ttl: Duration::from_secs(config.sync.lock_ttl_secs),
            incremental_lookback: chrono::Duration::hours(i64::from(
                config.sync.incremental_lookback_hours,
            )),
            media_batch_size: config.ampre.media_batch_size,
        }
    }
}

/// One invocation of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub sync_type: SyncType,
    /// Records (full, incremental) or listing keys (image refresh) per run.
    pub limit: u32,
    /// Image refresh only: leave listings that already have media alone.
    pub skip_existing: bool,
}

/// Where a run was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Locked,
    Fetching,
    Upserting,
    AdvanceCursor,
    LogError,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Locked => "locked",
            RunPhase::Fetching => "fetching",
            RunPhase::Upserting => "upserting",
            RunPhase::AdvanceCursor => "advance_cursor",
            RunPhase::LogError => "log_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another holder owns the lease for this sync type.
    Skipped {
        sync_type: SyncType,
        held_by: Option<String>,
    },
    Completed(RunLog),
    Failed(RunLog),
}

impl RunOutcome {
    pub fn run_log(&self) -> Option<&RunLog> {
        match self {
            RunOutcome::Completed(log) | RunOutcome::Failed(log) => Some(log),
            RunOutcome::Skipped { .. } => None,
        }
    }
}

/// Counters and phase of the run in flight.
struct Progress {
    phase: RunPhase,
    /// Offset the run actually started from, after clamping.
    start: u64,
    fetched: u64,
    upserted: u64,
    errors: u64,
}

impl Progress {
    fn new(start: u64) -> Self {
        Self {
            phase: RunPhase::Locked,
            start,
            fetched: 0,
            upserted: 0,
            errors: 0,
        }
    }
}

/// Runs one sync of a given type: lock, fetch, upsert, advance cursor, log.
///
/// A failed run never surfaces as `Err`: it is written to the run log and
/// returned as [`RunOutcome::Failed`] with the cursor offset untouched. `Err`
/// is reserved for a store that cannot even record the failure.
pub struct SyncExecutor<S> {
    source: S,
    store: ListingStore,
    settings: SyncSettings,
    node_id: String,
}

impl<S: ListingSource> SyncExecutor<S> {
    pub fn new(source: S, store: ListingStore, settings: SyncSettings) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            source,
            store,
            settings,
            node_id: format!("{host}:{}", std::process::id()),
        }
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub async fn run(&self, req: SyncRequest) -> Result<RunOutcome> {
        if req.limit == 0 {
            return Err(ExecutorError::InvalidRequest("limit must be > 0".to_string()));
        }

        let lease_name = req.sync_type.lease_name();
        let holder = format!("{}:{}", self.node_id, Uuid::new_v4());
        let Some(lease) = self
            .store
            .try_acquire_lease(&lease_name, &holder, self.settings.lock_ttl)?
        else {
            let held_by = self.store.lease_holder(&lease_name)?.map(|(h, _)| h);
            info!(sync_type = %req.sync_type, ?held_by, "sync already running, skipping tick");
            return Ok(RunOutcome::Skipped {
                sync_type: req.sync_type,
                held_by,
            });
        };

        let started_at = Utc::now();
        let before = self.store.cursor(req.sync_type)?;
        info!(
            sync_type = %req.sync_type,
            limit = req.limit,
            offset = before.offset,
            source = self.source.name(),
            "sync run started"
        );

        let mut progress = Progress::new(before.offset);
        let result = match req.sync_type {
            SyncType::Full => self.run_full(&req, &before, started_at, &mut progress).await,
            SyncType::Incremental => {
                self.run_incremental(&req, &before, started_at, &mut progress)
                    .await
            }
            SyncType::ImageRefresh => {
                self.run_image_refresh(&req, &before, started_at, &mut progress)
                    .await
            }
        };

        let mut log = RunLog {
            id: 0,
            sync_type: req.sync_type,
            started_at,
            finished_at: Utc::now(),
            records_fetched: progress.fetched,
            records_upserted: progress.upserted,
            error_count: progress.errors,
            status: RunStatus::Completed,
            offset_before: progress.start,
            offset_after: before.offset,
            message: None,
        };

        let outcome = match result {
            Ok(after) => {
                log.offset_after = after.offset;
                info!(
                    sync_type = %req.sync_type,
                    fetched = log.records_fetched,
                    upserted = log.records_upserted,
                    errors = log.error_count,
                    offset_after = after.offset,
                    "sync run completed"
                );
                log.id = self.store.append_run_log(&log)?;
                RunOutcome::Completed(log)
            }
            Err(e) => {
                let failed_in = progress.phase;
                progress.phase = RunPhase::LogError;
                error!(
                    sync_type = %req.sync_type,
                    phase = %failed_in,
                    error = %e,
                    "sync run failed; cursor left in place"
                );
                log.status = RunStatus::Failed;
                log.message = Some(format!("{failed_in}: {e}"));
                self.store.record_failure(req.sync_type, started_at)?;
                log.id = self.store.append_run_log(&log)?;
                RunOutcome::Failed(log)
            }
        };
        progress.phase = RunPhase::Idle;
        match lease.release() {
            Ok(true) => {
                debug!(sync_type = %req.sync_type, phase = %progress.phase, "lease released")
            }
            Ok(false) => warn!(sync_type = %req.sync_type, "lease expired and was taken over mid-run"),
            Err(e) => warn!(sync_type = %req.sync_type, "lease release failed: {e}"),
        }
        Ok(outcome)
    }

    async fn run_full(
        &self,
        req: &SyncRequest,
        cursor: &SyncCursor,
        started_at: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<SyncCursor> {
        let start = rotation::full_start_offset(cursor.offset, self.settings.max_properties);
        if start != cursor.offset {
            info!(stored = cursor.offset, "stored offset past max_properties, restarting at 0");
        }
        progress.start = start;

        progress.phase = RunPhase::Fetching;
        let (rows, exhausted) = self
            .fetch_slice(req.limit, |skip, top| PropertyQuery {
                top,
                skip: start + skip,
                filter: None,
                orderby: query::ORDER_BY_KEY.to_string(),
            })
            .await?;

        let records = self.decode_rows(rows, progress);

        progress.phase = RunPhase::Upserting;
        let mut next = cursor.clone();
        next.offset = rotation::next_full_offset(
            start,
            records.len() as u64,
            exhausted,
            self.settings.max_properties,
        );
        next.last_run_at = Some(started_at);
        next.last_success = true;
        if next.offset == 0 {
            info!(start, exhausted, "full sync wrapped to offset 0");
        }
        progress.upserted = self.store.commit_listings(&records, &next)?;
        progress.phase = RunPhase::AdvanceCursor;
        Ok(next)
    }

    async fn run_incremental(
        &self,
        req: &SyncRequest,
        cursor: &SyncCursor,
        started_at: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<SyncCursor> {
        let current = Watermark {
            at: rotation::incremental_since(
                cursor.watermark,
                started_at,
                self.settings.incremental_lookback,
            ),
            key: cursor.watermark.and(cursor.watermark_key.clone()),
        };
        let filter = query::modified_after(current.at, current.key.as_deref());
        debug!(since = %current.at, after_key = ?current.key, "incremental sync window");

        progress.phase = RunPhase::Fetching;
        let (rows, exhausted) = self
            .fetch_slice(req.limit, |skip, top| PropertyQuery {
                top,
                skip,
                filter: Some(filter.clone()),
                orderby: query::ORDER_BY_MODIFIED.to_string(),
            })
            .await?;

        let records = self.decode_rows(rows, progress);
        // matches ORDER_BY_MODIFIED, so this is the last record of the slice
        let last_seen = records
            .iter()
            .filter_map(|r| r.modified_at.map(|at| (at, r.listing_key.as_str())))
            .max();
        let mark = rotation::next_watermark(&current, started_at, exhausted, last_seen);

        progress.phase = RunPhase::Upserting;
        let mut next = cursor.clone();
        next.watermark = Some(mark.at);
        next.watermark_key = mark.key;
        next.last_run_at = Some(started_at);
        next.last_success = true;
        progress.upserted = self.store.commit_listings(&records, &next)?;
        progress.phase = RunPhase::AdvanceCursor;
        Ok(next)
    }

    async fn run_image_refresh(
        &self,
        req: &SyncRequest,
        cursor: &SyncCursor,
        started_at: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<SyncCursor> {
        let total = self.store.listing_count()?;
        let start = rotation::image_start_offset(cursor.offset, total);
        progress.start = start;
        let slice = self.store.listing_keys_slice(start, req.limit)?;

        let candidates: Vec<String> = slice
            .iter()
            .filter(|slot| !(req.skip_existing && slot.has_media))
            .map(|slot| slot.listing_key.clone())
            .collect();
        debug!(
            start,
            examined = slice.len(),
            candidates = candidates.len(),
            "image refresh slice"
        );

        progress.phase = RunPhase::Fetching;
        let mut photos = Vec::new();
        for batch in candidates.chunks(self.settings.media_batch_size.max(1)) {
            for row in self.source.fetch_media(batch).await? {
                match decode_media(row) {
                    Ok(Some(item)) => photos.push(item),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "skipping malformed media row");
                        progress.errors += 1;
                    }
                }
            }
        }
        progress.fetched = candidates.len() as u64;

        let wanted: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let updates: Vec<(String, Vec<String>)> = group_photos(photos)
            .into_iter()
            .filter(|(key, urls)| !urls.is_empty() && wanted.contains(key.as_str()))
            .collect();

        progress.phase = RunPhase::Upserting;
        let mut next = cursor.clone();
        next.offset = rotation::next_image_offset(start, slice.len() as u64, req.limit, total);
        next.last_run_at = Some(started_at);
        next.last_success = true;
        progress.upserted = self
            .store
            .commit_media(&updates, req.skip_existing, &next)?;
        progress.phase = RunPhase::AdvanceCursor;
        Ok(next)
    }

    /// Pull up to `limit` rows in requests of at most `page_size`. Returns the
    /// rows and whether the remote ran out before `limit` was reached.
    async fn fetch_slice<F>(&self, limit: u32, make_query: F) -> Result<(Vec<Value>, bool)>
    where
        F: Fn(u64, u32) -> PropertyQuery,
    {
        let page_size = self.settings.page_size.max(1);
        let mut rows: Vec<Value> = Vec::new();

        while (rows.len() as u64) < u64::from(limit) {
            let remaining = u64::from(limit) - rows.len() as u64;
            let top = remaining.min(u64::from(page_size)) as u32;
            let q = make_query(rows.len() as u64, top);
            let page = self.source.fetch_properties(&q).await?;
            let n = page.len();
            rows.extend(page);
            if n < top as usize {
                return Ok((rows, true));
            }
        }
        Ok((rows, false))
    }

    fn decode_rows(&self, rows: Vec<Value>, progress: &mut Progress) -> Vec<ListingRecord> {
        progress.fetched = rows.len() as u64;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_property(row) {
                Ok(r) => records.push(r),
                Err(e) => {
                    warn!(error = %e, "skipping malformed listing");
                    progress.errors += 1;
                }
            }
        }
        if progress.fetched > 0 && records.is_empty() {
            warn!(
                fetched = progress.fetched,
                "every fetched record was malformed; cursor cannot advance"
            );
        }
        records
    }
}
