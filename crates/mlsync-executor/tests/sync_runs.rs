use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use mlsync_ampre::{query, AmpreError, ListingSource, PropertyQuery};
use mlsync_core::{ListingRecord, RunStatus, SyncType};
use mlsync_executor::{ExecutorError, RunOutcome, SyncExecutor, SyncRequest, SyncSettings};
use mlsync_store::ListingStore;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Auth,
    Exhausted,
}

/// In-memory stand-in for the AMPRE feed.
#[derive(Default)]
struct FakeFeed {
    records: Vec<Value>,
    media: Vec<Value>,
    delay: Option<Duration>,
    failure: Mutex<Option<Failure>>,
    queries: Mutex<Vec<PropertyQuery>>,
    media_requests: Mutex<Vec<Vec<String>>>,
    /// Media requests after this many succeed fail as exhausted retries.
    media_fails_after: Option<usize>,
}

impl FakeFeed {
    fn with_records(records: Vec<Value>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    fn fail_with(&self, failure: Option<Failure>) {
        *self.failure.lock().unwrap() = failure;
    }

    fn queries(&self) -> Vec<PropertyQuery> {
        self.queries.lock().unwrap().clone()
    }

    fn error(&self) -> Option<AmpreError> {
        self.failure.lock().unwrap().map(|f| match f {
            Failure::Auth => AmpreError::Auth { status: 401 },
            Failure::Exhausted => AmpreError::RetriesExhausted {
                attempts: 3,
                last_error: "http 503: upstream down".to_string(),
            },
        })
    }
}

fn modified(v: &Value) -> Option<DateTime<Utc>> {
    v.get("ModificationTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn listing_key(v: &Value) -> &str {
    v.get("ListingKey").and_then(Value::as_str).unwrap_or_default()
}

/// Reads back the `(timestamp, key)` position from an incremental filter.
fn incremental_position(filter: &str) -> Option<(DateTime<Utc>, Option<String>)> {
    let rest = filter.strip_prefix("ModificationTimestamp gt ")?;
    match rest.split_once(" or ") {
        None => Some((rest.parse().unwrap(), None)),
        Some((ts, tail)) => {
            let key = tail
                .split("ListingKey gt '")
                .nth(1)?
                .trim_end_matches(')')
                .trim_end_matches('\'');
            Some((ts.parse().unwrap(), Some(key.to_string())))
        }
    }
}

#[async_trait]
impl ListingSource for FakeFeed {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch_properties(&self, q: &PropertyQuery) -> Result<Vec<Value>, AmpreError> {
        self.queries.lock().unwrap().push(q.clone());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if let Some(e) = self.error() {
            return Err(e);
        }

        let rows: Vec<Value> = match q.filter.as_deref().and_then(incremental_position) {
            Some((since, after_key)) => {
                let mut rows: Vec<Value> = self
                    .records
                    .iter()
                    .filter(|r| {
                        modified(r).is_some_and(|m| {
                            m > since
                                || (m == since
                                    && after_key
                                        .as_deref()
                                        .is_some_and(|k| listing_key(r) > k))
                        })
                    })
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| {
                    (modified(a), listing_key(a)).cmp(&(modified(b), listing_key(b)))
                });
                rows
            }
            None => self.records.clone(),
        };
        let rows = rows
            .into_iter()
            .skip(q.skip as usize)
            .take(q.top as usize)
            .collect();
        Ok(rows)
    }

    async fn fetch_media(&self, listing_keys: &[String]) -> Result<Vec<Value>, AmpreError> {
        let sent = {
            let mut requests = self.media_requests.lock().unwrap();
            requests.push(listing_keys.to_vec());
            requests.len()
        };
        if let Some(e) = self.error() {
            return Err(e);
        }
        if self.media_fails_after.is_some_and(|n| sent > n) {
            return Err(AmpreError::RetriesExhausted {
                attempts: 3,
                last_error: "http 502: bad gateway".to_string(),
            });
        }
        Ok(self
            .media
            .iter()
            .filter(|m| {
                m.get("ResourceRecordKey")
                    .and_then(Value::as_str)
                    .is_some_and(|k| listing_keys.iter().any(|l| l == k))
            })
            .cloned()
            .collect())
    }
}

fn key(i: usize) -> String {
    format!("K{i:06}")
}

fn property(i: usize, modified_at: DateTime<Utc>) -> Value {
    json!({
        "ListingKey": key(i),
        "ListPrice": 500_000.0 + i as f64,
        "City": "Toronto",
        "StandardStatus": "Active",
        "ModificationTimestamp": modified_at.to_rfc3339(),
    })
}

fn properties(n: usize) -> Vec<Value> {
    let base: DateTime<Utc> = "2026-10-01T00:00:00Z".parse().unwrap();
    (0..n)
        .map(|i| property(i, base + chrono::Duration::minutes(i as i64)))
        .collect()
}

fn settings() -> SyncSettings {
    SyncSettings {
        page_size: 500,
        max_properties: 15_000,
        lock_ttl: Duration::from_secs(3600),
        incremental_lookback: chrono::Duration::hours(24),
        media_batch_size: 20,
    }
}

fn executor(feed: Arc<FakeFeed>, settings: SyncSettings) -> SyncExecutor<Arc<FakeFeed>> {
    SyncExecutor::new(feed, ListingStore::open_in_memory().unwrap(), settings)
}

fn full(limit: u32) -> SyncRequest {
    SyncRequest {
        sync_type: SyncType::Full,
        limit,
        skip_existing: false,
    }
}

fn completed(outcome: RunOutcome) -> mlsync_core::RunLog {
    match outcome {
        RunOutcome::Completed(log) => log,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

#[tokio::test]
async fn full_sync_rotates_through_windows_then_wraps() {
    let feed = Arc::new(FakeFeed::with_records(properties(12_500)));
    let exec = executor(
        feed,
        SyncSettings {
            max_properties: 12_500,
            ..settings()
        },
    );

    let mut starts = Vec::new();
    for _ in 0..6 {
        let log = completed(exec.run(full(2_500)).await.unwrap());
        assert_eq!(log.records_upserted, 2_500);
        starts.push(log.offset_before);
    }
    assert_eq!(starts, vec![0, 2_500, 5_000, 7_500, 10_000, 0]);
    assert_eq!(exec.store().listing_count().unwrap(), 12_500);
    assert_eq!(exec.store().cursor(SyncType::Full).unwrap().offset, 2_500);
}

#[tokio::test]
async fn requests_are_paged_within_the_run_slice() {
    let feed = Arc::new(FakeFeed::with_records(properties(5_000)));
    let exec = executor(feed.clone(), settings());

    exec.run(full(1_200)).await.unwrap();

    let paging: Vec<(u64, u32)> = feed.queries().iter().map(|q| (q.skip, q.top)).collect();
    assert_eq!(paging, vec![(0, 500), (500, 500), (1_000, 200)]);
    assert!(feed
        .queries()
        .iter()
        .all(|q| q.orderby == query::ORDER_BY_KEY && q.filter.is_none()));
}

#[tokio::test]
async fn malformed_records_are_counted_and_skipped() {
    let mut records = properties(5_000);
    for i in [3, 700, 1_999] {
        records[i] = json!({ "ListingKey": key(i), "ListPrice": "call for price" });
    }
    let exec = executor(Arc::new(FakeFeed::with_records(records)), settings());

    let log = completed(exec.run(full(2_500)).await.unwrap());
    assert_eq!(log.records_fetched, 2_500);
    assert_eq!(log.records_upserted, 2_497);
    assert_eq!(log.error_count, 3);
    assert_eq!(log.offset_after, 2_497);
    assert!(exec.store().listing(&key(700)).unwrap().is_none());
}

#[tokio::test]
async fn failed_run_leaves_offset_in_place() {
    let feed = Arc::new(FakeFeed::with_records(properties(5_000)));
    let exec = executor(feed.clone(), settings());
    completed(exec.run(full(2_500)).await.unwrap());

    feed.fail_with(Some(Failure::Exhausted));
    let log = match exec.run(full(2_500)).await.unwrap() {
        RunOutcome::Failed(log) => log,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(log.status, RunStatus::Failed);
    assert_eq!(log.offset_before, 2_500);
    assert_eq!(log.offset_after, 2_500);
    assert_eq!(log.records_upserted, 0);
    assert!(log.message.as_deref().unwrap().starts_with("fetching"));

    let cursor = exec.store().cursor(SyncType::Full).unwrap();
    assert_eq!(cursor.offset, 2_500);
    assert!(!cursor.last_success);

    let runs = exec.store().recent_runs(10).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn auth_failure_fails_the_run() {
    let feed = Arc::new(FakeFeed::with_records(properties(10)));
    feed.fail_with(Some(Failure::Auth));
    let exec = executor(feed.clone(), settings());

    match exec.run(full(100)).await.unwrap() {
        RunOutcome::Failed(log) => assert!(log.message.unwrap().contains("401")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(feed.queries().len(), 1);
    assert_eq!(exec.store().listing_count().unwrap(), 0);
}

#[tokio::test]
async fn lease_is_released_after_failure() {
    let feed = Arc::new(FakeFeed::with_records(properties(10)));
    feed.fail_with(Some(Failure::Exhausted));
    let exec = executor(feed.clone(), settings());

    assert!(matches!(exec.run(full(100)).await.unwrap(), RunOutcome::Failed(_)));
    assert!(exec
        .store()
        .lease_holder(&SyncType::Full.lease_name())
        .unwrap()
        .is_none());

    feed.fail_with(None);
    let log = completed(exec.run(full(100)).await.unwrap());
    assert_eq!(log.records_upserted, 10);
}

#[tokio::test]
async fn overlapping_runs_of_one_type_skip() {
    let feed = Arc::new(FakeFeed {
        delay: Some(Duration::from_millis(50)),
        ..FakeFeed::with_records(properties(100))
    });
    let exec = executor(feed, settings());

    let (a, b) = tokio::join!(exec.run(full(100)), exec.run(full(100)));
    let outcomes = [a.unwrap(), b.unwrap()];

    let finished = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::Completed(_)))
        .count();
    assert_eq!(finished, 1);
    let skipped = outcomes.iter().find_map(|o| match o {
        RunOutcome::Skipped { sync_type, held_by } => Some((*sync_type, held_by.clone())),
        _ => None,
    });
    let (sync_type, held_by) = skipped.expect("one run should have been skipped");
    assert_eq!(sync_type, SyncType::Full);
    assert!(held_by.is_some());
    assert_eq!(exec.store().recent_runs(10).unwrap().len(), 1);
}

#[tokio::test]
async fn different_sync_types_run_concurrently() {
    let feed = Arc::new(FakeFeed {
        delay: Some(Duration::from_millis(20)),
        ..FakeFeed::with_records(properties(50))
    });
    let exec = executor(feed, settings());
    let incremental = SyncRequest {
        sync_type: SyncType::Incremental,
        limit: 100,
        skip_existing: false,
    };

    let (a, b) = tokio::join!(exec.run(full(100)), exec.run(incremental));
    assert!(matches!(a.unwrap(), RunOutcome::Completed(_)));
    assert!(matches!(b.unwrap(), RunOutcome::Completed(_)));
}

#[tokio::test]
async fn short_page_wraps_and_reruns_are_idempotent() {
    let exec = executor(Arc::new(FakeFeed::with_records(properties(300))), settings());

    let first = completed(exec.run(full(2_500)).await.unwrap());
    assert_eq!(first.records_fetched, 300);
    assert_eq!(first.offset_after, 0);

    let second = completed(exec.run(full(2_500)).await.unwrap());
    assert_eq!(second.offset_before, 0);
    assert_eq!(second.records_upserted, 300);
    assert_eq!(exec.store().listing_count().unwrap(), 300);
}

#[tokio::test]
async fn zero_limit_is_rejected() {
    let exec = executor(Arc::new(FakeFeed::default()), settings());
    let err = exec.run(full(0)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidRequest(_)));
}

#[tokio::test]
async fn incremental_advances_watermark_through_changes() {
    let now = Utc::now();
    let base = DateTime::from_timestamp(now.timestamp() - 10 * 3600, 0).unwrap();
    let stale = DateTime::from_timestamp(now.timestamp() - 48 * 3600, 0).unwrap();

    let mut records: Vec<Value> = (0..10)
        .map(|i| property(i, base + chrono::Duration::minutes(i as i64)))
        .collect();
    records.push(property(99, stale));
    let feed = Arc::new(FakeFeed::with_records(records));
    let exec = executor(
        feed.clone(),
        SyncSettings {
            page_size: 2,
            ..settings()
        },
    );
    let req = SyncRequest {
        sync_type: SyncType::Incremental,
        limit: 4,
        skip_existing: false,
    };

    // first run: no watermark, 24h lookback, slice is full
    let first = completed(exec.run(req).await.unwrap());
    assert_eq!(first.records_upserted, 4);
    let cursor = exec.store().cursor(SyncType::Incremental).unwrap();
    assert_eq!(cursor.watermark, Some(base + chrono::Duration::minutes(3)));
    assert_eq!(cursor.watermark_key, Some(key(3)));
    assert!(feed.queries().iter().all(|q| {
        q.orderby == query::ORDER_BY_MODIFIED
            && q.filter
                .as_deref()
                .is_some_and(|f| f.starts_with("ModificationTimestamp gt "))
    }));

    let second = completed(exec.run(req).await.unwrap());
    assert_eq!(second.records_upserted, 4);

    // two left: short slice, watermark jumps to the run start
    let third = completed(exec.run(req).await.unwrap());
    assert_eq!(third.records_upserted, 2);
    let cursor = exec.store().cursor(SyncType::Incremental).unwrap();
    assert!(cursor.watermark.unwrap() >= third.started_at - chrono::Duration::seconds(1));

    assert_eq!(exec.store().listing_count().unwrap(), 10);
    assert!(exec.store().listing(&key(99)).unwrap().is_none());
}

fn photo(listing: &str, url: &str, order: i64) -> Value {
    json!({
        "ResourceRecordKey": listing,
        "MediaURL": url,
        "Order": order,
        "MediaCategory": "Photo",
    })
}

fn seeded_image_store(feed: Arc<FakeFeed>) -> SyncExecutor<Arc<FakeFeed>> {
    seeded_image_store_with(feed, settings())
}

fn seeded_image_store_with(
    feed: Arc<FakeFeed>,
    settings: SyncSettings,
) -> SyncExecutor<Arc<FakeFeed>> {
    let exec = executor(feed, settings);
    let mut with_media = ListingRecord::with_key("A1");
    with_media.media = vec!["old.jpg".to_string()];
    let records = vec![
        with_media,
        ListingRecord::with_key("A2"),
        ListingRecord::with_key("A3"),
    ];
    let cursor = exec.store().cursor(SyncType::Full).unwrap();
    exec.store().commit_listings(&records, &cursor).unwrap();
    exec
}

fn image_feed() -> Arc<FakeFeed> {
    Arc::new(FakeFeed {
        media: vec![
            photo("A1", "new-1.jpg", 1),
            photo("A2", "a2-2.jpg", 2),
            photo("A2", "a2-1.jpg", 1),
            json!({ "ResourceRecordKey": "A3", "MediaURL": "plan.pdf", "MediaCategory": "Document" }),
            photo("A3", "a3-1.jpg", 1),
            json!({ "ResourceRecordKey": "A3" }),
        ],
        ..FakeFeed::default()
    })
}

#[tokio::test]
async fn image_refresh_skip_existing_never_overwrites_media() {
    let feed = image_feed();
    let exec = seeded_image_store(feed.clone());

    let log = completed(
        exec.run(SyncRequest {
            sync_type: SyncType::ImageRefresh,
            limit: 10,
            skip_existing: true,
        })
        .await
        .unwrap(),
    );

    assert_eq!(log.records_fetched, 2);
    assert_eq!(log.records_upserted, 2);
    assert_eq!(log.error_count, 1);
    assert_eq!(log.offset_after, 0);

    let requested: HashSet<String> = feed
        .media_requests
        .lock()
        .unwrap()
        .iter()
        .flatten()
        .cloned()
        .collect();
    assert!(!requested.contains("A1"));

    let store = exec.store();
    assert_eq!(store.listing("A1").unwrap().unwrap().media, vec!["old.jpg"]);
    assert_eq!(
        store.listing("A2").unwrap().unwrap().media,
        vec!["a2-1.jpg", "a2-2.jpg"]
    );
    assert_eq!(store.listing("A3").unwrap().unwrap().media, vec!["a3-1.jpg"]);
}

#[tokio::test]
async fn image_refresh_walks_key_space_in_slices() {
    let feed = image_feed();
    let exec = seeded_image_store(feed);
    let req = SyncRequest {
        sync_type: SyncType::ImageRefresh,
        limit: 2,
        skip_existing: false,
    };

    let first = completed(exec.run(req).await.unwrap());
    assert_eq!((first.offset_before, first.offset_after), (0, 2));
    assert_eq!(
        exec.store().listing("A1").unwrap().unwrap().media,
        vec!["new-1.jpg"]
    );

    let second = completed(exec.run(req).await.unwrap());
    assert_eq!((second.offset_before, second.offset_after), (2, 0));
    assert_eq!(second.records_fetched, 1);
}

#[tokio::test]
async fn incremental_pages_through_records_sharing_a_timestamp() {
    let now = Utc::now();
    let t0 = DateTime::from_timestamp(now.timestamp() - 3600, 0).unwrap();
    let t1 = t0 + chrono::Duration::milliseconds(1_250);

    let mut records = vec![property(0, t0)];
    records.extend((1..=5).map(|i| property(i, t1)));
    let exec = executor(Arc::new(FakeFeed::with_records(records)), settings());
    let req = SyncRequest {
        sync_type: SyncType::Incremental,
        limit: 2,
        skip_existing: false,
    };

    let mut marks = Vec::new();
    for _ in 0..3 {
        let log = completed(exec.run(req).await.unwrap());
        assert_eq!(log.records_upserted, 2);
        let cursor = exec.store().cursor(SyncType::Incremental).unwrap();
        assert_eq!(cursor.watermark, Some(t1));
        marks.push(cursor.watermark_key.unwrap());
    }
    assert_eq!(marks, vec![key(1), key(3), key(5)]);

    let last = completed(exec.run(req).await.unwrap());
    assert_eq!(last.records_upserted, 0);
    let cursor = exec.store().cursor(SyncType::Incremental).unwrap();
    assert!(cursor.watermark.unwrap() > t1);
    assert!(cursor.watermark_key.is_none());

    assert_eq!(exec.store().listing_count().unwrap(), 6);
}

#[tokio::test]
async fn failed_incremental_run_keeps_watermark() {
    let now = Utc::now();
    let base = DateTime::from_timestamp(now.timestamp() - 3600, 0).unwrap();
    let records = (0..6)
        .map(|i| property(i, base + chrono::Duration::minutes(i as i64)))
        .collect();
    let feed = Arc::new(FakeFeed::with_records(records));
    let exec = executor(feed.clone(), settings());
    let req = SyncRequest {
        sync_type: SyncType::Incremental,
        limit: 3,
        skip_existing: false,
    };

    completed(exec.run(req).await.unwrap());
    let before = exec.store().cursor(SyncType::Incremental).unwrap();
    assert!(before.last_success);

    feed.fail_with(Some(Failure::Exhausted));
    match exec.run(req).await.unwrap() {
        RunOutcome::Failed(log) => assert_eq!(log.records_upserted, 0),
        other => panic!("expected failure, got {other:?}"),
    }
    let after = exec.store().cursor(SyncType::Incremental).unwrap();
    assert_eq!(after.watermark, before.watermark);
    assert_eq!(after.watermark_key, before.watermark_key);
    assert!(!after.last_success);

    // the next good run resumes where the last good one stopped
    feed.fail_with(None);
    let resumed = completed(exec.run(req).await.unwrap());
    assert_eq!(resumed.records_upserted, 3);
    assert_eq!(exec.store().listing_count().unwrap(), 6);
}

#[tokio::test]
async fn image_refresh_failing_mid_batch_writes_nothing() {
    let feed = Arc::new(FakeFeed {
        media_fails_after: Some(1),
        ..Arc::into_inner(image_feed()).unwrap()
    });
    let exec = seeded_image_store_with(
        feed.clone(),
        SyncSettings {
            media_batch_size: 1,
            ..settings()
        },
    );
    exec.store().reset_cursor(SyncType::ImageRefresh, 1).unwrap();

    let log = match exec
        .run(SyncRequest {
            sync_type: SyncType::ImageRefresh,
            limit: 10,
            skip_existing: false,
        })
        .await
        .unwrap()
    {
        RunOutcome::Failed(log) => log,
        other => panic!("expected failure, got {other:?}"),
    };
    assert!(log.message.as_deref().unwrap().starts_with("fetching"));
    assert_eq!((log.offset_before, log.offset_after), (1, 1));
    assert_eq!(feed.media_requests.lock().unwrap().len(), 2);

    let store = exec.store();
    let cursor = store.cursor(SyncType::ImageRefresh).unwrap();
    assert_eq!(cursor.offset, 1);
    assert!(!cursor.last_success);
    // A2's batch came back before the failure but is not written
    assert!(store.listing("A2").unwrap().unwrap().media.is_empty());
    assert!(store.listing("A3").unwrap().unwrap().media.is_empty());
    assert_eq!(store.listing("A1").unwrap().unwrap().media, vec!["old.jpg"]);
}

#[tokio::test]
async fn run_log_records_clamped_start_offset() {
    let exec = executor(Arc::new(FakeFeed::with_records(properties(300))), settings());
    exec.store().reset_cursor(SyncType::Full, 20_000).unwrap();

    let log = completed(exec.run(full(100)).await.unwrap());
    assert_eq!(log.offset_before, 0);
    assert_eq!(log.offset_after, 100);
    assert_eq!(exec.store().listing(&key(0)).unwrap().unwrap().list_price, Some(500_000.0));
}
