use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use tracing::{debug, info};

use mlsync_core::{ListingRecord, RunLog, RunStatus, SyncCursor, SyncType};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::lease::{self, LeaseGuard};

/// Fixed-width RFC 3339 so TEXT comparison in SQL orders correctly.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// One entry of the locally known key space, as walked by image refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub listing_key: String,
    pub has_media: bool,
}

const UPSERT_LISTING: &str = "
    INSERT INTO listings (
        listing_key, list_price, street_number, street_name, street_suffix,
        unit_number, city, province, postal_code, standard_status,
        property_type, bedrooms, bathrooms, media, modified_at, listed_at,
        first_seen_at, synced_at
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
    ON CONFLICT(listing_key) DO UPDATE SET
        list_price      = excluded.list_price,
        street_number   = excluded.street_number,
        street_name     = excluded.street_name,
        street_suffix   = excluded.street_suffix,
        unit_number     = excluded.unit_number,
        city            = excluded.city,
        province        = excluded.province,
        postal_code     = excluded.postal_code,
        standard_status = excluded.standard_status,
        property_type   = excluded.property_type,
        bedrooms        = excluded.bedrooms,
        bathrooms       = excluded.bathrooms,
        -- property feeds carry no media; keep what image refresh stored
        media           = CASE WHEN excluded.media = '[]' THEN listings.media ELSE excluded.media END,
        modified_at     = excluded.modified_at,
        listed_at       = excluded.listed_at,
        synced_at       = excluded.synced_at";

const SELECT_LISTING: &str = "
    SELECT listing_key, list_price, street_number, street_name, street_suffix,
           unit_number, city, province, postal_code, standard_status,
           property_type, bedrooms, bathrooms, media, modified_at, listed_at
    FROM listings";

const SELECT_RUN_LOG: &str = "
    SELECT id, sync_type, started_at, finished_at, records_fetched,
           records_upserted, error_count, status, offset_before, offset_after, message
    FROM run_logs";

/// Local listings store, cursors, run history and leases.
///
/// Thread-safe: the SQLite connection sits behind a mutex shared with any
/// outstanding [`LeaseGuard`] so guards can release on drop.
#[derive(Clone)]
pub struct ListingStore {
    db: Arc<Mutex<Connection>>,
}

impl ListingStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the database file used by every sync process on a host.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        // Two daemons racing for a lease wait for the write lock instead of erroring.
        conn.busy_timeout(Duration::from_secs(5))?;
        info!(%path, "listing store opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- cursors -------------------------------------------------------------

    /// Current cursor for `sync_type`, created at offset 0 on first read.
    pub fn cursor(&self, sync_type: SyncType) -> Result<SyncCursor> {
        let conn = self.conn()?;
        read_cursor(&conn, sync_type)
    }

    /// Cursors for every sync type, in [`SyncType::ALL`] order.
    pub fn cursors(&self) -> Result<Vec<SyncCursor>> {
        let conn = self.conn()?;
        SyncType::ALL
            .iter()
            .map(|t| read_cursor(&conn, *t))
            .collect()
    }

    /// Operator override: move a cursor to `offset` and clear its watermark.
    pub fn reset_cursor(&self, sync_type: SyncType, offset: u64) -> Result<SyncCursor> {
        let conn = self.conn()?;
        let mut cursor = read_cursor(&conn, sync_type)?;
        cursor.offset = offset;
        cursor.watermark = None;
        cursor.watermark_key = None;
        write_cursor(&conn, &cursor)?;
        info!(sync_type = %sync_type, offset, "cursor reset");
        Ok(cursor)
    }

    /// Mark a failed run on the cursor without touching offset or watermark.
    pub fn record_failure(&self, sync_type: SyncType, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        read_cursor(&conn, sync_type)?;
        conn.execute(
            "UPDATE sync_cursors SET last_run_at = ?1, last_success = 0, updated_at = ?2
             WHERE sync_type = ?3",
            rusqlite::params![fmt_ts(at), fmt_ts(Utc::now()), sync_type.as_str()],
        )?;
        Ok(())
    }

    // --- listings ------------------------------------------------------------

    /// Upsert `records` by listing key and persist `cursor`, in one transaction.
    /// Returns the number of records written.
    pub fn commit_listings(&self, records: &[ListingRecord], cursor: &SyncCursor) -> Result<u64> {
        let now = fmt_ts(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_LISTING)?;
            for r in records {
                let media = serde_json::to_string(&r.media)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                stmt.execute(rusqlite::params![
                    r.listing_key,
                    r.list_price,
                    r.street_number,
                    r.street_name,
                    r.street_suffix,
                    r.unit_number,
                    r.city,
                    r.province,
                    r.postal_code,
                    r.standard_status,
                    r.property_type,
                    r.bedrooms,
                    r.bathrooms,
                    media,
                    r.modified_at.map(fmt_ts),
                    r.listed_at.map(fmt_ts),
                    now,
                ])?;
            }
        }
        write_cursor(&tx, cursor)?;
        tx.commit()?;
        debug!(count = records.len(), sync_type = %cursor.sync_type, "listings committed");
        Ok(records.len() as u64)
    }

    /// Replace the media of existing listings and persist `cursor`, in one
    /// transaction. With `skip_existing`, listings that already have media are
    /// never overwritten. Returns the number of listings changed.
    pub fn commit_media(
        &self,
        updates: &[(String, Vec<String>)],
        skip_existing: bool,
        cursor: &SyncCursor,
    ) -> Result<u64> {
        let now = fmt_ts(Utc::now());
        let sql = if skip_existing {
            "UPDATE listings SET media = ?1, synced_at = ?2
             WHERE listing_key = ?3 AND media = '[]'"
        } else {
            "UPDATE listings SET media = ?1, synced_at = ?2 WHERE listing_key = ?3"
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0u64;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for (key, media) in updates {
                let json = serde_json::to_string(media)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                changed += stmt.execute(rusqlite::params![json, now, key])? as u64;
            }
        }
        write_cursor(&tx, cursor)?;
        tx.commit()?;
        debug!(changed, "media committed");
        Ok(changed)
    }

    pub fn listing(&self, listing_key: &str) -> Result<Option<ListingRecord>> {
        let conn = self.conn()?;
        let sql = format!("{SELECT_LISTING} WHERE listing_key = ?1");
        match conn.query_row(&sql, [listing_key], row_to_listing) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn listing_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Keys `[offset, offset + limit)` of the local key space, ordered by key.
    pub fn listing_keys_slice(&self, offset: u64, limit: u32) -> Result<Vec<KeySlot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT listing_key, media != '[]' FROM listings
             ORDER BY listing_key LIMIT ?1 OFFSET ?2",
        )?;
        let slots = stmt
            .query_map(rusqlite::params![limit as i64, offset as i64], |row| {
                Ok(KeySlot {
                    listing_key: row.get(0)?,
                    has_media: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(slots)
    }

    // --- run log -------------------------------------------------------------

    /// Append a run log row and return its id.
    pub fn append_run_log(&self, log: &RunLog) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run_logs
             (sync_type, started_at, finished_at, records_fetched, records_upserted,
              error_count, status, offset_before, offset_after, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                log.sync_type.as_str(),
                fmt_ts(log.started_at),
                fmt_ts(log.finished_at),
                log.records_fetched as i64,
                log.records_upserted as i64,
                log.error_count as i64,
                log.status.to_string(),
                log.offset_before as i64,
                log.offset_after as i64,
                log.message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent runs across all sync types, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunLog>> {
        let conn = self.conn()?;
        let sql = format!("{SELECT_RUN_LOG} ORDER BY id DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map([limit as i64], row_to_run_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    // --- leases --------------------------------------------------------------

    /// Try to take the named lease for `ttl`. `None` means a live lease is
    /// held elsewhere.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>> {
        self.try_acquire_lease_at(name, holder, ttl, Utc::now())
    }

    /// [`Self::try_acquire_lease`] with an explicit clock reading.
    pub fn try_acquire_lease_at(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseGuard>> {
        lease::try_acquire(&self.db, name, holder, ttl, now)
    }

    /// Holder and expiry of the named lease, if one is recorded.
    pub fn lease_holder(&self, name: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let Some((holder, expires)) = lease::current_holder(&conn, name)? else {
            return Ok(None);
        };
        let expires = parse_ts(1, Some(expires))?.unwrap_or_else(Utc::now);
        Ok(Some((holder, expires)))
    }
}

fn read_cursor(conn: &Connection, sync_type: SyncType) -> Result<SyncCursor> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_cursors (sync_type, cursor_offset, last_success, updated_at)
         VALUES (?1, 0, 0, ?2)",
        rusqlite::params![sync_type.as_str(), fmt_ts(Utc::now())],
    )?;
    let cursor = conn.query_row(
        "SELECT cursor_offset, last_run_at, last_success, watermark, watermark_key
         FROM sync_cursors WHERE sync_type = ?1",
        [sync_type.as_str()],
        |row| {
            Ok(SyncCursor {
                sync_type,
                offset: row.get::<_, i64>(0)? as u64,
                last_run_at: parse_ts(1, row.get(1)?)?,
                last_success: row.get(2)?,
                watermark: parse_ts(3, row.get(3)?)?,
                watermark_key: row.get(4)?,
            })
        },
    )?;
    Ok(cursor)
}

fn write_cursor(conn: &Connection, cursor: &SyncCursor) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_cursors
         (sync_type, cursor_offset, last_run_at, last_success, watermark, watermark_key, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(sync_type) DO UPDATE SET
            cursor_offset = excluded.cursor_offset,
            last_run_at   = excluded.last_run_at,
            last_success  = excluded.last_success,
            watermark     = excluded.watermark,
            watermark_key = excluded.watermark_key,
            updated_at    = excluded.updated_at",
        rusqlite::params![
            cursor.sync_type.as_str(),
            cursor.offset as i64,
            cursor.last_run_at.map(fmt_ts),
            cursor.last_success,
            cursor.watermark.map(fmt_ts),
            cursor.watermark_key,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(())
}

fn row_to_listing(row: &Row<'_>) -> rusqlite::Result<ListingRecord> {
    let media_json: String = row.get(13)?;
    let media: Vec<String> =
        serde_json::from_str(&media_json).map_err(|e| conversion_err(13, e))?;
    Ok(ListingRecord {
        listing_key: row.get(0)?,
        list_price: row.get(1)?,
        street_number: row.get(2)?,
        street_name: row.get(3)?,
        street_suffix: row.get(4)?,
        unit_number: row.get(5)?,
        city: row.get(6)?,
        province: row.get(7)?,
        postal_code: row.get(8)?,
        standard_status: row.get(9)?,
        property_type: row.get(10)?,
        bedrooms: row.get(11)?,
        bathrooms: row.get(12)?,
        media,
        modified_at: parse_ts(14, row.get(14)?)?,
        listed_at: parse_ts(15, row.get(15)?)?,
    })
}

fn row_to_run_log(row: &Row<'_>) -> rusqlite::Result<RunLog> {
    let sync_type: SyncType = row
        .get::<_, String>(1)?
        .parse()
        .map_err(|e| conversion_err(1, e))?;
    let status: RunStatus = row
        .get::<_, String>(7)?
        .parse()
        .map_err(|e| conversion_err(7, e))?;
    Ok(RunLog {
        id: row.get(0)?,
        sync_type,
        started_at: parse_ts(2, row.get(2)?)?.unwrap_or_default(),
        finished_at: parse_ts(3, row.get(3)?)?.unwrap_or_default(),
        records_fetched: row.get::<_, i64>(4)? as u64,
        records_upserted: row.get::<_, i64>(5)? as u64,
        error_count: row.get::<_, i64>(6)? as u64,
        status,
        offset_before: row.get::<_, i64>(8)? as u64,
        offset_after: row.get::<_, i64>(9)? as u64,
        message: row.get(10)?,
    })
}
