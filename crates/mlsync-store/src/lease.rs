use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::fmt_ts;

/// A held lease. [`LeaseGuard::release`] or dropping the guard releases the
/// lease, but only while this holder still owns it: a lease that expired and
/// was taken over by another holder is left alone.
///
/// Release is a blocking single-row DELETE on the shared connection, bounded
/// by its busy timeout. Async callers run it inline on the worker thread.
pub struct LeaseGuard {
    db: Arc<Mutex<Connection>>,
    name: String,
    holder: String,
    expires_at: DateTime<Utc>,
    released: bool,
}

impl LeaseGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Release now and report the result. `Ok(false)` means another holder
    /// had already taken the lease over.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.delete()
    }

    fn delete(&self) -> Result<bool> {
        let conn = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        let n = conn.execute(
            "DELETE FROM sync_leases WHERE name = ?1 AND holder = ?2",
            rusqlite::params![self.name, self.holder],
        )?;
        Ok(n > 0)
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.delete() {
            Ok(false) => warn!(lease = %self.name, holder = %self.holder, "lease was taken over before release"),
            Ok(true) => debug!(lease = %self.name, holder = %self.holder, "lease released"),
            Err(e) => warn!(lease = %self.name, "lease release failed: {e}"),
        }
    }
}

/// Take `name` for `holder` unless a live lease exists. An expired lease is
/// overwritten in the same statement, so the check and the take are atomic.
pub(crate) fn try_acquire(
    db: &Arc<Mutex<Connection>>,
    name: &str,
    holder: &str,
    ttl: std::time::Duration,
    now: DateTime<Utc>,
) -> Result<Option<LeaseGuard>> {
    let ttl = Duration::from_std(ttl).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let expires_at = now + ttl;

    let changed = {
        let conn = db.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO sync_leases (name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE sync_leases.expires_at <= excluded.acquired_at",
            rusqlite::params![name, holder, fmt_ts(now), fmt_ts(expires_at)],
        )?
    };

    if changed == 0 {
        debug!(lease = %name, "lease held by another holder");
        return Ok(None);
    }

    debug!(lease = %name, %holder, expires_at = %expires_at, "lease acquired");
    Ok(Some(LeaseGuard {
        db: Arc::clone(db),
        name: name.to_string(),
        holder: holder.to_string(),
        expires_at,
        released: false,
    }))
}

/// Current holder and expiry of `name`, if any row exists.
pub(crate) fn current_holder(
    conn: &Connection,
    name: &str,
) -> Result<Option<(String, String)>> {
    let row = conn.query_row(
        "SELECT holder, expires_at FROM sync_leases WHERE name = ?1",
        [name],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    );
    match row {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
