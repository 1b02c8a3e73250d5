use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// `armed_at` is when the trigger was first registered; it stands in for
/// `last_fired` until the trigger has fired once.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_triggers (
            name          TEXT    NOT NULL PRIMARY KEY,
            sync_type     TEXT    NOT NULL,
            schedule      TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            run_limit     INTEGER NOT NULL,
            skip_existing INTEGER NOT NULL DEFAULT 0,
            armed_at      TEXT    NOT NULL,
            last_fired    TEXT,               -- RFC 3339 or NULL
            next_run      TEXT,               -- RFC 3339 or NULL
            updated_at    TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
