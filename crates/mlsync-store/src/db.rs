use rusqlite::{Connection, Result};

/// Initialise sync tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_listings_table(conn)?;
    create_cursors_table(conn)?;
    create_run_logs_table(conn)?;
    create_leases_table(conn)?;
    Ok(())
}

/// `media` holds a JSON array of image URLs; `'[]'` means none fetched yet.
fn create_listings_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS listings (
            listing_key     TEXT NOT NULL PRIMARY KEY,
            list_price      REAL,
            street_number   TEXT,
            street_name     TEXT,
            street_suffix   TEXT,
            unit_number     TEXT,
            city            TEXT,
            province        TEXT,
            postal_code     TEXT,
            standard_status TEXT,
            property_type   TEXT,
            bedrooms        INTEGER,
            bathrooms       INTEGER,
            media           TEXT NOT NULL DEFAULT '[]',
            modified_at     TEXT,
            listed_at       TEXT,
            first_seen_at   TEXT NOT NULL,
            synced_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_listings_modified
            ON listings(modified_at);",
    )
}

fn create_cursors_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_cursors (
            sync_type     TEXT    NOT NULL PRIMARY KEY,
            cursor_offset INTEGER NOT NULL DEFAULT 0,
            last_run_at   TEXT,
            last_success  INTEGER NOT NULL DEFAULT 0,
            watermark     TEXT,
            watermark_key TEXT,
            updated_at    TEXT    NOT NULL
        );",
    )?;
    add_column_if_missing(conn, "sync_cursors", "watermark_key", "TEXT")
}

/// Databases created before a column existed get it added in place.
fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>>>()?
        .iter()
        .any(|name| name == column);
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
    }
    Ok(())
}

fn create_run_logs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS run_logs (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_type        TEXT    NOT NULL,
            started_at       TEXT    NOT NULL,
            finished_at      TEXT    NOT NULL,
            records_fetched  INTEGER NOT NULL DEFAULT 0,
            records_upserted INTEGER NOT NULL DEFAULT 0,
            error_count      INTEGER NOT NULL DEFAULT 0,
            status           TEXT    NOT NULL,
            offset_before    INTEGER NOT NULL DEFAULT 0,
            offset_after     INTEGER NOT NULL DEFAULT 0,
            message          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_run_logs_type
            ON run_logs(sync_type, started_at DESC);",
    )
}

/// Leases live in the shared database so every process pointed at the same
/// file sees them. `expires_at` lets a crashed holder's lease be taken over.
fn create_leases_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_leases (
            name        TEXT NOT NULL PRIMARY KEY,
            holder      TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        );",
    )
}
