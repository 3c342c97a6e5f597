//! v001 -- Initial schema creation.
//!
//! Creates the three local tables: `kv`, `content_cache` and
//! `fallback_index`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Key-value surface (session flags, keystore, local fallbacks)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      BLOB NOT NULL,
    updated_at TEXT NOT NULL                  -- RFC-3339
);

-- ----------------------------------------------------------------
-- Resolved content, keyed by content address
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS content_cache (
    address    TEXT PRIMARY KEY NOT NULL,
    bytes      BLOB NOT NULL,
    cached_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Content that only exists in local fallback storage
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS fallback_index (
    address    TEXT PRIMARY KEY NOT NULL,     -- local-<blake3 hex>
    kv_key     TEXT NOT NULL,                 -- e.g. backup_0x...
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fallback_index_kv_key ON fallback_index(kv_key);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
