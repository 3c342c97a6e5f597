use chrono::{DateTime, Utc};
use ledgerchat_shared::ContentAddress;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::FallbackEntry;

impl Database {
    // Content is immutable per address, so a second insert is a no-op.
    pub fn cache_content(&self, address: &ContentAddress, bytes: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO content_cache (address, bytes, cached_at) VALUES (?1, ?2, ?3)",
            params![address.as_str(), bytes, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn cached_content(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        let bytes = self
            .conn()
            .query_row(
                "SELECT bytes FROM content_cache WHERE address = ?1",
                params![address.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(bytes)
    }

    /// Record that `address` is only available under `kv_key`.
    pub fn record_fallback(&self, address: &ContentAddress, kv_key: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO fallback_index (address, kv_key, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET kv_key = excluded.kv_key",
            params![address.as_str(), kv_key, Utc::now().to_rfc3339()],
        )?;
        tracing::warn!(address = %address, kv_key, "content persisted to local fallback only");
        Ok(())
    }

    pub fn fallback_entry(&self, address: &ContentAddress) -> Result<FallbackEntry> {
        self.conn()
            .query_row(
                "SELECT address, kv_key, created_at FROM fallback_index WHERE address = ?1",
                params![address.as_str()],
                row_to_fallback,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn list_fallbacks(&self) -> Result<Vec<FallbackEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT address, kv_key, created_at FROM fallback_index ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_fallback)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Resolve a locally persisted payload by its address.
    pub fn local_content(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        match self.fallback_entry(address) {
            Ok(entry) => self.kv_get(&entry.kv_key),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn row_to_fallback(row: &rusqlite::Row<'_>) -> rusqlite::Result<FallbackEntry> {
    let address: String = row.get(0)?;
    let kv_key: String = row.get(1)?;
    let ts_str: String = row.get(2)?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(FallbackEntry {
        address: ContentAddress::new(address),
        kv_key,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_is_first_write_wins() {
        let db = Database::open_in_memory().unwrap();
        let addr = ContentAddress::new("bafy-test");

        assert_eq!(db.cached_content(&addr).unwrap(), None);
        db.cache_content(&addr, b"first").unwrap();
        db.cache_content(&addr, b"second").unwrap();
        assert_eq!(db.cached_content(&addr).unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn fallback_resolves_through_kv() {
        let db = Database::open_in_memory().unwrap();
        let payload = b"sealed backup bytes";
        let addr = ContentAddress::local_for(payload);

        db.kv_put("backup_0x01", payload).unwrap();
        db.record_fallback(&addr, "backup_0x01").unwrap();

        assert_eq!(db.local_content(&addr).unwrap(), Some(payload.to_vec()));
        assert_eq!(db.fallback_entry(&addr).unwrap().kv_key, "backup_0x01");
        assert_eq!(db.list_fallbacks().unwrap().len(), 1);
    }

    #[test]
    fn unknown_fallback_is_none() {
        let db = Database::open_in_memory().unwrap();
        let addr = ContentAddress::local_for(b"elsewhere");
        assert!(matches!(db.fallback_entry(&addr), Err(StoreError::NotFound)));
        assert_eq!(db.local_content(&addr).unwrap(), None);
    }
}
