use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert or overwrite a value.
    pub fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(key, size = value.len(), "kv put");
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// Store a value as JSON.
    pub fn kv_put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv_put(key, &bytes)
    }

    pub fn kv_get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv_get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;

    #[test]
    fn put_get_overwrite_delete() {
        let db = Database::open_in_memory().unwrap();

        assert_eq!(db.kv_get("backup_0xabc").unwrap(), None);

        db.kv_put("backup_0xabc", b"one").unwrap();
        db.kv_put("backup_0xabc", b"two").unwrap();
        assert_eq!(db.kv_get("backup_0xabc").unwrap(), Some(b"two".to_vec()));

        assert!(db.kv_delete("backup_0xabc").unwrap());
        assert!(!db.kv_delete("backup_0xabc").unwrap());
        assert_eq!(db.kv_get("backup_0xabc").unwrap(), None);
    }

    #[test]
    fn json_values() {
        let db = Database::open_in_memory().unwrap();
        db.kv_put_json("isAuthenticated", &true).unwrap();
        assert_eq!(db.kv_get_json::<bool>("isAuthenticated").unwrap(), Some(true));
        assert_eq!(db.kv_get_json::<bool>("missing").unwrap(), None);
    }
}
