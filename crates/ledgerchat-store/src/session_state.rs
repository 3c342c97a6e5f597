use ledgerchat_shared::constants::{KV_CURRENT_USER, KV_IS_AUTHENTICATED, KV_KEYSTORE};

use crate::database::Database;
use crate::error::Result;
use crate::models::{CachedSession, SealedKeystore};

impl Database {
    /// Mark `session` as the logged-in account.
    pub fn save_session(&self, session: &CachedSession) -> Result<()> {
        self.kv_put_json(KV_IS_AUTHENTICATED, &true)?;
        self.kv_put_json(KV_CURRENT_USER, session)
    }

    /// The cached session, if the authenticated flag is set.
    pub fn load_session(&self) -> Result<Option<CachedSession>> {
        let authenticated = self
            .kv_get_json::<bool>(KV_IS_AUTHENTICATED)?
            .unwrap_or(false);
        if !authenticated {
            return Ok(None);
        }
        self.kv_get_json(KV_CURRENT_USER)
    }

    pub fn clear_session(&self) -> Result<()> {
        self.kv_delete(KV_IS_AUTHENTICATED)?;
        self.kv_delete(KV_CURRENT_USER)?;
        Ok(())
    }

    pub fn save_keystore(&self, keystore: &SealedKeystore) -> Result<()> {
        self.kv_put_json(KV_KEYSTORE, keystore)
    }

    pub fn load_keystore(&self) -> Result<Option<SealedKeystore>> {
        self.kv_get_json(KV_KEYSTORE)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ledgerchat_shared::Address;

    use super::*;

    #[test]
    fn session_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.load_session().unwrap(), None);

        let session = CachedSession {
            address: Address([9u8; 20]),
            username: Some("alice".into()),
            authenticated_at: Utc::now(),
        };
        db.save_session(&session).unwrap();
        assert_eq!(db.load_session().unwrap(), Some(session));

        db.clear_session().unwrap();
        assert_eq!(db.load_session().unwrap(), None);
        assert_eq!(db.kv_get(KV_CURRENT_USER).unwrap(), None);
    }

    #[test]
    fn keystore_survives_logout() {
        let db = Database::open_in_memory().unwrap();
        let keystore = SealedKeystore {
            address: Address([1u8; 20]),
            sealed_secret: vec![1, 2, 3],
            sealed_at: Utc::now(),
        };
        db.save_keystore(&keystore).unwrap();
        db.clear_session().unwrap();
        assert_eq!(db.load_keystore().unwrap(), Some(keystore));
    }
}
