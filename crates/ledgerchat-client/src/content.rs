//! Content Store Gateway: the remote content network with a local fallback.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use ledgerchat_net::{ContentError, ContentStore};
use ledgerchat_shared::ContentAddress;

use crate::error::{ClientError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::session::{lock_db, SharedDatabase};

/// Where a payload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Durability {
    /// Accepted by the content network.
    Replicated,
    /// Only in this device's local storage.
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub address: ContentAddress,
    pub durability: Durability,
}

impl StoredContent {
    pub fn is_local_only(&self) -> bool {
        self.durability == Durability::LocalOnly
    }
}

pub struct ContentGateway {
    store: Arc<dyn ContentStore>,
    db: SharedDatabase,
    events: EventBus,
}

impl ContentGateway {
    pub fn new(store: Arc<dyn ContentStore>, db: SharedDatabase, events: EventBus) -> Self {
        Self { store, db, events }
    }

    /// Store `bytes` on the content network only.
    pub async fn put(&self, bytes: &[u8]) -> Result<ContentAddress> {
        let address = self.store.put(bytes).await?;
        lock_db(&self.db).cache_content(&address, bytes)?;
        debug!(address = %address, size = bytes.len(), "content stored");
        Ok(address)
    }

    /// Store `bytes`, persisting them under `local_key` when the network is
    /// unreachable. The returned durability says which path was taken.
    pub async fn put_with_fallback(&self, bytes: &[u8], local_key: &str) -> Result<StoredContent> {
        match self.store.put(bytes).await {
            Ok(address) => {
                lock_db(&self.db).cache_content(&address, bytes)?;
                debug!(address = %address, size = bytes.len(), "content stored");
                Ok(StoredContent {
                    address,
                    durability: Durability::Replicated,
                })
            }
            Err(e @ (ContentError::Unavailable(_) | ContentError::InvalidResponse(_))) => {
                warn!(error = %e, kv_key = local_key, "content store unreachable, using local fallback");
                let address = ContentAddress::local_for(bytes);
                {
                    let db = lock_db(&self.db);
                    db.kv_put(local_key, bytes)?;
                    db.record_fallback(&address, local_key)?;
                }
                self.events.emit(SessionEvent::DurabilityDegraded {
                    address: address.clone(),
                    kv_key: local_key.to_string(),
                });
                Ok(StoredContent {
                    address,
                    durability: Durability::LocalOnly,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve an address: cache, then the network, then local fallback.
    pub async fn get(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        if let Some(bytes) = lock_db(&self.db).cached_content(address)? {
            debug!(address = %address, "content cache hit");
            return Ok(bytes);
        }

        if address.is_local() {
            return self
                .local_content(address)?
                .ok_or_else(|| ClientError::ContentNotFound(address.to_string()));
        }

        match self.store.get(address).await {
            Ok(bytes) => {
                lock_db(&self.db).cache_content(address, &bytes)?;
                Ok(bytes)
            }
            Err(e) => match self.local_content(address)? {
                Some(bytes) => {
                    debug!(address = %address, error = %e, "resolved from local fallback");
                    Ok(bytes)
                }
                None => Err(e.into()),
            },
        }
    }

    /// Whether `address` can be resolved from this device without the network.
    pub fn has_local(&self, address: &ContentAddress) -> Result<bool> {
        if lock_db(&self.db).cached_content(address)?.is_some() {
            return Ok(true);
        }
        Ok(self.local_content(address)?.is_some())
    }

    /// Bytes currently held under a fallback key.
    pub(crate) fn local_entry(&self, local_key: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock_db(&self.db).kv_get(local_key)?)
    }

    /// Put a fallback key back to what it held before a write that was never
    /// bound anywhere.
    pub(crate) fn restore_local(&self, local_key: &str, previous: Option<Vec<u8>>) -> Result<()> {
        let db = lock_db(&self.db);
        match previous {
            Some(bytes) => db.kv_put(local_key, &bytes)?,
            None => {
                db.kv_delete(local_key)?;
            }
        }
        debug!(kv_key = local_key, "local fallback restored");
        Ok(())
    }

    // A fallback key is reused across writes, so the bytes it holds now may
    // belong to a later address than the one asked for.
    fn local_content(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = lock_db(&self.db).local_content(address)? else {
            return Ok(None);
        };
        if address.is_local() && ContentAddress::local_for(&bytes) != *address {
            warn!(address = %address, "local fallback holds newer content");
            return Ok(None);
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerchat_net::MemoryContentStore;
    use ledgerchat_store::Database;
    use std::sync::Mutex;

    fn gateway(store: Arc<MemoryContentStore>) -> (ContentGateway, EventBus) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let events = EventBus::new();
        (ContentGateway::new(store, db, events.clone()), events)
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = Arc::new(MemoryContentStore::new());
        let (content, _) = gateway(store);
        let a = content.put(b"same bytes").await.unwrap();
        let b = content.put(b"same bytes").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(content.get(&a).await.unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn plain_put_reports_unavailable() {
        let store = Arc::new(MemoryContentStore::unavailable());
        let (content, _) = gateway(store);
        assert!(matches!(
            content.put(b"x").await,
            Err(ClientError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn fallback_is_reported_and_resolvable() {
        let store = Arc::new(MemoryContentStore::unavailable());
        let (content, events) = gateway(store.clone());
        let mut rx = events.subscribe();

        let stored = content
            .put_with_fallback(b"offline payload", "backup_0xabc")
            .await
            .unwrap();
        assert!(stored.is_local_only());
        assert!(stored.address.is_local());

        match rx.recv().await.unwrap() {
            SessionEvent::DurabilityDegraded { address, kv_key } => {
                assert_eq!(address, stored.address);
                assert_eq!(kv_key, "backup_0xabc");
            }
            other => panic!("unexpected {other:?}"),
        }

        store.set_available(true);
        assert_eq!(content.get(&stored.address).await.unwrap(), b"offline payload");
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn replicated_put_skips_fallback() {
        let store = Arc::new(MemoryContentStore::new());
        let (content, _) = gateway(store.clone());
        let stored = content.put_with_fallback(b"online", "message_x").await.unwrap();
        assert_eq!(stored.durability, Durability::Replicated);
        assert!(!stored.address.is_local());
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn cached_content_survives_outage() {
        let store = Arc::new(MemoryContentStore::new());
        let (content, _) = gateway(store.clone());
        let address = content.put(b"cached").await.unwrap();

        store.set_available(false);
        assert_eq!(content.get(&address).await.unwrap(), b"cached");
        assert!(content.has_local(&address).unwrap());
    }

    #[tokio::test]
    async fn overwritten_fallback_does_not_resolve_old_address() {
        let store = Arc::new(MemoryContentStore::unavailable());
        let (content, _) = gateway(store);
        let first = content.put_with_fallback(b"first", "backup_0xabc").await.unwrap();
        let second = content.put_with_fallback(b"second", "backup_0xabc").await.unwrap();

        assert_eq!(content.get(&second.address).await.unwrap(), b"second");
        assert!(matches!(
            content.get(&first.address).await,
            Err(ClientError::ContentNotFound(_))
        ));
        assert!(!content.has_local(&first.address).unwrap());
    }

    #[tokio::test]
    async fn restore_local_rewinds_a_fallback_write() {
        let store = Arc::new(MemoryContentStore::unavailable());
        let (content, _) = gateway(store);
        let first = content.put_with_fallback(b"first", "backup_0xabc").await.unwrap();

        let previous = content.local_entry("backup_0xabc").unwrap();
        content.put_with_fallback(b"second", "backup_0xabc").await.unwrap();
        content.restore_local("backup_0xabc", previous).unwrap();
        assert_eq!(content.get(&first.address).await.unwrap(), b"first");

        content.restore_local("backup_0xabc", None).unwrap();
        assert!(content.local_entry("backup_0xabc").unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_local_address_is_not_found() {
        let store = Arc::new(MemoryContentStore::new());
        let (content, _) = gateway(store);
        let address = ContentAddress::local_for(b"elsewhere");
        assert!(matches!(
            content.get(&address).await,
            Err(ClientError::ContentNotFound(_))
        ));
    }
}
