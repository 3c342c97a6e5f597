//! In-process content store.
//!
//! Addresses are BLAKE3 digests of the stored bytes. Availability can be
//! toggled to simulate an unreachable network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use ledgerchat_shared::types::ContentAddress;

use crate::content::{ContentError, ContentStore};

#[derive(Debug)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<ContentAddress, Vec<u8>>>,
    available: AtomicBool,
    puts: AtomicUsize,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            puts: AtomicUsize::new(0),
        }
    }

    /// A store that rejects every request.
    pub fn unavailable() -> Self {
        let store = Self::new();
        store.set_available(false);
        store
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful puts so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), ContentError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ContentError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentAddress, ContentError> {
        self.check_available()?;
        let address = ContentAddress::new(blake3::hash(bytes).to_hex().to_string());
        self.blobs
            .lock()
            .map_err(|_| ContentError::Unavailable("memory store poisoned".into()))?
            .insert(address.clone(), bytes.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, ContentError> {
        self.check_available()?;
        self.blobs
            .lock()
            .map_err(|_| ContentError::Unavailable("memory store poisoned".into()))?
            .get(address)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(address.clone()))
    }
}
