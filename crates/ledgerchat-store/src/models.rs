//! Domain model structs persisted in the local database.

use chrono::{DateTime, Utc};
use ledgerchat_shared::{Address, ContentAddress};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Cached "who is logged in" record, stored under the `currentUser` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedSession {
    pub address: Address,
    /// Last known username, display only.
    pub username: Option<String>,
    pub authenticated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

/// Signing secret sealed under a PIN-derived key (nonce || ciphertext).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedKeystore {
    pub address: Address,
    pub sealed_secret: Vec<u8>,
    pub sealed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Local fallback
// ---------------------------------------------------------------------------

/// A payload that could not be replicated and only lives in the kv table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackEntry {
    pub address: ContentAddress,
    pub kv_key: String,
    pub created_at: DateTime<Utc>,
}
