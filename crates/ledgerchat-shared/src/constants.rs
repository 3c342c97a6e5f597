/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Address size in bytes (truncated BLAKE3 of the verifying key)
pub const ADDRESS_SIZE: usize = 20;

/// Maximum message plaintext size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Username bounds (characters, after trimming)
pub const MAX_USERNAME_LEN: usize = 32;

/// Status line bound (characters)
pub const MAX_STATUS_LEN: usize = 64;

/// Group name bound (characters, after trimming)
pub const MAX_GROUP_NAME_LEN: usize = 64;

/// PIN bounds (ASCII digits)
pub const MIN_PIN_LEN: usize = 4;
pub const MAX_PIN_LEN: usize = 12;

/// Extra attempts allowed after a transient ledger fault (3 attempts total).
pub const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Soft (non-transient) transport failures before the circuit opens
pub const DEFAULT_SOFT_FAILURE_THRESHOLD: u32 = 3;

/// Default IPFS-compatible HTTP API endpoint
pub const DEFAULT_CONTENT_STORE_URL: &str = "http://localhost:5001";

/// Default conversation polling interval in seconds
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;

/// Placeholder shown when a peer's display name cannot be resolved
pub const UNKNOWN_USERNAME: &str = "Unknown user";

/// Placeholder body for pointers whose content cannot be resolved or decrypted
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[undecryptable message]";

/// Local key-value keys
pub const KV_IS_AUTHENTICATED: &str = "isAuthenticated";
pub const KV_CURRENT_USER: &str = "currentUser";
pub const KV_KEYSTORE: &str = "keystore";
pub const KV_BACKUP_PREFIX: &str = "backup_";
pub const KV_BACKUP_DATA_PREFIX: &str = "backup_data_";
pub const KV_MESSAGE_PREFIX: &str = "message_";

/// Prefix of content addresses that only exist in local fallback storage
pub const LOCAL_ADDRESS_PREFIX: &str = "local-";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_PHRASE_KEY: &str = "ledgerchat-phrase-key-v1";
pub const KDF_CONTEXT_EXCHANGE_KEY: &str = "ledgerchat-x25519-key-v1";
pub const KDF_CONTEXT_CONVERSATION_KEY: &str = "ledgerchat-conversation-key-v1";
pub const KDF_CONTEXT_GROUP_KEY: &str = "ledgerchat-group-key-v1";
pub const KDF_CONTEXT_PIN_HASH: &str = "ledgerchat-pin-hash-v1";
pub const KDF_CONTEXT_PIN_KEY: &str = "ledgerchat-pin-key-v1";

/// Argon2id cost for PIN hashing and PIN keys (19 MiB, 2 passes)
pub const PIN_KDF_M_COST: u32 = 19_456;
pub const PIN_KDF_T_COST: u32 = 2;
pub const PIN_KDF_P_COST: u32 = 1;
