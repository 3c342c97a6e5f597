use thiserror::Error;

use ledgerchat_net::{ContentError, GatewayError, RetryReason};
use ledgerchat_shared::{Address, CryptoError, IdentityError, ProtocolError};
use ledgerchat_store::StoreError;

/// Every failure a session operation can surface.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Rejected before any ledger call; never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The ledger kept reporting transient faults through every retry.
    #[error("Ledger unavailable: {method} failed after {attempts} attempts ({reason})")]
    TransientLedgerFault {
        method: &'static str,
        attempts: u32,
        reason: RetryReason,
    },

    /// The ledger executed and rejected the operation.
    #[error("Ledger rejected {method}: {reason}")]
    PermanentLedgerFault { method: &'static str, reason: String },

    /// A relationship write could not be completed after bounded retry.
    #[error("Relationship operation failed: {reason}")]
    RelationshipOperationFailed { reason: String },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Content store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Invalid recovery phrase: {0}")]
    InvalidRecoveryPhrase(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    /// The backup only exists in another device's local storage.
    #[error("Backup for {address} was stored locally on another device and cannot be recovered here")]
    BackupNotRecoverableHere { address: Address },

    #[error("No account registered for {0}")]
    AccountNotFound(Address),

    #[error("No unlocked signing session")]
    NotAuthenticated,

    #[error("No sealed keystore on this device")]
    NoLocalKeystore,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Encoding error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientLedgerFault { .. })
    }
}

impl From<GatewayError> for ClientError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::RetryExhausted {
                method,
                attempts,
                reason,
                ..
            } => Self::TransientLedgerFault {
                method,
                attempts,
                reason,
            },
            GatewayError::Reverted { method, reason } => Self::PermanentLedgerFault { method, reason },
            other => Self::Ledger(other.to_string()),
        }
    }
}

impl From<ContentError> for ClientError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::NotFound(address) => Self::ContentNotFound(address.to_string()),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<CryptoError> for ClientError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed => Self::DecryptionFailure,
            other => Self::Protocol(ProtocolError::Serialization(other.to_string())),
        }
    }
}

impl From<IdentityError> for ClientError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::InvalidPhrase(msg) => Self::InvalidRecoveryPhrase(msg),
            IdentityError::InvalidAddress(addr) => {
                Self::InvalidArgument(format!("malformed address: {addr:?}"))
            }
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
