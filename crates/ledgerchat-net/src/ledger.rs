//! Ledger connection trait.
//!
//! The ledger itself (consensus, contract execution) is external. This
//! module defines the boundary the rest of the client talks to: typed reads,
//! signed writes that return receipts, and a reconnect hook used when the
//! connection's transient-fault guard has tripped.

use async_trait::async_trait;
use thiserror::Error;

use ledgerchat_shared::protocol::{LedgerQuery, LedgerReply, Receipt, SignedTransaction};

/// Marker the ledger node uses when its own fault guard is open.
pub const CIRCUIT_OPEN_MARKER: &str = "circuit breaker is open";

/// Errors surfaced by a ledger connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transient fault: the connection's guard tripped. Safe to reset and retry.
    #[error("Transient ledger fault: {0}")]
    Transient(String),

    /// The ledger executed and rejected the call. Never retried.
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    /// Connection-level failure that is not a tripped guard.
    #[error("Ledger transport error: {0}")]
    Transport(String),

    /// The reply variant did not match the query.
    #[error("Unexpected reply to {method}")]
    UnexpectedReply { method: &'static str },
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a raw error message coming off the wire.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains(CIRCUIT_OPEN_MARKER) {
            Self::Transient(message)
        } else {
            Self::Transport(message)
        }
    }

    pub fn circuit_open() -> Self {
        Self::Transient(CIRCUIT_OPEN_MARKER.to_string())
    }
}

/// A connection to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Unsigned read.
    async fn call(&self, query: LedgerQuery) -> Result<LedgerReply, LedgerError>;

    /// Submit a signed transaction and wait for its receipt.
    async fn submit(&self, tx: SignedTransaction) -> Result<Receipt, LedgerError>;

    /// Tear down and re-establish the connection.
    async fn reconnect(&self) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_circuit_breaker_messages() {
        assert!(LedgerError::from_message("Execution prevented because the circuit breaker is open")
            .is_transient());
        assert!(LedgerError::from_message("CIRCUIT BREAKER IS OPEN").is_transient());
        assert!(!LedgerError::from_message("connection refused").is_transient());
        assert!(LedgerError::circuit_open().is_transient());
    }
}
