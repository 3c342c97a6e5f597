//! # ledgerchat-shared
//!
//! Types shared by every ledgerchat crate: account addresses and ledger ids,
//! key material derived from recovery phrases, payload encryption helpers and
//! the ledger wire protocol (transactions, receipts, records, reads).

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::Identity;
pub use types::*;
