//! # ledgerchat-client
//!
//! Client-side synchronization and delivery engine. A [`Session`] bundles
//! the credential vault, the content gateway and the three engines
//! (relationships, messaging, recovery) on top of one ledger connection.

pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod recovery;
pub mod relationships;
pub mod session;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ClientConfig;
pub use content::{ContentGateway, Durability, StoredContent};
pub use error::{ClientError, Result};
pub use events::{Conversation, EventBus, SessionEvent};
pub use messaging::{
    ConversationFeed, Message, MessageEngine, PlaceholderReason, PollingFeed, SentMessage, ViewToken,
};
pub use recovery::{AccountSnapshot, BackupPayload, RecoveryEngine, StoredBackup};
pub use relationships::{FriendSummary, GroupSummary, PendingRequest, RelationshipEngine};
pub use session::Session;
pub use vault::{CredentialVault, SigningSession};
