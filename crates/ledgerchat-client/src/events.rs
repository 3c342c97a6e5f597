use serde::Serialize;
use tokio::sync::broadcast;

use ledgerchat_shared::types::{Address, ConnectionState, ContentAddress, GroupId};

/// Conversation key: a direct chat with one peer, or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Conversation {
    Direct(Address),
    Group(GroupId),
}

impl std::fmt::Display for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(peer) => write!(f, "direct:{}", peer.short()),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// Notifications published by a session.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    /// A payload could only be persisted locally.
    DurabilityDegraded {
        address: ContentAddress,
        kv_key: String,
    },
    Unlocked {
        address: Address,
    },
    Locked,
    ConversationUpdated {
        conversation: Conversation,
        messages: usize,
    },
}

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error.
        if self.tx.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.tx.send(event) {
            tracing::error!(error = %e, "Failed to emit session event");
        }
    }
}
