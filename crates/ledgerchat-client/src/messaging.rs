//! Message Synchronization Engine.
//!
//! Sending stores the encrypted envelope through the content gateway and
//! records a pointer on the ledger. Syncing pulls the pointer set for one
//! conversation, resolves and decrypts every pointer, and orders the result
//! by `(timestamp, id)`. Pointers that cannot be resolved or decrypted stay
//! in the log as placeholders so positions never shift between syncs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ledgerchat_shared::constants::{KV_MESSAGE_PREFIX, MAX_MESSAGE_SIZE, UNDECRYPTABLE_PLACEHOLDER};
use ledgerchat_shared::crypto::{self, SymmetricKey};
use ledgerchat_shared::protocol::{MessageEnvelope, MessagePointer, MessageTarget, Transaction};
use ledgerchat_shared::types::{Address, ContentAddress, GroupId, MessageId, MessageType};

use crate::content::Durability;
use crate::error::{ClientError, Result};
use crate::events::{Conversation, SessionEvent};
use crate::session::SessionCore;

/// Why a message body is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaceholderReason {
    /// The content could not be fetched (store miss or outage).
    Unresolvable,
    /// The content was fetched but did not decrypt or parse.
    Undecryptable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Address,
    pub conversation: Conversation,
    pub message_type: MessageType,
    pub content: String,
    pub placeholder: Option<PlaceholderReason>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn is_placeholder(&self) -> bool {
        self.placeholder.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub pointer: MessagePointer,
    pub durability: Durability,
}

/// Handle for one open conversation view. A sync started under a token
/// that has since been replaced or closed is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewToken {
    conversation: Conversation,
    generation: u64,
}

impl ViewToken {
    pub fn conversation(&self) -> Conversation {
        self.conversation
    }
}

#[derive(Debug, Clone)]
struct CachedLog {
    ids: Vec<MessageId>,
    messages: Vec<Message>,
}

pub struct MessageEngine {
    core: Arc<SessionCore>,
    // Pointers are immutable once on the ledger.
    pointers: Mutex<HashMap<MessageId, MessagePointer>>,
    logs: Mutex<HashMap<(Address, Conversation), CachedLog>>,
    views: Mutex<HashMap<Conversation, u64>>,
    next_view: AtomicU64,
}

impl MessageEngine {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self {
            core,
            pointers: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            next_view: AtomicU64::new(1),
        }
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Send an encrypted direct message.
    pub async fn send_message(
        &self,
        receiver: Address,
        plaintext: &str,
        message_type: MessageType,
    ) -> Result<SentMessage> {
        self.send_message_with(receiver, plaintext, message_type, true)
            .await
    }

    /// Send a direct message; with `encrypt == false` the body rides inline
    /// in the pointer.
    pub async fn send_message_with(
        &self,
        receiver: Address,
        plaintext: &str,
        message_type: MessageType,
        encrypt: bool,
    ) -> Result<SentMessage> {
        check_size(plaintext)?;
        let signer = self.core.signer()?;
        let me = signer.address();

        let (content_address, durability) = if encrypt {
            let peer = self.core.gateway.user(receiver).await?.ok_or_else(|| {
                ClientError::InvalidArgument(format!("{receiver} is not a registered user"))
            })?;
            let key = signer.conversation_key(&receiver, &peer.public_key);
            self.seal(&key, plaintext, &me).await?
        } else {
            (ContentAddress::new(plaintext), Durability::Replicated)
        };

        let receipt = self
            .core
            .submit(Transaction::SendMessage {
                receiver,
                message_type,
                content_address,
                is_encrypted: encrypt,
            })
            .await?;

        let sent = self.sent_pointer(receipt.message_id(), durability).await?;
        self.invalidate(me, Conversation::Direct(receiver));
        info!(message = %sent.pointer.id, to = %receiver.short(), encrypted = encrypt, "message sent");
        Ok(sent)
    }

    /// Send an encrypted message to every member of a group.
    pub async fn send_group_message(
        &self,
        group_id: GroupId,
        plaintext: &str,
        message_type: MessageType,
    ) -> Result<SentMessage> {
        self.send_group_message_with(group_id, plaintext, message_type, true)
            .await
    }

    /// Group counterpart of [`send_message_with`](Self::send_message_with).
    pub async fn send_group_message_with(
        &self,
        group_id: GroupId,
        plaintext: &str,
        message_type: MessageType,
        encrypt: bool,
    ) -> Result<SentMessage> {
        check_size(plaintext)?;
        let signer = self.core.signer()?;
        let me = signer.address();

        let group = self
            .core
            .gateway
            .group(group_id)
            .await?
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown group {group_id}")))?;
        let (content_address, durability) = if encrypt {
            let key = crypto::derive_group_key(group.id, &group.owner);
            self.seal(&key, plaintext, &me).await?
        } else {
            (ContentAddress::new(plaintext), Durability::Replicated)
        };

        let receipt = self
            .core
            .submit(Transaction::SendGroupMessage {
                group_id,
                message_type,
                content_address,
                is_encrypted: encrypt,
            })
            .await?;

        let sent = self.sent_pointer(receipt.message_id(), durability).await?;
        self.invalidate(me, Conversation::Group(group_id));
        info!(message = %sent.pointer.id, group = %group_id, encrypted = encrypt, "group message sent");
        Ok(sent)
    }

    async fn seal(
        &self,
        key: &SymmetricKey,
        plaintext: &str,
        sender: &Address,
    ) -> Result<(ContentAddress, Durability)> {
        let envelope = MessageEnvelope::new(plaintext, sender).to_bytes()?;
        let ciphertext = crypto::encrypt(key, &envelope)?;
        let local_key = format!("{KV_MESSAGE_PREFIX}{}", blake3::hash(&ciphertext).to_hex());
        let stored = self
            .core
            .content
            .put_with_fallback(&ciphertext, &local_key)
            .await?;
        Ok((stored.address, stored.durability))
    }

    async fn sent_pointer(
        &self,
        id: Option<MessageId>,
        durability: Durability,
    ) -> Result<SentMessage> {
        let id = id.ok_or_else(|| ClientError::Ledger("receipt has no message event".into()))?;
        let pointer = self
            .core
            .gateway
            .message(id)
            .await?
            .ok_or_else(|| ClientError::Ledger(format!("message {id} missing after send")))?;
        self.remember_pointer(&pointer);
        Ok(SentMessage {
            pointer,
            durability,
        })
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Ordered log of the direct conversation with `peer`.
    pub async fn sync_conversation(&self, peer: Address) -> Result<Vec<Message>> {
        let me = self.core.signer()?.address();
        let conversation = Conversation::Direct(peer);
        let gateway = &self.core.gateway;

        let (sent, received) =
            tokio::try_join!(gateway.sent_messages(me), gateway.received_messages(me))?;
        let ids: BTreeSet<MessageId> = sent.into_iter().chain(received).collect();

        let pointers: Vec<MessagePointer> = self
            .resolve_pointers(ids)
            .await?
            .into_iter()
            .filter(|p| p.is_between(&me, &peer))
            .collect();

        self.build_log(me, conversation, pointers, move || async move {
            let signer = self.core.signer()?;
            let peer_user = self.core.gateway.user(peer).await?;
            Ok::<_, ClientError>(
                peer_user.map(|user| signer.conversation_key(&peer, &user.public_key)),
            )
        })
        .await
    }

    /// Ordered log of a group conversation.
    pub async fn sync_group_conversation(&self, group_id: GroupId) -> Result<Vec<Message>> {
        let me = self.core.signer()?.address();
        let conversation = Conversation::Group(group_id);

        let ids: BTreeSet<MessageId> = self
            .core
            .gateway
            .group_messages(group_id)
            .await?
            .into_iter()
            .collect();
        let pointers: Vec<MessagePointer> = self
            .resolve_pointers(ids)
            .await?
            .into_iter()
            .filter(|p| p.target == MessageTarget::Group(group_id))
            .collect();

        self.build_log(me, conversation, pointers, move || async move {
            let group = self.core.gateway.group(group_id).await?;
            Ok::<_, ClientError>(group.map(|g| crypto::derive_group_key(g.id, &g.owner)))
        })
        .await
    }

    pub async fn sync(&self, conversation: Conversation) -> Result<Vec<Message>> {
        match conversation {
            Conversation::Direct(peer) => self.sync_conversation(peer).await,
            Conversation::Group(id) => self.sync_group_conversation(id).await,
        }
    }

    // The key lookup only runs when the pointer set changed and something
    // is encrypted.
    async fn build_log<F, Fut>(
        &self,
        me: Address,
        conversation: Conversation,
        pointers: Vec<MessagePointer>,
        key: F,
    ) -> Result<Vec<Message>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<SymmetricKey>>>,
    {
        let mut ids: Vec<MessageId> = pointers.iter().map(|p| p.id).collect();
        ids.sort();

        if let Some(log) = self.cached_log(me, conversation, &ids) {
            debug!(%conversation, messages = log.len(), "conversation cache hit");
            return Ok(log);
        }

        let key = if pointers.iter().any(|p| p.is_encrypted) {
            key().await?
        } else {
            None
        };
        if key.is_none() && pointers.iter().any(|p| p.is_encrypted) {
            warn!(%conversation, "no key material for conversation");
        }

        let mut messages = join_all(
            pointers
                .iter()
                .map(|p| self.open_pointer(p, key.as_ref(), conversation)),
        )
        .await;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        // Outages are transient; only fully resolved logs are cached.
        let resolvable = messages
            .iter()
            .all(|m| m.placeholder != Some(PlaceholderReason::Unresolvable));
        if resolvable {
            self.logs.lock().unwrap_or_else(|e| e.into_inner()).insert(
                (me, conversation),
                CachedLog {
                    ids,
                    messages: messages.clone(),
                },
            );
        }

        debug!(%conversation, messages = messages.len(), "conversation synced");
        self.core.events.emit(SessionEvent::ConversationUpdated {
            conversation,
            messages: messages.len(),
        });
        Ok(messages)
    }

    async fn resolve_pointers(&self, ids: BTreeSet<MessageId>) -> Result<Vec<MessagePointer>> {
        let mut resolved = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        {
            let cache = self.pointers.lock().unwrap_or_else(|e| e.into_inner());
            for id in ids {
                match cache.get(&id) {
                    Some(pointer) => resolved.push(pointer.clone()),
                    None => missing.push(id),
                }
            }
        }

        let gateway = &self.core.gateway;
        let fetched = join_all(missing.iter().map(|id| gateway.message(*id))).await;
        for (id, pointer) in missing.into_iter().zip(fetched) {
            match pointer? {
                Some(pointer) => {
                    self.remember_pointer(&pointer);
                    resolved.push(pointer);
                }
                None => warn!(message = %id, "pointer listed but not found"),
            }
        }
        Ok(resolved)
    }

    async fn open_pointer(
        &self,
        pointer: &MessagePointer,
        key: Option<&SymmetricKey>,
        conversation: Conversation,
    ) -> Message {
        let body = if pointer.is_encrypted {
            self.decrypt_body(pointer, key).await
        } else {
            Ok(pointer.content_address.as_str().to_string())
        };

        let (content, placeholder) = match body {
            Ok(content) => (content, None),
            Err(reason) => (UNDECRYPTABLE_PLACEHOLDER.to_string(), Some(reason)),
        };

        Message {
            id: pointer.id,
            sender: pointer.sender,
            conversation,
            message_type: pointer.message_type,
            content,
            placeholder,
            timestamp: pointer.timestamp,
        }
    }

    async fn decrypt_body(
        &self,
        pointer: &MessagePointer,
        key: Option<&SymmetricKey>,
    ) -> std::result::Result<String, PlaceholderReason> {
        let bytes = self
            .core
            .content
            .get(&pointer.content_address)
            .await
            .map_err(|e| {
                debug!(message = %pointer.id, error = %e, "message content unresolvable");
                PlaceholderReason::Unresolvable
            })?;
        let key = key.ok_or(PlaceholderReason::Undecryptable)?;
        let plaintext =
            crypto::decrypt(key, &bytes).map_err(|_| PlaceholderReason::Undecryptable)?;
        let envelope =
            MessageEnvelope::from_bytes(&plaintext).map_err(|_| PlaceholderReason::Undecryptable)?;
        Ok(envelope.content)
    }

    fn remember_pointer(&self, pointer: &MessagePointer) {
        self.pointers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pointer.id, pointer.clone());
    }

    fn cached_log(
        &self,
        me: Address,
        conversation: Conversation,
        ids: &[MessageId],
    ) -> Option<Vec<Message>> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(&(me, conversation))
            .filter(|log| log.ids == ids)
            .map(|log| log.messages.clone())
    }

    fn invalidate(&self, me: Address, conversation: Conversation) {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(me, conversation));
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Make `conversation` the active view, replacing any earlier view of it.
    pub fn open_view(&self, conversation: Conversation) -> ViewToken {
        let generation = self.next_view.fetch_add(1, Ordering::SeqCst);
        self.views
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation, generation);
        ViewToken {
            conversation,
            generation,
        }
    }

    pub fn close_view(&self, token: &ViewToken) {
        let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
        if views.get(&token.conversation) == Some(&token.generation) {
            views.remove(&token.conversation);
        }
    }

    pub fn is_current(&self, token: &ViewToken) -> bool {
        self.views
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&token.conversation)
            == Some(&token.generation)
    }

    /// Sync the view's conversation; `None` if the view went stale meanwhile.
    pub async fn sync_view(&self, token: &ViewToken) -> Result<Option<Vec<Message>>> {
        let log = self.sync(token.conversation).await?;
        if self.is_current(token) {
            Ok(Some(log))
        } else {
            debug!(conversation = %token.conversation, "discarding stale sync result");
            Ok(None)
        }
    }
}

fn check_size(plaintext: &str) -> Result<()> {
    if plaintext.len() > MAX_MESSAGE_SIZE {
        return Err(ClientError::InvalidArgument(format!(
            "message is {} bytes, limit is {MAX_MESSAGE_SIZE}",
            plaintext.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

/// Source of conversation updates.
#[async_trait]
pub trait ConversationFeed: Send {
    fn conversation(&self) -> Conversation;

    /// The next changed log; `None` once the feed has stopped.
    async fn next(&mut self) -> Option<Vec<Message>>;
}

/// Feed that re-syncs on a fixed interval and yields only changed logs.
///
/// The feed owns a view of its conversation; opening another view of the
/// same conversation stops it.
pub struct PollingFeed {
    conversation: Conversation,
    rx: mpsc::Receiver<Vec<Message>>,
    task: JoinHandle<()>,
}

const FEED_BUFFER: usize = 16;

impl PollingFeed {
    pub fn start(engine: Arc<MessageEngine>, conversation: Conversation, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let token = engine.open_view(conversation);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Vec<Message>> = None;

            loop {
                ticker.tick().await;
                match engine.sync_view(&token).await {
                    Ok(Some(log)) => {
                        if last.as_ref() != Some(&log) {
                            last = Some(log.clone());
                            if tx.send(log).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(ClientError::SessionClosed | ClientError::NotAuthenticated) => break,
                    Err(e) => warn!(%conversation, error = %e, "poll failed"),
                }
            }

            engine.close_view(&token);
            debug!(%conversation, "polling feed stopped");
        });

        Self {
            conversation,
            rx,
            task,
        }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for PollingFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl ConversationFeed for PollingFeed {
    fn conversation(&self) -> Conversation {
        self.conversation
    }

    async fn next(&mut self) -> Option<Vec<Message>> {
        self.rx.recv().await
    }
}
