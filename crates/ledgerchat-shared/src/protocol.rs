use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::crypto::PinHash;
use crate::error::{IdentityError, ProtocolError};
use crate::identity::{verify_signature, Identity};
use crate::types::{Address, ContentAddress, GroupId, MessageId, MessageType, RequestId, RequestStatus};

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// Registered on-ledger identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub address: Address,
    pub username: String,
    /// X25519 exchange key used for pairwise conversation keys
    pub public_key: [u8; 32],
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: RequestId,
    pub from: Address,
    pub to: Address,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub owner: Address,
    pub members: Vec<Address>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageTarget {
    Direct(Address),
    Group(GroupId),
}

/// Immutable on-ledger reference to a message body.
///
/// When `is_encrypted` is false, `content_address` carries the body inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePointer {
    pub id: MessageId,
    pub sender: Address,
    pub target: MessageTarget,
    pub message_type: MessageType,
    pub content_address: ContentAddress,
    pub is_encrypted: bool,
    pub timestamp: DateTime<Utc>,
}

impl MessagePointer {
    /// Whether this pointer belongs to the direct conversation between `a` and `b`.
    pub fn is_between(&self, a: &Address, b: &Address) -> bool {
        match self.target {
            MessageTarget::Direct(receiver) => {
                (self.sender == *a && receiver == *b) || (self.sender == *b && receiver == *a)
            }
            MessageTarget::Group(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub address: Address,
    pub pin_hash: PinHash,
    pub backup_address: ContentAddress,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Every state-changing ledger call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    CreateUser {
        username: String,
        public_key: [u8; 32],
    },
    UpdateUser {
        username: String,
        status: String,
    },
    SendFriendRequest {
        to: Address,
    },
    AcceptFriendRequest {
        request_id: RequestId,
    },
    RejectFriendRequest {
        request_id: RequestId,
    },
    CreateGroup {
        name: String,
    },
    AddUserToGroup {
        group_id: GroupId,
        member: Address,
    },
    RemoveUserFromGroup {
        group_id: GroupId,
        member: Address,
    },
    SendMessage {
        receiver: Address,
        message_type: MessageType,
        content_address: ContentAddress,
        is_encrypted: bool,
    },
    SendGroupMessage {
        group_id: GroupId,
        message_type: MessageType,
        content_address: ContentAddress,
        is_encrypted: bool,
    },
    CreateAccount {
        pin_hash: PinHash,
        backup_address: ContentAddress,
    },
    UpdatePin {
        old_pin_hash: PinHash,
        new_pin_hash: PinHash,
    },
    UpdateBackup {
        pin_hash: PinHash,
        backup_address: ContentAddress,
    },
    /// Signed with the phrase-derived key; the signature proves phrase possession
    ResetPin {
        new_pin_hash: PinHash,
    },
}

impl Transaction {
    /// Contract method name, used in logs and error reasons
    pub fn method(&self) -> &'static str {
        match self {
            Self::CreateUser { .. } => "createUser",
            Self::UpdateUser { .. } => "updateUser",
            Self::SendFriendRequest { .. } => "sendFriendRequest",
            Self::AcceptFriendRequest { .. } => "acceptFriendRequest",
            Self::RejectFriendRequest { .. } => "rejectFriendRequest",
            Self::CreateGroup { .. } => "createGroup",
            Self::AddUserToGroup { .. } => "addUserToGroup",
            Self::RemoveUserFromGroup { .. } => "removeUserFromGroup",
            Self::SendMessage { .. } => "sendMessage",
            Self::SendGroupMessage { .. } => "sendGroupMessage",
            Self::CreateAccount { .. } => "createAccount",
            Self::UpdatePin { .. } => "updatePin",
            Self::UpdateBackup { .. } => "updateBackup",
            Self::ResetPin { .. } => "resetPin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub sender: Address,
    pub nonce: u64,
    pub call: Transaction,
}

impl UnsignedTransaction {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn sign(self, identity: &Identity) -> Result<SignedTransaction, ProtocolError> {
        let bytes = self.signing_bytes()?;
        let signature = identity.sign(&bytes);
        Ok(SignedTransaction {
            tx: self,
            signer: identity.public_key_bytes(),
            signature: signature.to_bytes().to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: UnsignedTransaction,
    /// Ed25519 verifying key of the signer
    pub signer: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Stable identifier: resubmitting the same signed transaction yields the same hash.
    pub fn hash(&self) -> Result<TxHash, ProtocolError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.tx.signing_bytes()?);
        hasher.update(&self.signature);
        Ok(TxHash(*hasher.finalize().as_bytes()))
    }

    /// Check the signature and that the signer owns `tx.sender`.
    pub fn verify(&self) -> Result<(), IdentityError> {
        if Address::from_public_key(&self.signer) != self.tx.sender {
            return Err(IdentityError::BadSignature);
        }
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::BadSignature)?;
        let bytes = self
            .tx
            .signing_bytes()
            .map_err(|_| IdentityError::BadSignature)?;
        verify_signature(&self.signer, &bytes, &Signature::from_bytes(&sig_bytes))
    }

    pub fn method(&self) -> &'static str {
        self.tx.call.method()
    }
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    UserCreated { address: Address },
    UserUpdated { address: Address },
    FriendRequestSent { request_id: RequestId, from: Address, to: Address },
    FriendRequestAccepted { request_id: RequestId },
    FriendRequestRejected { request_id: RequestId },
    GroupCreated { group_id: GroupId, owner: Address },
    MemberAdded { group_id: GroupId, member: Address },
    MemberRemoved { group_id: GroupId, member: Address },
    MessageSent { message_id: MessageId, sender: Address, receiver: Address },
    GroupMessageSent { message_id: MessageId, group_id: GroupId, sender: Address },
    AccountCreated { address: Address },
    PinUpdated { address: Address },
    BackupUpdated { address: Address },
    PinReset { address: Address },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block: u64,
    pub events: Vec<LedgerEvent>,
}

impl Receipt {
    pub fn request_id(&self) -> Option<RequestId> {
        self.events.iter().find_map(|e| match e {
            LedgerEvent::FriendRequestSent { request_id, .. } => Some(*request_id),
            _ => None,
        })
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.events.iter().find_map(|e| match e {
            LedgerEvent::GroupCreated { group_id, .. } => Some(*group_id),
            _ => None,
        })
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.events.iter().find_map(|e| match e {
            LedgerEvent::MessageSent { message_id, .. }
            | LedgerEvent::GroupMessageSent { message_id, .. } => Some(*message_id),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerQuery {
    User(Address),
    UserExists(Address),
    FriendRequest(RequestId),
    Group(GroupId),
    GroupMembers(GroupId),
    Message(MessageId),
    Friends(Address),
    ReceivedFriendRequests(Address),
    UserGroups(Address),
    SentMessages(Address),
    ReceivedMessages(Address),
    GroupMessages(GroupId),
    VerifyPin { address: Address, pin_hash: PinHash },
    AccountExists(Address),
    Account(Address),
    /// Returns the zero address when no account is registered
    RecoverAccountAddress(Address),
    Nonce(Address),
    Receipt(TxHash),
}

impl LedgerQuery {
    pub fn method(&self) -> &'static str {
        match self {
            Self::User(_) => "users",
            Self::UserExists(_) => "userExists",
            Self::FriendRequest(_) => "friendRequests",
            Self::Group(_) => "groups",
            Self::GroupMembers(_) => "getGroupMembers",
            Self::Message(_) => "getMessage",
            Self::Friends(_) => "getFriends",
            Self::ReceivedFriendRequests(_) => "getReceivedFriendRequests",
            Self::UserGroups(_) => "getUserGroups",
            Self::SentMessages(_) => "getSentMessages",
            Self::ReceivedMessages(_) => "getReceivedMessages",
            Self::GroupMessages(_) => "getGroupMessages",
            Self::VerifyPin { .. } => "verifyPin",
            Self::AccountExists(_) => "accountExists",
            Self::Account(_) => "account",
            Self::RecoverAccountAddress(_) => "recoverAccountAddress",
            Self::Nonce(_) => "nonce",
            Self::Receipt(_) => "receipt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerReply {
    User(Option<User>),
    FriendRequest(Option<FriendRequest>),
    Group(Option<Group>),
    Message(Option<MessagePointer>),
    Account(Option<BackupRecord>),
    Receipt(Option<Receipt>),
    Bool(bool),
    Nonce(u64),
    Address(Address),
    Addresses(Vec<Address>),
    RequestIds(Vec<RequestId>),
    GroupIds(Vec<GroupId>),
    MessageIds(Vec<MessageId>),
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// Plaintext wrapper stored (encrypted) behind a message pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// `0x`-prefixed sender address
    pub sender: String,
}

impl MessageEnvelope {
    pub fn new(content: impl Into<String>, sender: &Address) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
            sender: sender.to_hex(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.content.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: self.content.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(identity: &Identity, nonce: u64) -> SignedTransaction {
        UnsignedTransaction {
            sender: identity.address(),
            nonce,
            call: Transaction::CreateGroup {
                name: "rustaceans".into(),
            },
        }
        .sign(identity)
        .unwrap()
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let id = Identity::generate();
        let tx = signed(&id, 0);
        assert!(tx.verify().is_ok());
        assert_eq!(tx.method(), "createGroup");
    }

    #[test]
    fn test_forged_sender_rejected() {
        let id = Identity::generate();
        let other = Identity::generate();
        let mut tx = signed(&id, 0);
        tx.tx.sender = other.address();
        assert_eq!(tx.verify(), Err(IdentityError::BadSignature));
    }

    #[test]
    fn test_tampered_call_rejected() {
        let id = Identity::generate();
        let mut tx = signed(&id, 0);
        tx.tx.call = Transaction::CreateGroup {
            name: "other".into(),
        };
        assert!(tx.verify().is_err());
    }

    #[test]
    fn test_tx_hash_stable_across_resubmission() {
        let id = Identity::generate();
        let tx = signed(&id, 3);
        let copy = tx.clone();
        assert_eq!(tx.hash().unwrap(), copy.hash().unwrap());
        assert_ne!(tx.hash().unwrap(), signed(&id, 4).hash().unwrap());
    }

    #[test]
    fn test_receipt_event_lookup() {
        let receipt = Receipt {
            tx_hash: TxHash([0u8; 32]),
            block: 1,
            events: vec![
                LedgerEvent::UserUpdated {
                    address: Address::ZERO,
                },
                LedgerEvent::GroupCreated {
                    group_id: GroupId(7),
                    owner: Address::ZERO,
                },
            ],
        };
        assert_eq!(receipt.group_id(), Some(GroupId(7)));
        assert_eq!(receipt.message_id(), None);
    }

    #[test]
    fn test_envelope_json_shape() {
        let sender = Address([0x11; 20]);
        let envelope = MessageEnvelope::new("hello", &sender);
        let bytes = envelope.to_bytes().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["content"], "hello");
        assert_eq!(value["sender"], sender.to_hex());
        assert_eq!(MessageEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let envelope = MessageEnvelope::new("x".repeat(MAX_MESSAGE_SIZE + 1), &Address::ZERO);
        assert!(matches!(
            envelope.to_bytes(),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_pointer_conversation_filter() {
        let a = Address([1; 20]);
        let b = Address([2; 20]);
        let c = Address([3; 20]);
        let pointer = MessagePointer {
            id: MessageId(1),
            sender: b,
            target: MessageTarget::Direct(a),
            message_type: MessageType::Text,
            content_address: ContentAddress::new("hi"),
            is_encrypted: false,
            timestamp: Utc::now(),
        };
        assert!(pointer.is_between(&a, &b));
        assert!(pointer.is_between(&b, &a));
        assert!(!pointer.is_between(&a, &c));
    }
}
