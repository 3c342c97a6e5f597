//! In-process ledger with the messaging contract's rules.
//!
//! Used by tests and the demo binary in place of a real node. Every write
//! is signature-checked and nonce-sequenced, produces a receipt that can be
//! looked up by transaction hash, and is subject to the same rules the
//! deployed contract enforces. Fault injection covers the failure modes the
//! gateway has to survive: a tripped guard before execution, a receipt lost
//! after execution, and soft transport errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::debug;

use ledgerchat_shared::constants::{MAX_GROUP_NAME_LEN, MAX_STATUS_LEN, MAX_USERNAME_LEN};
use ledgerchat_shared::crypto::PinHash;
use ledgerchat_shared::protocol::{
    BackupRecord, FriendRequest, Group, LedgerEvent, LedgerQuery, LedgerReply, MessagePointer,
    MessageTarget, Receipt, SignedTransaction, Transaction, TxHash, User,
};
use ledgerchat_shared::types::{Address, GroupId, MessageId, RequestId, RequestStatus};

use crate::ledger::{LedgerClient, LedgerError};

#[derive(Debug, Default)]
struct Chain {
    users: HashMap<Address, User>,
    requests: BTreeMap<RequestId, FriendRequest>,
    received_requests: HashMap<Address, Vec<RequestId>>,
    friends: HashMap<Address, Vec<Address>>,
    groups: BTreeMap<GroupId, Group>,
    user_groups: HashMap<Address, Vec<GroupId>>,
    messages: BTreeMap<MessageId, MessagePointer>,
    sent: HashMap<Address, Vec<MessageId>>,
    received: HashMap<Address, Vec<MessageId>>,
    group_messages: HashMap<GroupId, Vec<MessageId>>,
    accounts: HashMap<Address, BackupRecord>,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<TxHash, Receipt>,
    block: u64,
    next_request: u64,
    next_group: u64,
    next_message: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_submits: u32,
    fail_next_calls: u32,
    transport_next_calls: u32,
    drop_next_receipts: u32,
}

type Revert = String;

#[derive(Debug, Default)]
pub struct Devnet {
    chain: Mutex<Chain>,
    faults: Mutex<Faults>,
    fail_always: AtomicBool,
    submit_attempts: AtomicU32,
    call_attempts: AtomicU32,
    reconnects: AtomicU32,
}

impl Devnet {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Every call and submit reports a tripped guard until cleared.
    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// The next `n` submits report a tripped guard without executing.
    pub fn fail_next_submits(&self, n: u32) {
        self.faults().fail_next_submits = n;
    }

    /// The next `n` reads report a tripped guard.
    pub fn fail_next_calls(&self, n: u32) {
        self.faults().fail_next_calls = n;
    }

    /// The next `n` reads fail with a non-transient transport error.
    pub fn fail_next_calls_with_transport(&self, n: u32) {
        self.faults().transport_next_calls = n;
    }

    /// The next `n` submits execute, then report a tripped guard.
    pub fn drop_next_receipts(&self, n: u32) {
        self.faults().drop_next_receipts = n;
    }

    pub fn submit_attempts(&self) -> u32 {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    pub fn call_attempts(&self) -> u32 {
        self.call_attempts.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Pending + terminal friend requests sent from `from` to `to`.
    pub fn request_count_between(&self, from: &Address, to: &Address) -> usize {
        self.chain()
            .requests
            .values()
            .filter(|r| r.from == *from && r.to == *to)
            .count()
    }

    pub fn message_count(&self) -> usize {
        self.chain().messages.len()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn chain(&self) -> std::sync::MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl LedgerClient for Devnet {
    async fn call(&self, query: LedgerQuery) -> Result<LedgerReply, LedgerError> {
        tokio::task::yield_now().await;
        self.call_attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail_always.load(Ordering::SeqCst) {
            return Err(LedgerError::circuit_open());
        }
        {
            let mut faults = self.faults();
            if Self::take(&mut faults.fail_next_calls) {
                return Err(LedgerError::circuit_open());
            }
            if Self::take(&mut faults.transport_next_calls) {
                return Err(LedgerError::Transport("connection reset by peer".into()));
            }
        }

        Ok(self.chain().read(query))
    }

    async fn submit(&self, tx: SignedTransaction) -> Result<Receipt, LedgerError> {
        tokio::task::yield_now().await;
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail_always.load(Ordering::SeqCst) {
            return Err(LedgerError::circuit_open());
        }
        let drop_receipt = {
            let mut faults = self.faults();
            if Self::take(&mut faults.fail_next_submits) {
                return Err(LedgerError::circuit_open());
            }
            Self::take(&mut faults.drop_next_receipts)
        };

        let receipt = self.chain().execute(tx).map_err(LedgerError::Reverted)?;

        if drop_receipt {
            debug!(tx = %receipt.tx_hash, "devnet dropping receipt");
            return Err(LedgerError::circuit_open());
        }
        Ok(receipt)
    }

    async fn reconnect(&self) -> Result<(), LedgerError> {
        tokio::task::yield_now().await;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

impl Chain {
    fn read(&self, query: LedgerQuery) -> LedgerReply {
        match query {
            LedgerQuery::User(a) => LedgerReply::User(self.users.get(&a).cloned()),
            LedgerQuery::UserExists(a) => LedgerReply::Bool(self.users.contains_key(&a)),
            LedgerQuery::FriendRequest(id) => {
                LedgerReply::FriendRequest(self.requests.get(&id).cloned())
            }
            LedgerQuery::Group(id) => LedgerReply::Group(self.groups.get(&id).cloned()),
            LedgerQuery::GroupMembers(id) => LedgerReply::Addresses(
                self.groups
                    .get(&id)
                    .map(|g| g.members.clone())
                    .unwrap_or_default(),
            ),
            LedgerQuery::Message(id) => LedgerReply::Message(self.messages.get(&id).cloned()),
            LedgerQuery::Friends(a) => {
                LedgerReply::Addresses(self.friends.get(&a).cloned().unwrap_or_default())
            }
            LedgerQuery::ReceivedFriendRequests(a) => {
                LedgerReply::RequestIds(self.received_requests.get(&a).cloned().unwrap_or_default())
            }
            LedgerQuery::UserGroups(a) => {
                LedgerReply::GroupIds(self.user_groups.get(&a).cloned().unwrap_or_default())
            }
            LedgerQuery::SentMessages(a) => {
                LedgerReply::MessageIds(self.sent.get(&a).cloned().unwrap_or_default())
            }
            LedgerQuery::ReceivedMessages(a) => {
                LedgerReply::MessageIds(self.received.get(&a).cloned().unwrap_or_default())
            }
            LedgerQuery::GroupMessages(id) => {
                LedgerReply::MessageIds(self.group_messages.get(&id).cloned().unwrap_or_default())
            }
            LedgerQuery::VerifyPin { address, pin_hash } => LedgerReply::Bool(
                self.accounts
                    .get(&address)
                    .map(|acct| pin_matches(&acct.pin_hash, &pin_hash))
                    .unwrap_or(false),
            ),
            LedgerQuery::AccountExists(a) => LedgerReply::Bool(self.accounts.contains_key(&a)),
            LedgerQuery::Account(a) => LedgerReply::Account(self.accounts.get(&a).cloned()),
            LedgerQuery::RecoverAccountAddress(a) => LedgerReply::Address(
                if self.accounts.contains_key(&a) || self.users.contains_key(&a) {
                    a
                } else {
                    Address::ZERO
                },
            ),
            LedgerQuery::Nonce(a) => LedgerReply::Nonce(self.nonces.get(&a).copied().unwrap_or(0)),
            LedgerQuery::Receipt(hash) => LedgerReply::Receipt(self.receipts.get(&hash).cloned()),
        }
    }
}

fn pin_matches(stored: &PinHash, given: &PinHash) -> bool {
    stored.0.ct_eq(&given.0).into()
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

fn ensure(condition: bool, reason: &str) -> Result<(), Revert> {
    if condition {
        Ok(())
    } else {
        Err(reason.to_string())
    }
}

impl Chain {
    fn execute(&mut self, tx: SignedTransaction) -> Result<Receipt, Revert> {
        tx.verify().map_err(|_| "invalid signature".to_string())?;
        let tx_hash = tx.hash().map_err(|e| e.to_string())?;

        let sender = tx.tx.sender;
        let expected = self.nonces.get(&sender).copied().unwrap_or(0);
        if tx.tx.nonce != expected {
            return Err(format!(
                "invalid nonce: expected {expected}, got {}",
                tx.tx.nonce
            ));
        }

        let events = self.apply(sender, tx.tx.call)?;

        // Only state-changing, successful transactions consume a nonce.
        self.nonces.insert(sender, expected + 1);
        self.block += 1;
        let receipt = Receipt {
            tx_hash,
            block: self.block,
            events,
        };
        self.receipts.insert(tx_hash, receipt.clone());
        Ok(receipt)
    }

    fn apply(&mut self, sender: Address, call: Transaction) -> Result<Vec<LedgerEvent>, Revert> {
        let now = Utc::now();

        match call {
            Transaction::CreateUser { username, public_key } => {
                ensure(!self.users.contains_key(&sender), "User already exists")?;
                let username = username.trim().to_string();
                ensure(
                    !username.is_empty() && username.chars().count() <= MAX_USERNAME_LEN,
                    "Invalid username",
                )?;
                self.users.insert(
                    sender,
                    User {
                        address: sender,
                        username,
                        public_key,
                        status: String::new(),
                        created_at: now,
                    },
                );
                Ok(vec![LedgerEvent::UserCreated { address: sender }])
            }

            Transaction::UpdateUser { username, status } => {
                let user = self.users.get_mut(&sender).ok_or("User does not exist")?;
                let username = username.trim().to_string();
                if !(1..=MAX_USERNAME_LEN).contains(&username.chars().count()) {
                    return Err("Invalid username".into());
                }
                if status.chars().count() > MAX_STATUS_LEN {
                    return Err("Status too long".into());
                }
                user.username = username;
                user.status = status;
                Ok(vec![LedgerEvent::UserUpdated { address: sender }])
            }

            Transaction::SendFriendRequest { to } => {
                ensure(self.users.contains_key(&sender), "User does not exist")?;
                ensure(self.users.contains_key(&to), "Recipient does not exist")?;
                ensure(to != sender, "Cannot send request to yourself")?;
                ensure(!self.are_friends(&sender, &to), "Already friends")?;
                let pending = self.requests.values().any(|r| {
                    r.status == RequestStatus::Pending
                        && ((r.from == sender && r.to == to) || (r.from == to && r.to == sender))
                });
                ensure(!pending, "Request already pending")?;

                self.next_request += 1;
                let id = RequestId(self.next_request);
                self.requests.insert(
                    id,
                    FriendRequest {
                        id,
                        from: sender,
                        to,
                        status: RequestStatus::Pending,
                        created_at: now,
                    },
                );
                self.received_requests.entry(to).or_default().push(id);
                Ok(vec![LedgerEvent::FriendRequestSent {
                    request_id: id,
                    from: sender,
                    to,
                }])
            }

            Transaction::AcceptFriendRequest { request_id } => {
                let (from, to) = self.answer_request(sender, request_id, RequestStatus::Accepted)?;
                self.friends.entry(from).or_default().push(to);
                self.friends.entry(to).or_default().push(from);
                Ok(vec![LedgerEvent::FriendRequestAccepted { request_id }])
            }

            Transaction::RejectFriendRequest { request_id } => {
                self.answer_request(sender, request_id, RequestStatus::Rejected)?;
                Ok(vec![LedgerEvent::FriendRequestRejected { request_id }])
            }

            Transaction::CreateGroup { name } => {
                ensure(self.users.contains_key(&sender), "User does not exist")?;
                let name = name.trim().to_string();
                ensure(
                    !name.is_empty() && name.chars().count() <= MAX_GROUP_NAME_LEN,
                    "Invalid group name",
                )?;

                self.next_group += 1;
                let id = GroupId(self.next_group);
                self.groups.insert(
                    id,
                    Group {
                        id,
                        name,
                        owner: sender,
                        members: vec![sender],
                        created_at: now,
                    },
                );
                self.user_groups.entry(sender).or_default().push(id);
                Ok(vec![LedgerEvent::GroupCreated {
                    group_id: id,
                    owner: sender,
                }])
            }

            Transaction::AddUserToGroup { group_id, member } => {
                ensure(self.users.contains_key(&member), "User does not exist")?;
                let group = self.groups.get_mut(&group_id).ok_or("Group does not exist")?;
                ensure(group.owner == sender, "Only the owner can add members")?;
                ensure(!group.members.contains(&member), "Already a member")?;
                group.members.push(member);
                self.user_groups.entry(member).or_default().push(group_id);
                Ok(vec![LedgerEvent::MemberAdded { group_id, member }])
            }

            Transaction::RemoveUserFromGroup { group_id, member } => {
                let group = self.groups.get_mut(&group_id).ok_or("Group does not exist")?;
                ensure(group.owner == sender, "Only the owner can remove members")?;
                ensure(member != group.owner, "Cannot remove the owner")?;
                ensure(group.members.contains(&member), "Not a member")?;
                group.members.retain(|m| *m != member);
                if let Some(ids) = self.user_groups.get_mut(&member) {
                    ids.retain(|id| *id != group_id);
                }
                Ok(vec![LedgerEvent::MemberRemoved { group_id, member }])
            }

            Transaction::SendMessage {
                receiver,
                message_type,
                content_address,
                is_encrypted,
            } => {
                ensure(self.users.contains_key(&sender), "User does not exist")?;
                ensure(self.users.contains_key(&receiver), "Recipient does not exist")?;
                ensure(self.are_friends(&sender, &receiver), "Not friends")?;

                let id = self.push_message(MessagePointer {
                    id: MessageId(0),
                    sender,
                    target: MessageTarget::Direct(receiver),
                    message_type,
                    content_address,
                    is_encrypted,
                    timestamp: now,
                });
                self.sent.entry(sender).or_default().push(id);
                self.received.entry(receiver).or_default().push(id);
                Ok(vec![LedgerEvent::MessageSent {
                    message_id: id,
                    sender,
                    receiver,
                }])
            }

            Transaction::SendGroupMessage {
                group_id,
                message_type,
                content_address,
                is_encrypted,
            } => {
                let group = self.groups.get(&group_id).ok_or("Group does not exist")?;
                ensure(group.members.contains(&sender), "Not a group member")?;

                let id = self.push_message(MessagePointer {
                    id: MessageId(0),
                    sender,
                    target: MessageTarget::Group(group_id),
                    message_type,
                    content_address,
                    is_encrypted,
                    timestamp: now,
                });
                self.group_messages.entry(group_id).or_default().push(id);
                Ok(vec![LedgerEvent::GroupMessageSent {
                    message_id: id,
                    group_id,
                    sender,
                }])
            }

            Transaction::CreateAccount {
                pin_hash,
                backup_address,
            } => {
                ensure(!self.accounts.contains_key(&sender), "Account already exists")?;
                self.accounts.insert(
                    sender,
                    BackupRecord {
                        address: sender,
                        pin_hash,
                        backup_address,
                        updated_at: now,
                    },
                );
                Ok(vec![LedgerEvent::AccountCreated { address: sender }])
            }

            Transaction::UpdatePin {
                old_pin_hash,
                new_pin_hash,
            } => {
                let account = self.accounts.get_mut(&sender).ok_or("Account does not exist")?;
                ensure(pin_matches(&account.pin_hash, &old_pin_hash), "Invalid PIN")?;
                account.pin_hash = new_pin_hash;
                account.updated_at = now;
                Ok(vec![LedgerEvent::PinUpdated { address: sender }])
            }

            Transaction::UpdateBackup {
                pin_hash,
                backup_address,
            } => {
                let account = self.accounts.get_mut(&sender).ok_or("Account does not exist")?;
                ensure(pin_matches(&account.pin_hash, &pin_hash), "Invalid PIN")?;
                account.backup_address = backup_address;
                account.updated_at = now;
                Ok(vec![LedgerEvent::BackupUpdated { address: sender }])
            }

            Transaction::ResetPin { new_pin_hash } => {
                let account = self.accounts.get_mut(&sender).ok_or("Account does not exist")?;
                account.pin_hash = new_pin_hash;
                account.updated_at = now;
                Ok(vec![LedgerEvent::PinReset { address: sender }])
            }
        }
    }

    fn are_friends(&self, a: &Address, b: &Address) -> bool {
        self.friends.get(a).is_some_and(|f| f.contains(b))
    }

    fn answer_request(
        &mut self,
        sender: Address,
        id: RequestId,
        status: RequestStatus,
    ) -> Result<(Address, Address), Revert> {
        let request = self.requests.get_mut(&id).ok_or("Request does not exist")?;
        ensure(request.to == sender, "Not authorized")?;
        ensure(
            request.status == RequestStatus::Pending,
            "Request already processed",
        )?;
        request.status = status;
        Ok((request.from, request.to))
    }

    fn push_message(&mut self, mut pointer: MessagePointer) -> MessageId {
        self.next_message += 1;
        let id = MessageId(self.next_message);
        pointer.id = id;
        self.messages.insert(id, pointer);
        id
    }
}
