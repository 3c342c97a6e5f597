//! Identity & Relationship Engine.
//!
//! Local projection of the signed-in user's friends, pending requests and
//! groups. Every write goes through the session's signer and the ledger
//! gateway; arguments are validated before anything reaches the ledger.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info};

use ledgerchat_shared::constants::{MAX_GROUP_NAME_LEN, MAX_STATUS_LEN, MAX_USERNAME_LEN, UNKNOWN_USERNAME};
use ledgerchat_shared::protocol::{Transaction, User};
use ledgerchat_shared::types::{Address, GroupId, RequestId, RequestStatus};

use crate::error::{ClientError, Result};
use crate::session::SessionCore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendSummary {
    pub address: Address,
    pub username: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    pub id: RequestId,
    pub from: Address,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub owner: Address,
    pub member_count: usize,
    pub created_at: DateTime<Utc>,
}

// Cached lists are tagged with the account they were built for.
type Cached<T> = RwLock<Option<(Address, Vec<T>)>>;

pub struct RelationshipEngine {
    core: Arc<SessionCore>,
    friends: Cached<FriendSummary>,
    groups: Cached<GroupSummary>,
}

impl RelationshipEngine {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self {
            core,
            friends: RwLock::new(None),
            groups: RwLock::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Register the signed-in account with its own exchange key.
    pub async fn register_identity(&self, username: &str) -> Result<User> {
        let signer = self.core.signer()?;
        self.register_identity_with_key(username, signer.exchange_public_key())
            .await
    }

    pub async fn register_identity_with_key(
        &self,
        username: &str,
        public_key: [u8; 32],
    ) -> Result<User> {
        let username = validate_username(username)?;
        let address = self.core.signer()?.address();

        self.core
            .submit(Transaction::CreateUser {
                username: username.clone(),
                public_key,
            })
            .await
            .map_err(relationship_fault)?;
        self.core.vault.remember_username(&username)?;
        info!(address = %address, username = %username, "identity registered");

        self.core
            .gateway
            .user(address)
            .await?
            .ok_or(ClientError::AccountNotFound(address))
    }

    pub async fn update_identity(&self, username: &str, status: &str) -> Result<()> {
        let username = validate_username(username)?;
        if status.chars().count() > MAX_STATUS_LEN {
            return Err(ClientError::InvalidArgument(format!(
                "status must be at most {MAX_STATUS_LEN} characters"
            )));
        }

        self.core
            .submit(Transaction::UpdateUser {
                username: username.clone(),
                status: status.to_string(),
            })
            .await
            .map_err(relationship_fault)?;
        self.core.vault.remember_username(&username)?;
        Ok(())
    }

    pub async fn current_user(&self) -> Result<Option<User>> {
        let address = self.core.signer()?.address();
        Ok(self.core.gateway.user(address).await?)
    }

    pub async fn user_exists(&self, address: Address) -> Result<bool> {
        self.core.ensure_open()?;
        Ok(self.core.gateway.user_exists(address).await?)
    }

    /// Look a user up by exact address; anything else finds nobody.
    pub async fn search_user(&self, query: &str) -> Result<Option<User>> {
        self.core.ensure_open()?;
        let Ok(address) = Address::from_str(query.trim()) else {
            debug!(query, "search query is not an address");
            return Ok(None);
        };
        Ok(self.core.gateway.user(address).await?)
    }

    // -----------------------------------------------------------------------
    // Friend requests
    // -----------------------------------------------------------------------

    pub async fn send_friend_request(&self, target: &str) -> Result<RequestId> {
        let to = parse_address(target)?;
        let me = self.core.signer()?.address();
        if to == me {
            return Err(ClientError::InvalidArgument(
                "cannot send a friend request to yourself".into(),
            ));
        }

        let receipt = self
            .core
            .submit(Transaction::SendFriendRequest { to })
            .await
            .map_err(relationship_fault)?;
        let id = receipt
            .request_id()
            .ok_or_else(|| ClientError::Ledger("receipt has no FriendRequestSent event".into()))?;

        info!(request = %id, to = %to.short(), "friend request sent");
        Ok(id)
    }

    pub async fn accept_friend_request(&self, id: RequestId) -> Result<()> {
        self.answer_request(id, true).await
    }

    pub async fn reject_friend_request(&self, id: RequestId) -> Result<()> {
        self.answer_request(id, false).await
    }

    async fn answer_request(&self, id: RequestId, accept: bool) -> Result<()> {
        let me = self.core.signer()?.address();
        let call = if accept {
            Transaction::AcceptFriendRequest { request_id: id }
        } else {
            Transaction::RejectFriendRequest { request_id: id }
        };

        let request = self
            .core
            .gateway
            .friend_request(id)
            .await?
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown friend request {id}")))?;
        if request.to != me {
            return Err(ClientError::InvalidArgument(format!(
                "friend request {id} is not addressed to this account"
            )));
        }
        if request.status.is_terminal() {
            return Err(ClientError::PermanentLedgerFault {
                method: call.method(),
                reason: format!("friend request {id} already {}", request.status),
            });
        }

        self.core.submit(call).await.map_err(relationship_fault)?;
        self.invalidate();
        info!(request = %id, accepted = accept, "friend request answered");
        Ok(())
    }

    /// Requests addressed to this account that are still pending on the ledger.
    pub async fn list_pending_received_requests(&self) -> Result<Vec<PendingRequest>> {
        let me = self.core.signer()?.address();
        let gateway = &self.core.gateway;

        let ids = gateway.received_friend_requests(me).await?;
        let requests = join_all(ids.into_iter().map(|id| gateway.friend_request(id))).await;

        let mut pending = Vec::new();
        for request in requests {
            if let Some(request) = request? {
                if request.status == RequestStatus::Pending {
                    pending.push(request);
                }
            }
        }

        let names = join_all(pending.iter().map(|r| self.display_name(r.from))).await;
        Ok(pending
            .into_iter()
            .zip(names)
            .map(|(r, username)| PendingRequest {
                id: r.id,
                from: r.from,
                username,
                created_at: r.created_at,
            })
            .collect())
    }

    pub async fn list_friends(&self) -> Result<Vec<FriendSummary>> {
        let me = self.core.signer()?.address();
        if let Some(friends) = cached(&self.friends, &me) {
            debug!(count = friends.len(), "friends cache hit");
            return Ok(friends);
        }

        let gateway = &self.core.gateway;
        let addresses = gateway.friends(me).await?;
        let users = join_all(addresses.iter().map(|a| gateway.user(*a))).await;

        let friends: Vec<FriendSummary> = addresses
            .into_iter()
            .zip(users)
            .map(|(address, user)| match user {
                Ok(Some(user)) => FriendSummary {
                    address,
                    username: user.username,
                    status: user.status,
                },
                _ => FriendSummary {
                    address,
                    username: UNKNOWN_USERNAME.to_string(),
                    status: String::new(),
                },
            })
            .collect();

        store(&self.friends, me, friends.clone());
        Ok(friends)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub async fn create_group(&self, name: &str) -> Result<GroupId> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(ClientError::InvalidArgument(format!(
                "group name must be 1 to {MAX_GROUP_NAME_LEN} characters"
            )));
        }

        let receipt = self
            .core
            .submit(Transaction::CreateGroup { name: name.to_string() })
            .await
            .map_err(relationship_fault)?;
        let id = receipt
            .group_id()
            .ok_or_else(|| ClientError::Ledger("receipt has no GroupCreated event".into()))?;

        self.invalidate();
        info!(group = %id, name, "group created");
        Ok(id)
    }

    pub async fn add_member(&self, group_id: GroupId, member: &str) -> Result<()> {
        let member = parse_address(member)?;
        self.core
            .submit(Transaction::AddUserToGroup { group_id, member })
            .await
            .map_err(relationship_fault)?;
        self.invalidate();
        Ok(())
    }

    pub async fn remove_member(&self, group_id: GroupId, member: &str) -> Result<()> {
        let member = parse_address(member)?;
        self.core
            .submit(Transaction::RemoveUserFromGroup { group_id, member })
            .await
            .map_err(relationship_fault)?;
        self.invalidate();
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupSummary>> {
        let me = self.core.signer()?.address();
        if let Some(groups) = cached(&self.groups, &me) {
            debug!(count = groups.len(), "groups cache hit");
            return Ok(groups);
        }

        let gateway = &self.core.gateway;
        let ids = gateway.user_groups(me).await?;
        let resolved = join_all(ids.into_iter().map(|id| gateway.group(id))).await;

        let mut groups = Vec::new();
        for group in resolved {
            if let Some(g) = group? {
                groups.push(GroupSummary {
                    id: g.id,
                    member_count: g.members.len(),
                    name: g.name,
                    owner: g.owner,
                    created_at: g.created_at,
                });
            }
        }

        store(&self.groups, me, groups.clone());
        Ok(groups)
    }

    pub async fn group_members(&self, group_id: GroupId) -> Result<Vec<Address>> {
        self.core.ensure_open()?;
        Ok(self.core.gateway.group_members(group_id).await?)
    }

    /// Drop cached friend and group lists.
    pub fn refresh(&self) {
        self.invalidate();
    }

    fn invalidate(&self) {
        *self.friends.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.groups.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // Display metadata only; lookup failures never surface.
    async fn display_name(&self, address: Address) -> String {
        match self.core.gateway.user(address).await {
            Ok(Some(user)) => user.username,
            Ok(None) => UNKNOWN_USERNAME.to_string(),
            Err(e) => {
                debug!(address = %address.short(), error = %e, "username lookup failed");
                UNKNOWN_USERNAME.to_string()
            }
        }
    }
}

fn cached<T: Clone>(cache: &Cached<T>, owner: &Address) -> Option<Vec<T>> {
    match &*cache.read().unwrap_or_else(|e| e.into_inner()) {
        Some((address, items)) if address == owner => Some(items.clone()),
        _ => None,
    }
}

fn store<T>(cache: &Cached<T>, owner: Address, items: Vec<T>) {
    *cache.write().unwrap_or_else(|e| e.into_inner()) = Some((owner, items));
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|_| ClientError::InvalidArgument(format!("malformed address: {raw:?}")))
}

fn validate_username(username: &str) -> Result<String> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(ClientError::InvalidArgument(format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(username.to_string())
}

fn relationship_fault(e: ClientError) -> ClientError {
    match e {
        ClientError::TransientLedgerFault {
            method,
            attempts,
            reason,
        } => ClientError::RelationshipOperationFailed {
            reason: format!("{method} failed after {attempts} attempts ({reason})"),
        },
        other => other,
    }
}
