//! Account Recovery Engine.
//!
//! Backups are encrypted under a key derived from the PIN and the account
//! address, stored through the content gateway (falling back to local
//! storage), and bound on the ledger to a salted PIN hash.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ledgerchat_shared::constants::{KV_BACKUP_DATA_PREFIX, KV_BACKUP_PREFIX};
use ledgerchat_shared::crypto;
use ledgerchat_shared::identity::address_from_phrase;
use ledgerchat_shared::protocol::{Transaction, User};
use ledgerchat_shared::types::{Address, ContentAddress, GroupId};
use ledgerchat_shared::ProtocolError;

use crate::content::Durability;
use crate::error::{ClientError, Result};
use crate::session::SessionCore;
use crate::vault::{is_valid_pin, SigningSession};

/// Point-in-time copy of an account's ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub user: Option<User>,
    pub friends: Vec<Address>,
    pub groups: Vec<GroupId>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BackupPayload {
    RecoveryPhrase(String),
    AccountSnapshot(AccountSnapshot),
}

impl BackupPayload {
    /// Local storage key used when the content network is unreachable.
    fn local_key(&self, owner: &Address) -> String {
        match self {
            Self::RecoveryPhrase(_) => format!("{KV_BACKUP_PREFIX}{owner}"),
            Self::AccountSnapshot(_) => format!("{KV_BACKUP_DATA_PREFIX}{owner}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBackup {
    pub address: ContentAddress,
    pub durability: Durability,
    /// The ledger account record was created by this backup.
    pub created_account: bool,
}

impl StoredBackup {
    /// Whether the backup can only be restored on this device.
    pub fn is_local_only(&self) -> bool {
        self.durability == Durability::LocalOnly
    }
}

pub struct RecoveryEngine {
    core: Arc<SessionCore>,
}

impl RecoveryEngine {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    /// Encrypt `payload` under `pin` and bind it to the signed-in account.
    pub async fn create_backup(&self, pin: &str, payload: BackupPayload) -> Result<StoredBackup> {
        require_pin_format(pin)?;
        let me = self.core.signer()?.address();
        let pin_hash = crypto::hash_pin(pin, &me)?;

        let exists = self.core.gateway.account_exists(me).await?;
        if exists && !self.core.gateway.verify_pin(me, pin_hash).await? {
            return Err(ClientError::InvalidPin);
        }

        let plaintext =
            serde_json::to_vec(&payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let ciphertext = crypto::encrypt(&crypto::derive_pin_key(pin, &me)?, &plaintext)?;
        let local_key = payload.local_key(&me);
        let previous = self.core.content.local_entry(&local_key)?;
        let stored = self
            .core
            .content
            .put_with_fallback(&ciphertext, &local_key)
            .await?;

        let call = if exists {
            Transaction::UpdateBackup {
                pin_hash,
                backup_address: stored.address.clone(),
            }
        } else {
            Transaction::CreateAccount {
                pin_hash,
                backup_address: stored.address.clone(),
            }
        };
        if let Err(e) = self.core.submit(call).await {
            // The ledger still points at the previous backup; keep its bytes.
            if stored.is_local_only() {
                self.core.content.restore_local(&local_key, previous)?;
                warn!(address = %me.short(), error = %e, "backup not bound, local copy rolled back");
            }
            return Err(e);
        }
        self.core.vault.seal_with_pin(pin)?;

        if stored.is_local_only() {
            warn!(address = %me.short(), backup = %stored.address, "backup stored on this device only");
        } else {
            info!(address = %me.short(), backup = %stored.address, "backup stored");
        }

        Ok(StoredBackup {
            address: stored.address,
            durability: stored.durability,
            created_account: !exists,
        })
    }

    /// Back up the signed-in account's current ledger state.
    pub async fn backup_account(&self, pin: &str) -> Result<StoredBackup> {
        let snapshot = self.snapshot().await?;
        self.create_backup(pin, BackupPayload::AccountSnapshot(snapshot))
            .await
    }

    pub async fn snapshot(&self) -> Result<AccountSnapshot> {
        let me = self.core.signer()?.address();
        let gateway = &self.core.gateway;
        let (user, friends, groups) = tokio::try_join!(
            gateway.user(me),
            gateway.friends(me),
            gateway.user_groups(me)
        )?;
        Ok(AccountSnapshot {
            user,
            friends,
            groups,
            taken_at: Utc::now(),
        })
    }

    /// Restore the signed-in account's backup.
    pub async fn restore_payload(&self, pin: &str) -> Result<BackupPayload> {
        let me = self.core.signer()?.address();
        self.restore_payload_for(me, pin).await
    }

    /// Restore the backup bound to `address`; no signing session needed.
    pub async fn restore_payload_for(&self, address: Address, pin: &str) -> Result<BackupPayload> {
        self.core.ensure_open()?;
        if !is_valid_pin(pin) {
            return Err(ClientError::InvalidPin);
        }

        let gateway = &self.core.gateway;
        let record = gateway
            .account(address)
            .await?
            .ok_or(ClientError::AccountNotFound(address))?;
        if !gateway.verify_pin(address, crypto::hash_pin(pin, &address)?).await? {
            return Err(ClientError::InvalidPin);
        }

        let ciphertext = match self.core.content.get(&record.backup_address).await {
            Ok(bytes) => bytes,
            Err(e) if record.backup_address.is_local() => {
                warn!(address = %address.short(), error = %e, "backup only exists on another device");
                return Err(ClientError::BackupNotRecoverableHere { address });
            }
            Err(e) => return Err(e),
        };

        let plaintext = crypto::decrypt(&crypto::derive_pin_key(pin, &address)?, &ciphertext)?;
        let payload = serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        info!(address = %address.short(), "backup restored");
        Ok(payload)
    }

    /// Pure: the same phrase always yields the same address.
    pub fn derive_address_from_phrase(&self, phrase: &str) -> Result<Address> {
        Ok(address_from_phrase(phrase)?)
    }

    /// Unlock an existing account from its phrase on any device.
    pub async fn recover_account(&self, phrase: &str) -> Result<Arc<SigningSession>> {
        self.core.ensure_open()?;
        let address = self.derive_address_from_phrase(phrase)?;
        let found = self.core.gateway.recover_account_address(address).await?;
        if found.is_zero() {
            return Err(ClientError::AccountNotFound(address));
        }
        let session = self.core.vault.unlock_with_recovery_phrase(phrase)?;
        info!(address = %address, "account recovered from phrase");
        Ok(session)
    }

    /// Replace a forgotten PIN. The reset is signed by the phrase-derived key,
    /// which proves possession without the phrase leaving the device.
    pub async fn reset_pin(&self, phrase: &str, new_pin: &str) -> Result<StoredBackup> {
        require_pin_format(new_pin)?;
        self.core.ensure_open()?;
        let address = self.derive_address_from_phrase(phrase)?;
        if !self.core.gateway.account_exists(address).await? {
            return Err(ClientError::AccountNotFound(address));
        }

        self.core.vault.unlock_with_recovery_phrase(phrase)?;
        self.core
            .submit(Transaction::ResetPin {
                new_pin_hash: crypto::hash_pin(new_pin, &address)?,
            })
            .await?;
        info!(address = %address.short(), "PIN reset");

        let phrase = normalize_phrase(phrase);
        self.create_backup(new_pin, BackupPayload::RecoveryPhrase(phrase))
            .await
    }

    /// Change the PIN, re-encrypting the current backup when it can still be
    /// resolved. Returns whether the backup was carried over.
    pub async fn update_pin(&self, old_pin: &str, new_pin: &str) -> Result<bool> {
        if !is_valid_pin(old_pin) {
            return Err(ClientError::InvalidPin);
        }
        require_pin_format(new_pin)?;
        let me = self.core.signer()?.address();
        let old_hash = crypto::hash_pin(old_pin, &me)?;

        if !self.core.gateway.verify_pin(me, old_hash).await? {
            return Err(ClientError::InvalidPin);
        }

        // Anything short of proof that the backup is already gone stops the
        // update before the PIN hash moves away from the old ciphertext.
        let existing = match self.restore_payload_for(me, old_pin).await {
            Ok(payload) => Some(payload),
            Err(e @ (ClientError::BackupNotRecoverableHere { .. } | ClientError::ContentNotFound(_))) => {
                warn!(address = %me.short(), error = %e, "current backup unavailable, not carried over");
                None
            }
            Err(e) => return Err(e),
        };

        self.core
            .submit(Transaction::UpdatePin {
                old_pin_hash: old_hash,
                new_pin_hash: crypto::hash_pin(new_pin, &me)?,
            })
            .await?;
        self.core.vault.seal_with_pin(new_pin)?;
        info!(address = %me.short(), "PIN updated");

        match existing {
            Some(payload) => {
                self.create_backup(new_pin, payload).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn require_pin_format(pin: &str) -> Result<()> {
    if is_valid_pin(pin) {
        Ok(())
    } else {
        Err(ClientError::InvalidArgument("PIN must be 4 to 12 digits".into()))
    }
}

fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
