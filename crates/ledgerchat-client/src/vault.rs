//! Credential vault: the only owner of signing key material.
//!
//! A [`SigningSession`] is obtained by unlocking with the recovery phrase or
//! with a PIN (against the sealed keystore kept in the local database). The
//! session signs and submits transactions; the raw secret never leaves it
//! except sealed under a PIN-derived key.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ledgerchat_net::LedgerGateway;
use ledgerchat_shared::constants::{MAX_PIN_LEN, MIN_PIN_LEN};
use ledgerchat_shared::crypto::{self, SymmetricKey};
use ledgerchat_shared::protocol::{Receipt, SignedTransaction, Transaction, UnsignedTransaction};
use ledgerchat_shared::{Address, Identity, ProtocolError};
use ledgerchat_store::{CachedSession, SealedKeystore};

use crate::error::{ClientError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::session::{lock_db, SharedDatabase};

/// PINs are 4 to 12 ASCII digits.
pub fn is_valid_pin(pin: &str) -> bool {
    (MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Unlocked key material for one account.
#[derive(Debug)]
pub struct SigningSession {
    id: Uuid,
    identity: Identity,
    // Held across nonce lookup, signing and the whole retry loop.
    submit_lock: Mutex<()>,
}

impl SigningSession {
    fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn exchange_public_key(&self) -> [u8; 32] {
        self.identity.exchange_public_key()
    }

    pub fn conversation_key(&self, peer: &Address, peer_exchange_key: &[u8; 32]) -> SymmetricKey {
        self.identity.conversation_key(peer, peer_exchange_key)
    }

    pub fn sign(&self, tx: UnsignedTransaction) -> std::result::Result<SignedTransaction, ProtocolError> {
        tx.sign(&self.identity)
    }

    /// Sign `call` with the next nonce and submit it.
    ///
    /// Submissions from one session are serialized so nonces never race.
    /// The nonce read and the submit share one retry budget.
    pub async fn submit(&self, gateway: &LedgerGateway, call: Transaction) -> Result<Receipt> {
        let _guard = self.submit_lock.lock().await;

        let method = call.method();
        let receipt = gateway
            .submit_call(self.address(), call, |unsigned| self.sign(unsigned))
            .await?;
        info!(method, block = receipt.block, "transaction confirmed");
        Ok(receipt)
    }

    fn seal(&self, pin: &str) -> Result<Vec<u8>> {
        let key = crypto::derive_pin_key(pin, &self.address())?;
        Ok(crypto::encrypt(&key, self.identity.secret_bytes())?)
    }
}

pub struct CredentialVault {
    db: SharedDatabase,
    gateway: Arc<LedgerGateway>,
    events: EventBus,
    current: RwLock<Option<Arc<SigningSession>>>,
}

impl CredentialVault {
    pub fn new(db: SharedDatabase, gateway: Arc<LedgerGateway>, events: EventBus) -> Self {
        Self {
            db,
            gateway,
            events,
            current: RwLock::new(None),
        }
    }

    pub fn current_session(&self) -> Option<Arc<SigningSession>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn require_session(&self) -> Result<Arc<SigningSession>> {
        self.current_session().ok_or(ClientError::NotAuthenticated)
    }

    /// Derive the account key from its recovery phrase.
    pub fn unlock_with_recovery_phrase(&self, phrase: &str) -> Result<Arc<SigningSession>> {
        let identity = Identity::from_phrase(phrase)?;
        self.install(identity)
    }

    /// Unlock the sealed keystore on this device.
    ///
    /// The PIN is checked against the hash recorded on the ledger before the
    /// keystore is opened; a keystore that fails to open is also an invalid PIN.
    pub async fn unlock_with_pin(&self, pin: &str) -> Result<Arc<SigningSession>> {
        if !is_valid_pin(pin) {
            return Err(ClientError::InvalidPin);
        }

        let keystore = lock_db(&self.db)
            .load_keystore()?
            .ok_or(ClientError::NoLocalKeystore)?;
        let address = keystore.address;

        let verified = self
            .gateway
            .verify_pin(address, crypto::hash_pin(pin, &address)?)
            .await?;
        if !verified {
            warn!(address = %address.short(), "PIN rejected by ledger");
            return Err(ClientError::InvalidPin);
        }

        let key = crypto::derive_pin_key(pin, &address)?;
        let secret = crypto::decrypt(&key, &keystore.sealed_secret)
            .map_err(|_| ClientError::InvalidPin)?;
        let secret: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidPin)?;

        let identity = Identity::from_secret_bytes(&secret);
        if identity.address() != address {
            return Err(ClientError::InvalidPin);
        }
        self.install(identity)
    }

    /// Seal the current session's key under `pin` for later PIN unlocks.
    pub fn seal_with_pin(&self, pin: &str) -> Result<()> {
        if !is_valid_pin(pin) {
            return Err(ClientError::InvalidArgument(
                "PIN must be 4 to 12 digits".into(),
            ));
        }
        let session = self.require_session()?;
        let keystore = SealedKeystore {
            address: session.address(),
            sealed_secret: session.seal(pin)?,
            sealed_at: Utc::now(),
        };
        lock_db(&self.db).save_keystore(&keystore)?;
        debug!(address = %keystore.address.short(), "keystore sealed");
        Ok(())
    }

    /// Record the last known username alongside the cached session.
    pub fn remember_username(&self, username: &str) -> Result<()> {
        let db = lock_db(&self.db);
        if let Some(mut cached) = db.load_session()? {
            cached.username = Some(username.to_string());
            db.save_session(&cached)?;
        }
        Ok(())
    }

    /// Cached "who was logged in" record, without any key material.
    pub fn cached_session(&self) -> Result<Option<CachedSession>> {
        Ok(lock_db(&self.db).load_session()?)
    }

    /// Drop the unlocked key and clear the cached session.
    pub fn lock(&self) -> Result<()> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        lock_db(&self.db).clear_session()?;
        if let Some(session) = previous {
            info!(address = %session.address().short(), "session locked");
            self.events.emit(SessionEvent::Locked);
        }
        Ok(())
    }

    fn install(&self, identity: Identity) -> Result<Arc<SigningSession>> {
        let session = Arc::new(SigningSession::new(identity));
        let address = session.address();

        lock_db(&self.db).save_session(&CachedSession {
            address,
            username: None,
            authenticated_at: Utc::now(),
        })?;

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());

        info!(address = %address, session = %session.id(), "signing session unlocked");
        self.events.emit(SessionEvent::Unlocked { address });
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerchat_net::{Devnet, GatewayConfig};
    use ledgerchat_shared::identity::generate_phrase;
    use ledgerchat_shared::types::ContentAddress;
    use ledgerchat_store::Database;
    use std::time::Duration;

    fn vault() -> (CredentialVault, Arc<LedgerGateway>) {
        vault_on(Arc::new(Devnet::new()))
    }

    fn vault_on(devnet: Arc<Devnet>) -> (CredentialVault, Arc<LedgerGateway>) {
        let gateway = Arc::new(LedgerGateway::new(
            devnet,
            GatewayConfig {
                reset_delay: Duration::from_millis(1),
                ..GatewayConfig::default()
            },
        ));
        let db = Arc::new(std::sync::Mutex::new(Database::open_in_memory().unwrap()));
        (
            CredentialVault::new(db, gateway.clone(), EventBus::new()),
            gateway,
        )
    }

    async fn create_account(vault: &CredentialVault, gateway: &LedgerGateway, pin: &str) {
        let session = vault.require_session().unwrap();
        session
            .submit(
                gateway,
                Transaction::CreateAccount {
                    pin_hash: crypto::hash_pin(pin, &session.address()).unwrap(),
                    backup_address: ContentAddress::new("bafy"),
                },
            )
            .await
            .unwrap();
        vault.seal_with_pin(pin).unwrap();
    }

    #[test]
    fn pin_format() {
        assert!(is_valid_pin("1234"));
        assert!(is_valid_pin("123456789012"));
        assert!(!is_valid_pin("123"));
        assert!(!is_valid_pin("1234567890123"));
        assert!(!is_valid_pin("12a4"));
        assert!(!is_valid_pin(""));
    }

    #[test]
    fn same_phrase_same_address() {
        let (vault, _) = vault();
        let phrase = generate_phrase().unwrap();
        let a = vault.unlock_with_recovery_phrase(&phrase).unwrap().address();
        vault.lock().unwrap();
        let b = vault.unlock_with_recovery_phrase(&phrase).unwrap().address();
        assert_eq!(a, b);
    }

    #[test]
    fn bad_phrase_is_rejected() {
        let (vault, _) = vault();
        assert!(matches!(
            vault.unlock_with_recovery_phrase("correct horse battery staple"),
            Err(ClientError::InvalidRecoveryPhrase(_))
        ));
        assert!(vault.current_session().is_none());
    }

    #[test]
    fn lock_clears_cached_session() {
        let (vault, _) = vault();
        vault
            .unlock_with_recovery_phrase(&generate_phrase().unwrap())
            .unwrap();
        assert!(vault.cached_session().unwrap().is_some());

        vault.lock().unwrap();
        assert!(vault.current_session().is_none());
        assert!(vault.cached_session().unwrap().is_none());
    }

    #[tokio::test]
    async fn pin_unlock_round_trip() {
        let (vault, gateway) = vault();
        let phrase = generate_phrase().unwrap();
        let address = vault.unlock_with_recovery_phrase(&phrase).unwrap().address();
        create_account(&vault, &gateway, "2468").await;
        vault.lock().unwrap();

        assert!(matches!(
            vault.unlock_with_pin("1357").await,
            Err(ClientError::InvalidPin)
        ));
        assert!(matches!(
            vault.unlock_with_pin("12").await,
            Err(ClientError::InvalidPin)
        ));

        let session = vault.unlock_with_pin("2468").await.unwrap();
        assert_eq!(session.address(), address);
    }

    #[tokio::test]
    async fn pin_unlock_without_keystore() {
        let (vault, _) = vault();
        assert!(matches!(
            vault.unlock_with_pin("1234").await,
            Err(ClientError::NoLocalKeystore)
        ));
    }

    #[tokio::test]
    async fn submissions_use_sequential_nonces() {
        let (vault, gateway) = vault();
        let session = vault
            .unlock_with_recovery_phrase(&generate_phrase().unwrap())
            .unwrap();

        session
            .submit(
                &gateway,
                Transaction::CreateUser {
                    username: "alice".into(),
                    public_key: session.exchange_public_key(),
                },
            )
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            session.submit(&gateway, Transaction::CreateGroup { name: "one".into() }),
            session.submit(&gateway, Transaction::CreateGroup { name: "two".into() }),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(gateway.nonce(session.address()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn one_operation_resets_at_most_twice() {
        let devnet = Arc::new(Devnet::new());
        let (vault, gateway) = vault_on(devnet.clone());
        let session = vault
            .unlock_with_recovery_phrase(&generate_phrase().unwrap())
            .unwrap();

        devnet.fail_next_calls(2);
        devnet.fail_next_submits(2);
        let result = session
            .submit(
                &gateway,
                Transaction::CreateUser {
                    username: "alice".into(),
                    public_key: session.exchange_public_key(),
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(ClientError::TransientLedgerFault { attempts: 3, .. })
        ));
        assert!(devnet.reconnects() <= 2);
        assert_eq!(devnet.submit_attempts(), 1);
    }
}
