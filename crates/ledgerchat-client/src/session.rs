//! The session handle.
//!
//! A [`Session`] wires one ledger connection, one content store and one
//! local database into the vault and the three engines. There is no global
//! state: two sessions in one process share nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use ledgerchat_net::{ContentStore, HttpContentStore, LedgerClient, LedgerGateway};
use ledgerchat_shared::protocol::{Receipt, Transaction};
use ledgerchat_shared::types::ConnectionState;
use ledgerchat_store::Database;

use crate::config::ClientConfig;
use crate::content::ContentGateway;
use crate::error::{ClientError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::messaging::MessageEngine;
use crate::recovery::RecoveryEngine;
use crate::relationships::RelationshipEngine;
use crate::vault::{CredentialVault, SigningSession};

pub type SharedDatabase = Arc<Mutex<Database>>;

/// Lock the local database. A poisoned lock is recovered: every helper on
/// `Database` is a single statement, so no half-applied state can leak.
pub(crate) fn lock_db(db: &SharedDatabase) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared by the vault and the engines of one session.
pub(crate) struct SessionCore {
    pub(crate) gateway: Arc<LedgerGateway>,
    pub(crate) vault: CredentialVault,
    pub(crate) content: ContentGateway,
    pub(crate) events: EventBus,
    closed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// The unlocked signing session, if the session is still open.
    pub(crate) fn signer(&self) -> Result<Arc<SigningSession>> {
        self.ensure_open()?;
        self.vault.require_session()
    }

    pub(crate) async fn submit(&self, call: Transaction) -> Result<Receipt> {
        let signer = self.signer()?;
        signer.submit(&self.gateway, call).await
    }
}

pub struct Session {
    config: ClientConfig,
    core: Arc<SessionCore>,
    relationships: RelationshipEngine,
    messaging: Arc<MessageEngine>,
    recovery: RecoveryEngine,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Assemble a session from explicit collaborators.
    ///
    /// Connection state changes are forwarded as [`SessionEvent`]s when a
    /// Tokio runtime is available.
    pub fn open(
        config: ClientConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ContentStore>,
        db: Database,
    ) -> Self {
        let db: SharedDatabase = Arc::new(Mutex::new(db));
        let events = EventBus::new();
        let gateway = Arc::new(LedgerGateway::new(ledger, config.gateway_config()));

        let core = Arc::new(SessionCore {
            vault: CredentialVault::new(db.clone(), gateway.clone(), events.clone()),
            content: ContentGateway::new(store, db, events.clone()),
            gateway,
            events,
            closed: AtomicBool::new(false),
        });

        let forwarder = spawn_state_forwarder(&core);

        info!(
            content_store = %config.content_store_url,
            sync_interval_secs = config.sync_interval.as_secs(),
            "session opened"
        );

        Self {
            relationships: RelationshipEngine::new(core.clone()),
            messaging: Arc::new(MessageEngine::new(core.clone())),
            recovery: RecoveryEngine::new(core.clone()),
            config,
            core,
            forwarder: Mutex::new(forwarder),
        }
    }

    /// Open the configured database and HTTP content store.
    pub fn open_with_config(config: ClientConfig, ledger: Arc<dyn LedgerClient>) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let store = HttpContentStore::new(&config.content_store_url, config.content_store_timeout)?;
        Ok(Self::open(config, ledger, Arc::new(store), db))
    }

    /// Lock the vault and stop background work. Further operations fail
    /// with [`ClientError::SessionClosed`].
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.core.vault.lock()?;
        info!("session closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.core.vault
    }

    pub fn content(&self) -> &ContentGateway {
        &self.core.content
    }

    pub fn gateway(&self) -> &LedgerGateway {
        &self.core.gateway
    }

    pub fn relationships(&self) -> &RelationshipEngine {
        &self.relationships
    }

    pub fn messaging(&self) -> &Arc<MessageEngine> {
        &self.messaging
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.gateway.state()
    }

    /// Tear down and re-establish the ledger connection.
    pub async fn reset_connection(&self) -> Result<()> {
        self.core.ensure_open()?;
        self.core.gateway.force_reset().await?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self
            .forwarder
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn spawn_state_forwarder(core: &Arc<SessionCore>) -> Option<JoinHandle<()>> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("no async runtime, connection state events disabled");
        return None;
    };

    let mut rx = core.gateway.subscribe();
    let events = core.events.clone();
    Some(handle.spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            events.emit(SessionEvent::ConnectionStateChanged(state));
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerchat_net::{Devnet, MemoryContentStore};
    use ledgerchat_shared::identity::generate_phrase;
    use ledgerchat_shared::Address;
    use std::time::Duration;

    fn session(devnet: Arc<Devnet>) -> Session {
        let config = ClientConfig {
            reset_delay: Duration::from_millis(1),
            ..ClientConfig::default()
        };
        Session::open(
            config,
            devnet,
            Arc::new(MemoryContentStore::new()),
            Database::open_in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn closed_session_rejects_operations() {
        let session = session(Arc::new(Devnet::new()));
        session
            .vault()
            .unlock_with_recovery_phrase(&generate_phrase().unwrap())
            .unwrap();

        session.close().unwrap();
        assert!(session.is_closed());
        assert!(session.vault().current_session().is_none());
        assert!(matches!(
            session.relationships().register_identity("alice").await,
            Err(ClientError::SessionClosed)
        ));
        assert!(matches!(
            session.reset_connection().await,
            Err(ClientError::SessionClosed)
        ));
        // Second close is a no-op.
        session.close().unwrap();
    }

    #[tokio::test]
    async fn connection_changes_become_events() {
        let devnet = Arc::new(Devnet::new());
        let session = session(devnet.clone());
        let mut rx = session.events().subscribe();

        devnet.fail_next_calls(1);
        session.gateway().user_exists(Address::ZERO).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if let SessionEvent::ConnectionStateChanged(state) = event {
                seen.push(state);
                if state == ConnectionState::Healthy {
                    break;
                }
            }
        }
        assert!(!seen.is_empty());
        assert_eq!(seen.last(), Some(&ConnectionState::Healthy));
        assert_eq!(session.connection_state(), ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn on_disk_database_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            db_path: Some(dir.path().join("ledgerchat.db")),
            content_store_url: "http://127.0.0.1:9".into(),
            ..ClientConfig::default()
        };
        let devnet = Arc::new(Devnet::new());

        let address = {
            let session = Session::open_with_config(config.clone(), devnet.clone()).unwrap();
            session
                .vault()
                .unlock_with_recovery_phrase(&generate_phrase().unwrap())
                .unwrap()
                .address()
        };

        let session = Session::open_with_config(config, devnet).unwrap();
        let cached = session.vault().cached_session().unwrap().unwrap();
        assert_eq!(cached.address, address);
    }
}
