//! Shared fixtures: sessions on one devnet and one in-memory content network.

use std::sync::Arc;
use std::time::Duration;

use ledgerchat_net::{Devnet, MemoryContentStore};
use ledgerchat_shared::identity::generate_phrase;
use ledgerchat_store::Database;

use crate::config::ClientConfig;
use crate::session::Session;

pub(crate) struct TestNet {
    pub devnet: Arc<Devnet>,
    pub store: Arc<MemoryContentStore>,
}

impl TestNet {
    pub fn new() -> Self {
        Self {
            devnet: Arc::new(Devnet::new()),
            store: Arc::new(MemoryContentStore::new()),
        }
    }

    pub fn config() -> ClientConfig {
        ClientConfig {
            reset_delay: Duration::from_millis(1),
            sync_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    /// A device with an empty local database and nobody signed in.
    pub fn device(&self) -> Session {
        Session::open(
            Self::config(),
            self.devnet.clone(),
            self.store.clone(),
            Database::open_in_memory().unwrap(),
        )
    }

    pub fn signed_in(&self) -> Session {
        let session = self.device();
        session
            .vault()
            .unlock_with_recovery_phrase(&generate_phrase().unwrap())
            .unwrap();
        session
    }

    pub async fn registered(&self, username: &str) -> Session {
        let session = self.signed_in();
        session
            .relationships()
            .register_identity(username)
            .await
            .unwrap();
        session
    }

    /// Two registered accounts that are friends.
    pub async fn friends(&self, a: &str, b: &str) -> (Session, Session) {
        let first = self.registered(a).await;
        let second = self.registered(b).await;
        let id = first
            .relationships()
            .send_friend_request(&second.address().to_hex())
            .await
            .unwrap();
        second
            .relationships()
            .accept_friend_request(id)
            .await
            .unwrap();
        (first, second)
    }
}

impl Session {
    pub(crate) fn address(&self) -> ledgerchat_shared::Address {
        self.vault().current_session().unwrap().address()
    }
}
