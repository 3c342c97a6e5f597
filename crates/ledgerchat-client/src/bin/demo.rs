//! # ledgerchat-demo
//!
//! Runs the two-party scenario against an in-process devnet ledger:
//! Alice and Bob register, become friends, exchange a message, and Alice
//! backs up her recovery phrase under a PIN.
//!
//! Pass `--memory-store` to use an in-memory content network instead of the
//! configured IPFS endpoint.

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};

use ledgerchat_client::{logging, BackupPayload, ClientConfig, Session, SessionEvent};
use ledgerchat_net::{ContentStore, Devnet, HttpContentStore, MemoryContentStore};
use ledgerchat_shared::identity::generate_phrase;
use ledgerchat_shared::MessageType;
use ledgerchat_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    logging::init_tracing();
    info!("Starting ledgerchat demo v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let memory_store = std::env::args().any(|arg| arg == "--memory-store");
    let store: Arc<dyn ContentStore> = if memory_store {
        info!("Using in-memory content store");
        Arc::new(MemoryContentStore::new())
    } else {
        info!(url = %config.content_store_url, "Using IPFS content store");
        Arc::new(
            HttpContentStore::new(&config.content_store_url, config.content_store_timeout)
                .context("building content store client")?,
        )
    };

    // -----------------------------------------------------------------------
    // 2. Two devices on one devnet
    // -----------------------------------------------------------------------
    let devnet = Arc::new(Devnet::new());
    let alice = Session::open(
        config.clone(),
        devnet.clone(),
        store.clone(),
        Database::open_in_memory()?,
    );
    let bob = Session::open(config, devnet, store, Database::open_in_memory()?);

    let mut alice_events = alice.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = alice_events.recv().await {
            if let SessionEvent::DurabilityDegraded { address, kv_key } = &event {
                warn!(%address, kv_key, "alice: payload kept on this device only");
            }
        }
    });

    let alice_phrase = generate_phrase()?;
    let alice_address = alice
        .vault()
        .unlock_with_recovery_phrase(&alice_phrase)?
        .address();
    let bob_address = bob
        .vault()
        .unlock_with_recovery_phrase(&generate_phrase()?)?
        .address();

    // -----------------------------------------------------------------------
    // 3. Register, befriend, message
    // -----------------------------------------------------------------------
    alice.relationships().register_identity("alice").await?;
    bob.relationships().register_identity("bob").await?;
    info!(alice = %alice_address, bob = %bob_address, "identities registered");

    let request = alice
        .relationships()
        .send_friend_request(&bob_address.to_hex())
        .await?;
    bob.relationships().accept_friend_request(request).await?;

    let sent = alice
        .messaging()
        .send_message(bob_address, "hello", MessageType::Text)
        .await?;
    info!(message = %sent.pointer.id, durability = ?sent.durability, "alice sent a message");

    let log = bob.messaging().sync_conversation(alice_address).await?;
    for message in &log {
        info!(from = %message.sender.short(), content = %message.content, "bob received");
    }
    if log.len() != 1 || log[0].content != "hello" {
        bail!("expected exactly one \"hello\" from alice, got {} messages", log.len());
    }

    // -----------------------------------------------------------------------
    // 4. Backup and restore
    // -----------------------------------------------------------------------
    let backup = alice
        .recovery()
        .create_backup("4821", BackupPayload::RecoveryPhrase(alice_phrase.clone()))
        .await?;
    info!(address = %backup.address, durability = ?backup.durability, "alice backed up her phrase");

    match alice.recovery().restore_payload("4821").await? {
        BackupPayload::RecoveryPhrase(phrase) if phrase == alice_phrase => {
            info!("backup restored and verified")
        }
        _ => bail!("restored backup does not match"),
    }

    alice.close()?;
    bob.close()?;
    info!("demo finished");
    Ok(())
}
