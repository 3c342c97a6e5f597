//! Resilient ledger gateway.
//!
//! Wraps a [`LedgerClient`] with the connection state machine from
//! [`crate::breaker`] and a bounded retry loop. A transient fault triggers a
//! reset and at most `max_retries` further attempts of the same logical
//! operation. Writes are retried by resubmitting the *same* signed
//! transaction, after first asking the ledger whether an earlier attempt
//! already landed.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use ledgerchat_shared::constants::{DEFAULT_SOFT_FAILURE_THRESHOLD, MAX_TRANSIENT_RETRIES};
use ledgerchat_shared::crypto::PinHash;
use ledgerchat_shared::protocol::{
    BackupRecord, FriendRequest, Group, LedgerQuery, LedgerReply, MessagePointer, Receipt,
    SignedTransaction, Transaction, TxHash, UnsignedTransaction, User,
};
use ledgerchat_shared::types::{Address, ConnectionState, GroupId, MessageId, RequestId};
use ledgerchat_shared::ProtocolError;

use crate::breaker::{CircuitBreaker, Transition};
use crate::ledger::{LedgerClient, LedgerError};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Pause between tearing down and re-establishing the connection.
    pub reset_delay: Duration,
    /// Soft failures before the circuit opens.
    pub soft_failure_threshold: u32,
    /// Extra attempts after the first transient fault.
    pub max_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reset_delay: Duration::from_millis(1000),
            soft_failure_threshold: DEFAULT_SOFT_FAILURE_THRESHOLD,
            max_retries: MAX_TRANSIENT_RETRIES,
        }
    }
}

/// Why the last retried attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The local circuit was open (or a reset failed) so the call never left.
    CircuitOpen,
    /// The ledger reported a transient fault.
    TransientFault,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::TransientFault => f.write_str("transient fault"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{method} failed after {attempts} attempts ({reason}): {last_error}")]
    RetryExhausted {
        method: &'static str,
        attempts: u32,
        reason: RetryReason,
        last_error: String,
    },

    #[error("{method} reverted: {reason}")]
    Reverted { method: &'static str, reason: String },

    #[error("Ledger transport error: {0}")]
    Transport(String),

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error("Connection reset failed: {0}")]
    ResetFailed(String),

    #[error("Could not hash transaction: {0}")]
    Encoding(String),
}

impl GatewayError {
    /// Bounded retry ran out; the operation may be tried again later.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}

/// Outcome of one failed attempt.
#[derive(Debug)]
enum Attempt {
    /// Never reached the ledger: the local circuit is open.
    Blocked(String),
    Failed(LedgerError),
}

impl Attempt {
    fn circuit_open(e: LedgerError) -> Self {
        Self::Blocked(e.to_string())
    }
}

pub struct LedgerGateway {
    client: Arc<dyn LedgerClient>,
    breaker: CircuitBreaker,
    config: GatewayConfig,
    state_tx: watch::Sender<ConnectionState>,
    reset_lock: Mutex<()>,
}

impl LedgerGateway {
    pub fn new(client: Arc<dyn LedgerClient>, config: GatewayConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Healthy);
        Self {
            client,
            breaker: CircuitBreaker::new(config.soft_failure_threshold),
            config,
            state_tx,
            reset_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.breaker.state()
    }

    /// Receive every connection state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn publish(&self, transition: Option<Transition>) {
        if let Some((from, to)) = transition {
            if from != to {
                debug!(from = %from, to = %to, "ledger connection state changed");
                self.state_tx.send_replace(to);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Single attempts
    // -----------------------------------------------------------------------

    fn observe<T>(&self, result: &Result<T, LedgerError>) {
        let transition = match result {
            Ok(_) | Err(LedgerError::Reverted(_)) => self.breaker.record_success(),
            Err(LedgerError::Transient(msg)) => self.breaker.trip(msg),
            Err(LedgerError::Transport(msg)) => self.breaker.record_soft_failure(msg),
            Err(LedgerError::UnexpectedReply { .. }) => None,
        };
        self.publish(transition);
    }

    async fn try_call(&self, query: LedgerQuery) -> Result<LedgerReply, Attempt> {
        self.breaker.guard().map_err(Attempt::circuit_open)?;
        let result = self.client.call(query).await;
        self.observe(&result);
        result.map_err(Attempt::Failed)
    }

    async fn try_submit(&self, tx: SignedTransaction) -> Result<Receipt, Attempt> {
        self.breaker.guard().map_err(Attempt::circuit_open)?;
        let result = self.client.submit(tx).await;
        self.observe(&result);
        result.map_err(Attempt::Failed)
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Move the connection through `Resetting` and reconnect.
    ///
    /// Concurrent callers share one reset: whoever finds the connection
    /// already healthy after waiting on the lock returns immediately.
    pub async fn reset(&self) -> Result<(), GatewayError> {
        self.reset_inner(false).await
    }

    /// Reconnect even when the connection looks healthy.
    pub async fn force_reset(&self) -> Result<(), GatewayError> {
        self.reset_inner(true).await
    }

    async fn reset_inner(&self, force: bool) -> Result<(), GatewayError> {
        let _guard = self.reset_lock.lock().await;
        if !force && self.breaker.state() == ConnectionState::Healthy {
            return Ok(());
        }

        self.publish(Some(self.breaker.begin_reset()));
        info!(delay_ms = self.config.reset_delay.as_millis() as u64, "resetting ledger connection");
        tokio::time::sleep(self.config.reset_delay).await;

        match self.client.reconnect().await {
            Ok(()) => {
                self.publish(Some(self.breaker.finish_reset(true)));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "ledger reconnect failed");
                self.publish(Some(self.breaker.finish_reset(false)));
                Err(GatewayError::ResetFailed(e.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bounded retry
    // -----------------------------------------------------------------------

    /// Unsigned read with bounded retry.
    pub async fn call(&self, query: LedgerQuery) -> Result<LedgerReply, GatewayError> {
        let method = query.method();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let reason = match self.try_call(query.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) => self.classify(method, e)?,
            };
            self.after_transient(method, attempt, reason).await?;
        }
    }

    /// Submit a signed transaction with bounded, idempotent retry.
    pub async fn submit(&self, tx: SignedTransaction) -> Result<Receipt, GatewayError> {
        let method = tx.method();
        let tx_hash = tx
            .hash()
            .map_err(|e| GatewayError::Encoding(e.to_string()))?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if attempt > 1 {
                if let Some(receipt) = self.landed_receipt(&tx_hash).await {
                    info!(method, tx = %tx_hash, attempt, "earlier attempt already landed");
                    return Ok(receipt);
                }
            }

            let reason = match self.try_submit(tx.clone()).await {
                Ok(receipt) => {
                    debug!(method, tx = %tx_hash, block = receipt.block, "transaction mined");
                    return Ok(receipt);
                }
                Err(e) => self.classify(method, e)?,
            };
            self.after_transient(method, attempt, reason).await?;
        }
    }

    /// Read the sender's nonce, sign `call` and submit it, all under one
    /// retry budget.
    ///
    /// A faulted nonce read uses up an attempt just like a faulted submit.
    /// Once signed, the same transaction is resubmitted on every retry.
    pub async fn submit_call<F>(
        &self,
        sender: Address,
        call: Transaction,
        mut sign: F,
    ) -> Result<Receipt, GatewayError>
    where
        F: FnMut(UnsignedTransaction) -> Result<SignedTransaction, ProtocolError>,
    {
        let method = call.method();
        let mut signed: Option<(SignedTransaction, TxHash)> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if let Some(tx_hash) = signed.as_ref().map(|(_, hash)| *hash) {
                if let Some(receipt) = self.landed_receipt(&tx_hash).await {
                    info!(method, tx = %tx_hash, attempt, "earlier attempt already landed");
                    return Ok(receipt);
                }
            }

            let tx = match signed.as_ref().map(|(tx, _)| tx.clone()) {
                Some(tx) => tx,
                None => match self.try_call(LedgerQuery::Nonce(sender)).await {
                    Ok(LedgerReply::Nonce(nonce)) => {
                        let tx = sign(UnsignedTransaction {
                            sender,
                            nonce,
                            call: call.clone(),
                        })
                        .map_err(|e| GatewayError::Encoding(e.to_string()))?;
                        let tx_hash = tx
                            .hash()
                            .map_err(|e| GatewayError::Encoding(e.to_string()))?;
                        debug!(method, nonce, sender = %sender.short(), "transaction signed");
                        signed = Some((tx.clone(), tx_hash));
                        tx
                    }
                    Ok(_) => return Err(GatewayError::UnexpectedReply("nonce")),
                    Err(e) => {
                        let reason = self.classify("nonce", e)?;
                        self.after_transient(method, attempt, reason).await?;
                        continue;
                    }
                },
            };

            let reason = match self.try_submit(tx).await {
                Ok(receipt) => {
                    debug!(method, block = receipt.block, "transaction mined");
                    return Ok(receipt);
                }
                Err(e) => self.classify(method, e)?,
            };
            self.after_transient(method, attempt, reason).await?;
        }
    }

    // Non-transient errors leave the loop; transient ones become a reason.
    fn classify(
        &self,
        method: &'static str,
        attempt: Attempt,
    ) -> Result<(RetryReason, String), GatewayError> {
        match attempt {
            Attempt::Blocked(msg) => Ok((RetryReason::CircuitOpen, msg)),
            Attempt::Failed(LedgerError::Transient(msg)) => Ok((RetryReason::TransientFault, msg)),
            Attempt::Failed(LedgerError::Reverted(reason)) => {
                warn!(method, %reason, "ledger call reverted");
                Err(GatewayError::Reverted { method, reason })
            }
            Attempt::Failed(LedgerError::Transport(msg)) => Err(GatewayError::Transport(msg)),
            Attempt::Failed(LedgerError::UnexpectedReply { method }) => {
                Err(GatewayError::UnexpectedReply(method))
            }
        }
    }

    async fn after_transient(
        &self,
        method: &'static str,
        attempt: u32,
        (reason, last_error): (RetryReason, String),
    ) -> Result<(), GatewayError> {
        if attempt > self.config.max_retries {
            error!(method, attempts = attempt, %reason, "ledger retries exhausted");
            return Err(GatewayError::RetryExhausted {
                method,
                attempts: attempt,
                reason,
                last_error,
            });
        }

        warn!(method, attempt, %reason, "transient ledger fault, resetting before retry");
        if let Err(e) = self.reset().await {
            // The next attempt fails fast on the open circuit and counts as an attempt.
            warn!(method, attempt, error = %e, "reset failed");
        }
        Ok(())
    }

    // Runs right after a reset; bypasses the breaker so a failed lookup
    // never blocks the resubmission it guards.
    async fn landed_receipt(&self, tx_hash: &TxHash) -> Option<Receipt> {
        match self.client.call(LedgerQuery::Receipt(*tx_hash)).await {
            Ok(LedgerReply::Receipt(receipt)) => receipt,
            Ok(_) => None,
            Err(e) => {
                debug!(tx = %tx_hash, error = %e, "receipt lookup failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Typed reads
    // -----------------------------------------------------------------------

    pub async fn user(&self, address: Address) -> Result<Option<User>, GatewayError> {
        match self.call(LedgerQuery::User(address)).await? {
            LedgerReply::User(user) => Ok(user),
            _ => Err(GatewayError::UnexpectedReply("users")),
        }
    }

    pub async fn user_exists(&self, address: Address) -> Result<bool, GatewayError> {
        self.bool_query(LedgerQuery::UserExists(address)).await
    }

    pub async fn friend_request(&self, id: RequestId) -> Result<Option<FriendRequest>, GatewayError> {
        match self.call(LedgerQuery::FriendRequest(id)).await? {
            LedgerReply::FriendRequest(request) => Ok(request),
            _ => Err(GatewayError::UnexpectedReply("friendRequests")),
        }
    }

    pub async fn group(&self, id: GroupId) -> Result<Option<Group>, GatewayError> {
        match self.call(LedgerQuery::Group(id)).await? {
            LedgerReply::Group(group) => Ok(group),
            _ => Err(GatewayError::UnexpectedReply("groups")),
        }
    }

    pub async fn group_members(&self, id: GroupId) -> Result<Vec<Address>, GatewayError> {
        self.address_query(LedgerQuery::GroupMembers(id)).await
    }

    pub async fn message(&self, id: MessageId) -> Result<Option<MessagePointer>, GatewayError> {
        match self.call(LedgerQuery::Message(id)).await? {
            LedgerReply::Message(pointer) => Ok(pointer),
            _ => Err(GatewayError::UnexpectedReply("getMessage")),
        }
    }

    pub async fn friends(&self, address: Address) -> Result<Vec<Address>, GatewayError> {
        self.address_query(LedgerQuery::Friends(address)).await
    }

    pub async fn received_friend_requests(
        &self,
        address: Address,
    ) -> Result<Vec<RequestId>, GatewayError> {
        match self.call(LedgerQuery::ReceivedFriendRequests(address)).await? {
            LedgerReply::RequestIds(ids) => Ok(ids),
            _ => Err(GatewayError::UnexpectedReply("getReceivedFriendRequests")),
        }
    }

    pub async fn user_groups(&self, address: Address) -> Result<Vec<GroupId>, GatewayError> {
        match self.call(LedgerQuery::UserGroups(address)).await? {
            LedgerReply::GroupIds(ids) => Ok(ids),
            _ => Err(GatewayError::UnexpectedReply("getUserGroups")),
        }
    }

    pub async fn sent_messages(&self, address: Address) -> Result<Vec<MessageId>, GatewayError> {
        self.message_ids(LedgerQuery::SentMessages(address)).await
    }

    pub async fn received_messages(&self, address: Address) -> Result<Vec<MessageId>, GatewayError> {
        self.message_ids(LedgerQuery::ReceivedMessages(address)).await
    }

    pub async fn group_messages(&self, id: GroupId) -> Result<Vec<MessageId>, GatewayError> {
        self.message_ids(LedgerQuery::GroupMessages(id)).await
    }

    pub async fn verify_pin(&self, address: Address, pin_hash: PinHash) -> Result<bool, GatewayError> {
        self.bool_query(LedgerQuery::VerifyPin { address, pin_hash })
            .await
    }

    pub async fn account_exists(&self, address: Address) -> Result<bool, GatewayError> {
        self.bool_query(LedgerQuery::AccountExists(address)).await
    }

    pub async fn account(&self, address: Address) -> Result<Option<BackupRecord>, GatewayError> {
        match self.call(LedgerQuery::Account(address)).await? {
            LedgerReply::Account(record) => Ok(record),
            _ => Err(GatewayError::UnexpectedReply("account")),
        }
    }

    pub async fn recover_account_address(&self, address: Address) -> Result<Address, GatewayError> {
        match self.call(LedgerQuery::RecoverAccountAddress(address)).await? {
            LedgerReply::Address(found) => Ok(found),
            _ => Err(GatewayError::UnexpectedReply("recoverAccountAddress")),
        }
    }

    pub async fn nonce(&self, address: Address) -> Result<u64, GatewayError> {
        match self.call(LedgerQuery::Nonce(address)).await? {
            LedgerReply::Nonce(nonce) => Ok(nonce),
            _ => Err(GatewayError::UnexpectedReply("nonce")),
        }
    }

    async fn bool_query(&self, query: LedgerQuery) -> Result<bool, GatewayError> {
        let method = query.method();
        match self.call(query).await? {
            LedgerReply::Bool(value) => Ok(value),
            _ => Err(GatewayError::UnexpectedReply(method)),
        }
    }

    async fn address_query(&self, query: LedgerQuery) -> Result<Vec<Address>, GatewayError> {
        let method = query.method();
        match self.call(query).await? {
            LedgerReply::Addresses(addresses) => Ok(addresses),
            _ => Err(GatewayError::UnexpectedReply(method)),
        }
    }

    async fn message_ids(&self, query: LedgerQuery) -> Result<Vec<MessageId>, GatewayError> {
        let method = query.method();
        match self.call(query).await? {
            LedgerReply::MessageIds(ids) => Ok(ids),
            _ => Err(GatewayError::UnexpectedReply(method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet::Devnet;
    use ledgerchat_shared::Identity;

    fn gateway(devnet: &Arc<Devnet>) -> LedgerGateway {
        LedgerGateway::new(
            devnet.clone(),
            GatewayConfig {
                reset_delay: Duration::from_millis(1),
                ..GatewayConfig::default()
            },
        )
    }

    fn register(identity: &Identity, nonce: u64) -> SignedTransaction {
        UnsignedTransaction {
            sender: identity.address(),
            nonce,
            call: Transaction::CreateUser {
                username: "alice".into(),
                public_key: identity.exchange_public_key(),
            },
        }
        .sign(identity)
        .unwrap()
    }

    #[tokio::test]
    async fn always_open_ledger_gets_exactly_three_attempts() {
        let devnet = Arc::new(Devnet::new());
        devnet.set_fail_always(true);
        let gw = gateway(&devnet);
        let id = Identity::generate();

        let err = gw.submit(register(&id, 0)).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RetryExhausted { attempts: 3, .. }
        ));
        assert_eq!(devnet.submit_attempts(), 3);
        assert_eq!(devnet.reconnects(), 2);
    }

    #[tokio::test]
    async fn recovers_after_one_transient_fault() {
        let devnet = Arc::new(Devnet::new());
        devnet.fail_next_submits(1);
        let gw = gateway(&devnet);
        let mut states = gw.subscribe();
        let id = Identity::generate();

        let receipt = gw.submit(register(&id, 0)).await.unwrap();
        assert!(!receipt.events.is_empty());
        assert_eq!(devnet.submit_attempts(), 2);
        assert_eq!(gw.state(), ConnectionState::Healthy);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn lost_receipt_is_not_resubmitted() {
        let devnet = Arc::new(Devnet::new());
        devnet.drop_next_receipts(1);
        let gw = gateway(&devnet);
        let id = Identity::generate();

        let receipt = gw.submit(register(&id, 0)).await.unwrap();
        assert_eq!(devnet.submit_attempts(), 1);
        assert_eq!(receipt.tx_hash, register(&id, 0).hash().unwrap());
        assert!(gw.user_exists(id.address()).await.unwrap());
    }

    #[tokio::test]
    async fn reverts_are_not_retried() {
        let devnet = Arc::new(Devnet::new());
        let gw = gateway(&devnet);
        let id = Identity::generate();

        gw.submit(register(&id, 0)).await.unwrap();
        let err = gw.submit(register(&id, 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Reverted { method: "createUser", .. }));
        assert_eq!(devnet.submit_attempts(), 2);
    }

    #[tokio::test]
    async fn reads_use_bounded_retry() {
        let devnet = Arc::new(Devnet::new());
        devnet.fail_next_calls(2);
        let gw = gateway(&devnet);

        assert!(!gw.user_exists(Address([1; 20])).await.unwrap());
        assert_eq!(devnet.call_attempts(), 3);
    }

    #[tokio::test]
    async fn soft_failures_open_circuit_then_fail_fast() {
        let devnet = Arc::new(Devnet::new());
        devnet.fail_next_calls_with_transport(3);
        let gw = gateway(&devnet);
        let addr = Address([1; 20]);

        assert!(matches!(gw.user(addr).await, Err(GatewayError::Transport(_))));
        assert_eq!(gw.state(), ConnectionState::Degraded);
        assert!(gw.user(addr).await.is_err());
        assert!(gw.user(addr).await.is_err());
        assert_eq!(gw.state(), ConnectionState::CircuitOpen);

        // Next read fails fast, resets, then succeeds.
        let calls_before = devnet.call_attempts();
        assert!(gw.user(addr).await.unwrap().is_none());
        assert_eq!(devnet.call_attempts(), calls_before + 1);
        assert_eq!(gw.state(), ConnectionState::Healthy);
    }

    fn create_user(identity: &Identity) -> Transaction {
        Transaction::CreateUser {
            username: "alice".into(),
            public_key: identity.exchange_public_key(),
        }
    }

    #[tokio::test]
    async fn nonce_and_submit_share_one_budget() {
        let devnet = Arc::new(Devnet::new());
        devnet.fail_next_calls(2);
        devnet.fail_next_submits(2);
        let gw = gateway(&devnet);
        let id = Identity::generate();

        let err = gw
            .submit_call(id.address(), create_user(&id), |tx| tx.sign(&id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RetryExhausted { method: "createUser", attempts: 3, .. }
        ));
        assert_eq!(devnet.reconnects(), 2);
        assert_eq!(devnet.submit_attempts(), 1);
        assert!(!gw.user_exists(id.address()).await.unwrap());
    }

    #[tokio::test]
    async fn mixed_faults_recover_within_budget() {
        let devnet = Arc::new(Devnet::new());
        devnet.fail_next_calls(1);
        devnet.fail_next_submits(1);
        let gw = gateway(&devnet);
        let id = Identity::generate();

        let receipt = gw
            .submit_call(id.address(), create_user(&id), |tx| tx.sign(&id))
            .await
            .unwrap();
        assert_eq!(receipt.tx_hash, register(&id, 0).hash().unwrap());
        assert!(devnet.reconnects() <= 2);
        assert_eq!(devnet.submit_attempts(), 2);
        assert_eq!(gw.nonce(id.address()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lost_receipt_after_signing_is_not_resubmitted() {
        let devnet = Arc::new(Devnet::new());
        devnet.drop_next_receipts(1);
        let gw = gateway(&devnet);
        let id = Identity::generate();

        gw.submit_call(id.address(), create_user(&id), |tx| tx.sign(&id))
            .await
            .unwrap();
        assert_eq!(devnet.submit_attempts(), 1);
        assert!(gw.user_exists(id.address()).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_reset_when_healthy_is_noop() {
        let devnet = Arc::new(Devnet::new());
        let gw = gateway(&devnet);
        gw.reset().await.unwrap();
        assert_eq!(devnet.reconnects(), 0);

        gw.force_reset().await.unwrap();
        assert_eq!(devnet.reconnects(), 1);
        assert_eq!(gw.state(), ConnectionState::Healthy);
    }
}
