pub mod fees;
pub mod maketx;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bitcoin::bip32::DerivationPath;
use bitcoin::{Amount, Network, NetworkKind, Script, ScriptBuf, Txid};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::addresses::{Address, AddressChain, AddressType};
use crate::blockchain::{Blockchain, HeaderCallback, ScriptHashHex, StatusCallback, Tip};
use crate::db::{Database, DatabaseTx};
use crate::headers::{Headers, HeadersEvent, HeadersStatus};
use crate::keystore::Keystore;
use crate::synchronizer::Synchronizer;
use crate::transactions::{Balance, SpendableOutput, Transactions, TxInfo};
use crate::{CHANGE_GAP_LIMIT, GAP_LIMIT};

use self::fees::{default_targets, filter_targets, FeeTarget, FeeTargetCode};
use self::maketx::{
    new_tx_proposal, CandidateUtxo, ProposalError, SendAmount, TxProposal,
};

/// Events emitted to the host. Strictly advisory: observers must re-query
/// the engine for state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    SyncStarted,
    SyncDone,
    StatusChanged,
    HeadersSynced,
    FeeTargetsChanged,
}

pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Failure of a user-initiated spend operation.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error("the signer rejected the transaction")]
    SignerRejected(#[source] anyhow::Error),
    #[error("failed to broadcast the transaction")]
    BroadcastFailed(#[source] anyhow::Error),
    #[error("store failure")]
    Store(#[source] anyhow::Error),
}

struct State {
    receive: AddressChain,
    change: AddressChain,
    fee_targets: Vec<FeeTarget>,
}

struct Inner {
    address_type: AddressType,
    db: Arc<dyn Database>,
    keystore: Arc<dyn Keystore>,
    blockchain: Arc<dyn Blockchain>,
    headers: Arc<dyn Headers>,
    transactions: Arc<Transactions>,
    synchronizer: Arc<Synchronizer>,
    state: RwLock<State>,
    initial_sync_done: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    inited: AtomicBool,
    on_event: EventSink,
}

/// A wallet account derived from one extended public key.
///
/// The engine discovers used addresses with gap-limit scanning, keeps their
/// histories in sync through per-script subscriptions, maintains the
/// transaction set in the store and answers balance, listing and fee
/// queries. The engine is single-shot: after [`Account::close`] a fresh
/// instance must be constructed.
pub struct Account {
    inner: Arc<Inner>,
}

impl Account {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: Network,
        account_keypath: DerivationPath,
        address_type: AddressType,
        db: Arc<dyn Database>,
        keystore: Arc<dyn Keystore>,
        blockchain: Arc<dyn Blockchain>,
        headers: Arc<dyn Headers>,
        on_event: EventSink,
    ) -> Result<Self> {
        tracing::debug!("Creating new account");

        let xpub = keystore
            .extended_public_key(&account_keypath)
            .context("failed to fetch the account xpub")?;
        if xpub.network != NetworkKind::from(network) {
            bail!("extended public key does not match the account network");
        }

        let receive = AddressChain::new(
            account_keypath.clone(),
            xpub,
            network,
            GAP_LIMIT,
            0,
            address_type,
        )?;
        let change = AddressChain::new(
            account_keypath,
            xpub,
            network,
            CHANGE_GAP_LIMIT,
            1,
            address_type,
        )?;

        let initial_sync_done = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let synchronizer = {
            let start_sink = on_event.clone();
            let done_sink = on_event.clone();
            let initial_sync_done = initial_sync_done.clone();
            let closed = closed.clone();
            Synchronizer::new(
                move || start_sink(Event::SyncStarted),
                move || {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if !initial_sync_done.swap(true, Ordering::SeqCst) {
                        done_sink(Event::StatusChanged);
                    }
                    done_sink(Event::SyncDone);
                },
            )
        };

        let transactions = Transactions::new(
            db.clone(),
            blockchain.clone(),
            headers.clone(),
            synchronizer.clone(),
            closed.clone(),
        );

        {
            let sink = on_event.clone();
            headers.subscribe_event(Box::new(move |event| {
                if event == HeadersEvent::Synced {
                    sink(Event::HeadersSynced);
                }
            }));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                address_type,
                db,
                keystore,
                blockchain,
                headers,
                transactions,
                synchronizer,
                state: RwLock::new(State {
                    receive,
                    change,
                    fee_targets: default_targets(),
                }),
                initial_sync_done,
                closed,
                inited: AtomicBool::new(false),
                on_event,
            }),
        })
    }

    /// Begin the initial synchronization. Idempotent; the account answers
    /// queries right away but [`Account::initialized`] stays false until
    /// the first idle edge of the synchronizer.
    pub async fn init(&self) -> Result<()> {
        if self.inner.inited.swap(true, Ordering::SeqCst)
            || self.inner.closed.load(Ordering::SeqCst)
        {
            return Ok(());
        }

        Inner::ensure_addresses(&self.inner)
            .await
            .context("initial address discovery failed")?;

        let weak = Arc::downgrade(&self.inner);
        let on_header: HeaderCallback = Arc::new(move |tip: Tip| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    if inner.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::info!(block_height = tip.height, "Received new header");
                    // Fee estimates change with each block.
                    Inner::update_fee_targets(&inner).await;
                }
            }
            .boxed()
        });
        self.inner
            .blockchain
            .headers_subscribe(on_header)
            .await
            .context("failed to subscribe to header notifications")?;

        Ok(())
    }

    /// Whether the initial sync of the address histories has completed.
    pub fn initialized(&self) -> bool {
        self.inner.initial_sync_done.load(Ordering::SeqCst)
    }

    /// Stop the account. In-flight callbacks return without mutating state;
    /// durable state is kept.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.initial_sync_done.store(false, Ordering::SeqCst);
        (self.inner.on_event)(Event::StatusChanged);
    }

    pub async fn balance(&self) -> Result<Balance> {
        let _state = self.inner.state.read().await;
        self.inner.transactions.balance()
    }

    /// The transaction listing, annotated against the change branch.
    pub async fn transactions(&self) -> Result<Vec<TxInfo>> {
        let state = self.inner.state.read().await;
        let change = &state.change;
        self.inner
            .transactions
            .transactions(&|script_hash| change.lookup_by_script_hash(script_hash).is_some())
    }

    /// Snapshot of the derived UTXO view, oldest first.
    pub async fn spendable_outputs(&self) -> Result<Vec<SpendableOutput>> {
        let _state = self.inner.state.read().await;
        self.inner.transactions.spendable_outputs()
    }

    /// Whether `script_hash` belongs to the change branch.
    pub async fn is_change(&self, script_hash: &ScriptHashHex) -> bool {
        let state = self.inner.state.read().await;
        state.change.lookup_by_script_hash(script_hash).is_some()
    }

    /// The filtered fee table (ascending tiers) and the default tier.
    pub async fn fee_targets(&self) -> (Vec<FeeTarget>, Option<FeeTargetCode>) {
        let state = self.inner.state.read().await;
        filter_targets(&state.fee_targets)
    }

    /// The first receive address with an empty history. Waits for the
    /// synchronizer to go idle so the answer reflects every known use.
    pub async fn unused_receive_address(&self) -> Option<Arc<Address>> {
        self.inner.synchronizer.wait_idle().await;
        tracing::debug!("Get unused receive address");
        let state = self.inner.state.read().await;
        state.receive.get_unused()
    }

    /// Dry-run of a spend: the resulting output amount and fee, without
    /// touching the signer or the network. The recipient output is sized
    /// like one of the account's own addresses.
    pub async fn tx_proposal(
        &self,
        amount: SendAmount,
        fee_target: FeeTargetCode,
    ) -> Result<(Amount, Amount), SendError> {
        let state = self.inner.state.read().await;
        let dummy_script = {
            let len = match self.inner.address_type {
                AddressType::Legacy => 25,
                AddressType::WrappedSegwit => 23,
                AddressType::Segwit => 22,
            };
            ScriptBuf::from(vec![0u8; len])
        };
        let proposal = self.propose(&state, &dummy_script, amount, fee_target)?;
        Ok((proposal.amount, proposal.fee))
    }

    /// Propose, sign through the key store and broadcast a transaction.
    pub async fn send_tx(
        &self,
        recipient: &bitcoin::Address,
        amount: SendAmount,
        fee_target: FeeTargetCode,
    ) -> Result<Txid, SendError> {
        let proposal = {
            let state = self.inner.state.read().await;
            self.propose(&state, &recipient.script_pubkey(), amount, fee_target)?
        };

        let mut proposed = proposal.into_proposed();
        self.inner
            .keystore
            .sign_transaction(&mut proposed)
            .map_err(SendError::SignerRejected)?;

        let txid = self
            .inner
            .blockchain
            .transaction_broadcast(&proposed.transaction)
            .await
            .map_err(SendError::BroadcastFailed)?;
        tracing::info!(%txid, "Published transaction");
        Ok(txid)
    }

    pub fn key_store(&self) -> Arc<dyn Keystore> {
        self.inner.keystore.clone()
    }

    pub fn headers_status(&self) -> Result<HeadersStatus> {
        self.inner.headers.status()
    }

    fn propose(
        &self,
        state: &State,
        recipient_script: &Script,
        amount: SendAmount,
        fee_target: FeeTargetCode,
    ) -> Result<TxProposal, SendError> {
        let fee_rate = state
            .fee_targets
            .iter()
            .find(|target| target.code == fee_target)
            .and_then(|target| target.fee_rate_per_kb)
            .ok_or(ProposalError::FeeUnavailable(fee_target))?;

        let outputs = self
            .inner
            .transactions
            .spendable_outputs()
            .map_err(SendError::Store)?;

        // Confirmed coins on either branch are eligible; unconfirmed ones
        // only when they are our own change.
        let mut candidates = Vec::new();
        for output in outputs {
            let (address, is_change) =
                match state.receive.lookup_by_script_hash(&output.script_hash) {
                    Some(address) => (address, false),
                    None => match state.change.lookup_by_script_hash(&output.script_hash) {
                        Some(address) => (address, true),
                        None => continue,
                    },
                };
            if !output.confirmed && !is_change {
                continue;
            }
            candidates.push(CandidateUtxo {
                outpoint: output.outpoint,
                value: output.value,
                script_pubkey: address.script_pubkey().clone(),
                keypath: address.keypath().clone(),
                address_type: address.address_type(),
                public_key: *address.public_key(),
                height: output.height,
            });
        }

        let change_address = state
            .change
            .get_unused()
            .ok_or_else(|| SendError::Store(anyhow!("change chain has no unused address")))?;

        new_tx_proposal(
            recipient_script,
            amount,
            fee_rate,
            candidates,
            change_address.script_pubkey(),
        )
        .map_err(SendError::from)
    }
}

impl Inner {
    /// Entry point of account synchronization: extend both chains until the
    /// gap-limit tail of unused addresses holds, subscribing every newly
    /// derived address. Invoked at init and after every history change.
    ///
    /// The pass over a branch repeats because a subscription can reveal a
    /// stored history that invalidates the gap inference of the same
    /// activation.
    fn ensure_addresses<'a>(inner: &'a Arc<Inner>) -> BoxFuture<'a, Result<()>> {
        async move {
            if inner.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let _token = inner.synchronizer.inc_requests();

            let mut state = inner.state.write().await;
            let mut dbtx = inner.db.begin()?;
            for change_branch in [false, true] {
                loop {
                    let chain = if change_branch {
                        &mut state.change
                    } else {
                        &mut state.receive
                    };
                    let new_addresses = chain.ensure_addresses()?;
                    if new_addresses.is_empty() {
                        break;
                    }
                    for address in new_addresses {
                        Inner::subscribe_address(inner, &mut *dbtx, address)
                            .await
                            .context("failed to subscribe to address")?;
                    }
                }
            }
            dbtx.commit()?;
            Ok(())
        }
        .boxed()
    }

    /// Seed the address status from the store, persist the history skeleton
    /// and register the status subscription. The subscription holds a
    /// synchronizer token until its first notification has been processed.
    fn subscribe_address<'a>(
        inner: &'a Arc<Inner>,
        dbtx: &'a mut dyn DatabaseTx,
        address: Arc<Address>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let stored = dbtx.address_history(address.script_hash())?;
            address.set_history_status(stored.status());
            dbtx.put_address_history(address.script_hash(), &stored)?;

            let token = Arc::new(inner.synchronizer.inc_requests());
            let weak = Arc::downgrade(inner);
            let callback_address = address.clone();
            let on_status: StatusCallback = Arc::new(move |status: String| {
                let weak = weak.clone();
                let address = callback_address.clone();
                let token = token.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        if let Err(error) = Inner::on_address_status(&inner, &address, status).await
                        {
                            tracing::warn!(
                                address = %address,
                                ?error,
                                "Failed to process address status notification"
                            );
                        }
                    }
                    token.release();
                }
                .boxed()
            });

            inner
                .blockchain
                .script_hash_subscribe(address.script_pubkey(), on_status)
                .await
        }
        .boxed()
    }

    /// Handle a status notification for a subscribed address. A status equal
    /// to the one we already hold means nothing changed; otherwise the full
    /// history is fetched and applied, and the chains re-checked against the
    /// gap limit.
    fn on_address_status<'a>(
        inner: &'a Arc<Inner>,
        address: &'a Arc<Address>,
        status: String,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if inner.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            if status == address.history_status() {
                return Ok(());
            }

            tracing::info!(address = %address, "Address status changed, fetching history");
            let _token = inner.synchronizer.inc_requests();
            let history = inner
                .blockchain
                .script_hash_get_history(address.script_pubkey())
                .await
                .context("failed to fetch address history")?;

            {
                let _state = inner.state.write().await;
                if inner.closed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let reply_status = history.status();
                if reply_status != status {
                    // The server handed us a stale or racing status; the next
                    // notification will reconcile.
                    tracing::debug!(
                        address = %address,
                        "History digest differs from the notified status"
                    );
                }
                address.set_history_status(reply_status);

                let mut dbtx = inner.db.begin()?;
                inner
                    .transactions
                    .update_address_history(&mut *dbtx, address, &history)?;
                dbtx.commit()?;
            }

            // The gap suffix may no longer hold after the history change.
            Inner::ensure_addresses(inner).await
        }
        .boxed()
    }

    /// Refresh every fee target from the indexer, falling back to the relay
    /// fee when the server has no estimate. Failures keep the previous rate.
    async fn update_fee_targets(inner: &Arc<Inner>) {
        let targets: Vec<(u16, FeeTargetCode)> = {
            let state = inner.state.read().await;
            state
                .fee_targets
                .iter()
                .map(|target| (target.blocks, target.code))
                .collect()
        };

        for (blocks, code) in targets {
            let fee_rate = match inner.blockchain.estimate_fee(blocks).await {
                Ok(Some(fee_rate)) => fee_rate,
                Ok(None) => {
                    tracing::warn!(
                        fee_target = blocks,
                        "Fee could not be estimated. Taking the minimum relay fee instead"
                    );
                    match inner.blockchain.relay_fee().await {
                        Ok(fee_rate) => fee_rate,
                        Err(error) => {
                            tracing::error!(?error, "Failed to fetch the relay fee");
                            continue;
                        }
                    }
                }
                Err(error) => {
                    tracing::error!(?error, "Failed to update fee targets");
                    continue;
                }
            };

            {
                let mut state = inner.state.write().await;
                if let Some(target) = state
                    .fee_targets
                    .iter_mut()
                    .find(|target| target.code == code)
                {
                    target.fee_rate_per_kb = Some(fee_rate);
                }
            }
            tracing::info!(blocks, fee_rate_per_kb = %fee_rate, "Fee estimate per kb");
            (inner.on_event)(Event::FeeTargetsChanged);
        }
    }
}
