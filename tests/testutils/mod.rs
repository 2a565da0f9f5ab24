use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use tempfile::TempDir;

use electrum_account::account::maketx::ProposedTransaction;
use electrum_account::account::{Account, Event, EventSink};
use electrum_account::addresses::{AddressChain, AddressType};
use electrum_account::blockchain::{
    Blockchain, HeaderCallback, ScriptHashHex, StatusCallback, Tip, TxHistory, TxHistoryEntry,
};
use electrum_account::db::sled::SledDatabase;
use electrum_account::db::Database;
use electrum_account::headers::{Headers, HeadersEvent, HeadersEventCallback, HeadersStatus};
use electrum_account::keystore::{Configuration, Keystore};

pub const NETWORK: Network = Network::Bitcoin;
pub const ACCOUNT_KEYPATH: &str = "m/84'/0'/0'";
pub const SEED: [u8; 32] = [7; 32];

/// Scriptable stand-in for the chain indexer. Tests seed histories and raw
/// transactions keyed by script hash and drive notifications explicitly.
pub struct MockBlockchain {
    tip_height: AtomicU32,
    histories: Mutex<HashMap<ScriptHashHex, TxHistory>>,
    transactions: Mutex<HashMap<Txid, Transaction>>,
    subscriptions: Mutex<HashMap<ScriptHashHex, StatusCallback>>,
    header_callbacks: Mutex<Vec<HeaderCallback>>,
    fee_estimates: Mutex<HashMap<u16, Amount>>,
    relay_fee: Mutex<Option<Amount>>,
    history_fetches: AtomicUsize,
    transaction_fetches: AtomicUsize,
    broadcast: Mutex<Vec<Transaction>>,
}

impl MockBlockchain {
    pub fn new(tip_height: u32) -> Arc<Self> {
        Arc::new(Self {
            tip_height: AtomicU32::new(tip_height),
            histories: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            header_callbacks: Mutex::new(Vec::new()),
            fee_estimates: Mutex::new(HashMap::new()),
            relay_fee: Mutex::new(None),
            history_fetches: AtomicUsize::new(0),
            transaction_fetches: AtomicUsize::new(0),
            broadcast: Mutex::new(Vec::new()),
        })
    }

    pub fn set_history(&self, script: &Script, entries: Vec<(Txid, i32)>) {
        let history = TxHistory(
            entries
                .into_iter()
                .map(|(txid, height)| TxHistoryEntry { txid, height })
                .collect(),
        );
        self.histories
            .lock()
            .unwrap()
            .insert(ScriptHashHex::from_script(script), history);
    }

    pub fn add_transaction(&self, transaction: &Transaction) {
        self.transactions
            .lock()
            .unwrap()
            .insert(transaction.compute_txid(), transaction.clone());
    }

    pub fn set_fee_estimate(&self, blocks: u16, rate: Option<Amount>) {
        let mut estimates = self.fee_estimates.lock().unwrap();
        match rate {
            Some(rate) => estimates.insert(blocks, rate),
            None => estimates.remove(&blocks),
        };
    }

    pub fn set_relay_fee(&self, rate: Option<Amount>) {
        *self.relay_fee.lock().unwrap() = rate;
    }

    /// Deliver the current status of `script` to its subscriber, the way the
    /// server pushes a notification after a history change.
    pub async fn notify(&self, script: &Script) {
        let script_hash = ScriptHashHex::from_script(script);
        let status = self.status_of(&script_hash);
        let callback = self
            .subscriptions
            .lock()
            .unwrap()
            .get(&script_hash)
            .cloned()
            .expect("notified script must be subscribed");
        callback(status).await;
    }

    /// Announce a new chain tip to every header subscriber.
    pub async fn announce_tip(&self, height: u32) {
        self.tip_height.store(height, Ordering::SeqCst);
        let callbacks: Vec<HeaderCallback> =
            self.header_callbacks.lock().unwrap().iter().cloned().collect();
        for callback in callbacks {
            callback(Tip { height }).await;
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn history_fetch_count(&self) -> usize {
        self.history_fetches.load(Ordering::SeqCst)
    }

    pub fn transaction_fetch_count(&self) -> usize {
        self.transaction_fetches.load(Ordering::SeqCst)
    }

    pub fn broadcast_transactions(&self) -> Vec<Transaction> {
        self.broadcast.lock().unwrap().clone()
    }

    fn status_of(&self, script_hash: &ScriptHashHex) -> String {
        self.histories
            .lock()
            .unwrap()
            .get(script_hash)
            .map(|history| history.status())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Blockchain for MockBlockchain {
    async fn headers_subscribe(&self, on_header: HeaderCallback) -> Result<()> {
        self.header_callbacks.lock().unwrap().push(on_header.clone());
        let tip = Tip {
            height: self.tip_height.load(Ordering::SeqCst),
        };
        tokio::spawn(on_header(tip));
        Ok(())
    }

    async fn estimate_fee(&self, blocks: u16) -> Result<Option<Amount>> {
        Ok(self.fee_estimates.lock().unwrap().get(&blocks).copied())
    }

    async fn relay_fee(&self) -> Result<Amount> {
        self.relay_fee
            .lock()
            .unwrap()
            .ok_or_else(|| anyhow!("relay fee unavailable"))
    }

    async fn script_hash_subscribe(
        &self,
        script: &Script,
        on_status: StatusCallback,
    ) -> Result<()> {
        let script_hash = ScriptHashHex::from_script(script);
        let status = self.status_of(&script_hash);
        self.subscriptions
            .lock()
            .unwrap()
            .insert(script_hash, on_status.clone());
        // Initial status, delivered like a server push: never synchronously
        // into the subscriber.
        tokio::spawn(on_status(status));
        Ok(())
    }

    async fn script_hash_get_history(&self, script: &Script) -> Result<TxHistory> {
        self.history_fetches.fetch_add(1, Ordering::SeqCst);
        let script_hash = ScriptHashHex::from_script(script);
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(&script_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn transaction_get(&self, txid: Txid) -> Result<Transaction> {
        self.transaction_fetches.fetch_add(1, Ordering::SeqCst);
        self.transactions
            .lock()
            .unwrap()
            .get(&txid)
            .cloned()
            .with_context(|| format!("unknown transaction {txid}"))
    }

    async fn transaction_broadcast(&self, transaction: &Transaction) -> Result<Txid> {
        self.broadcast.lock().unwrap().push(transaction.clone());
        Ok(transaction.compute_txid())
    }
}

/// Software keystore over a seed-derived master key. Signing fills
/// placeholder witnesses; the engine treats the signer as a black box.
pub struct MockKeystore {
    master: Xpriv,
    sign_calls: AtomicUsize,
    reject: Mutex<bool>,
}

impl MockKeystore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            master: Xpriv::new_master(NETWORK, &SEED).unwrap(),
            sign_calls: AtomicUsize::new(0),
            reject: Mutex::new(false),
        })
    }

    pub fn account_xpub(&self) -> Xpub {
        let secp = Secp256k1::new();
        let path = DerivationPath::from_str(ACCOUNT_KEYPATH).unwrap();
        Xpub::from_priv(&secp, &self.master.derive_priv(&secp, &path).unwrap())
    }

    pub fn sign_call_count(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn set_reject(&self, reject: bool) {
        *self.reject.lock().unwrap() = reject;
    }
}

impl Keystore for MockKeystore {
    fn extended_public_key(&self, keypath: &DerivationPath) -> Result<Xpub> {
        let secp = Secp256k1::new();
        Ok(Xpub::from_priv(
            &secp,
            &self.master.derive_priv(&secp, keypath).unwrap(),
        ))
    }

    fn sign_transaction(&self, proposal: &mut ProposedTransaction) -> Result<()> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if *self.reject.lock().unwrap() {
            return Err(anyhow!("user aborted on the device"));
        }
        assert_eq!(proposal.transaction.input.len(), proposal.inputs.len());
        for (index, input) in proposal.inputs.iter().enumerate() {
            assert!(input.prev_value > Amount::ZERO);
            let witness = &mut proposal.transaction.input[index].witness;
            witness.push([0x30; 72]);
            witness.push(input.public_key.to_bytes());
        }
        Ok(())
    }

    fn identifier(&self) -> Result<String> {
        Ok("mock-keystore".to_string())
    }

    fn has_secure_output(&self) -> bool {
        true
    }

    fn cosigner_index(&self) -> u32 {
        0
    }

    fn configuration(&self) -> Configuration {
        Configuration {
            account_keypath: DerivationPath::from_str(ACCOUNT_KEYPATH).unwrap(),
            address_type: AddressType::Segwit,
        }
    }
}

/// Header oracle with a fixed, test-controlled tip.
pub struct StaticHeaders {
    tip: AtomicU32,
    callbacks: Mutex<Vec<HeadersEventCallback>>,
}

impl StaticHeaders {
    pub fn new(tip: u32) -> Arc<Self> {
        Arc::new(Self {
            tip: AtomicU32::new(tip),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn fire_synced(&self) {
        for callback in self.callbacks.lock().unwrap().iter() {
            callback(HeadersEvent::Synced);
        }
    }
}

impl Headers for StaticHeaders {
    fn tip_height(&self) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }

    fn status(&self) -> Result<HeadersStatus> {
        let tip = self.tip.load(Ordering::SeqCst);
        Ok(HeadersStatus {
            tip_height: tip,
            target_height: tip,
        })
    }

    fn subscribe_event(&self, callback: HeadersEventCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }
}

/// Collects emitted events for assertions.
#[derive(Clone, Default)]
pub struct Events {
    collected: Arc<Mutex<Vec<Event>>>,
}

impl Events {
    pub fn sink(&self) -> EventSink {
        let collected = self.collected.clone();
        Arc::new(move |event| collected.lock().unwrap().push(event))
    }

    pub fn collected(&self) -> Vec<Event> {
        self.collected.lock().unwrap().clone()
    }

    pub fn count_of(&self, event: Event) -> usize {
        self.collected
            .lock()
            .unwrap()
            .iter()
            .filter(|&&e| e == event)
            .count()
    }
}

pub struct TestHarness {
    pub account: Account,
    pub chain: Arc<MockBlockchain>,
    pub keystore: Arc<MockKeystore>,
    pub headers: Arc<StaticHeaders>,
    pub events: Events,
    pub db_dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_parts(
            TempDir::new().unwrap(),
            MockBlockchain::new(110),
            StaticHeaders::new(110),
        )
        .await
    }

    /// Build an account over an existing store directory and indexer,
    /// simulating a wallet restart.
    pub async fn with_parts(
        db_dir: TempDir,
        chain: Arc<MockBlockchain>,
        headers: Arc<StaticHeaders>,
    ) -> Self {
        let keystore = MockKeystore::new();
        let events = Events::default();
        let db: Arc<dyn Database> =
            Arc::new(SledDatabase::open(db_dir.path().join("store")).unwrap());

        let account = Account::new(
            NETWORK,
            DerivationPath::from_str(ACCOUNT_KEYPATH).unwrap(),
            AddressType::Segwit,
            db,
            keystore.clone(),
            chain.clone(),
            headers.clone(),
            events.sink(),
        )
        .unwrap();

        Self {
            account,
            chain,
            keystore,
            headers,
            events,
            db_dir,
        }
    }

    pub async fn init(&self) {
        self.account.init().await.unwrap();
    }

    /// Barrier: wait until the engine has fully settled.
    pub async fn settle(&self) {
        let _ = self.account.unused_receive_address().await;
    }
}

/// Derive the same addresses the account will, for seeding the mock server.
pub fn derived_scripts(branch: u32, count: u32) -> Vec<ScriptBuf> {
    let keystore = MockKeystore::new();
    let mut chain = AddressChain::new(
        DerivationPath::from_str(ACCOUNT_KEYPATH).unwrap(),
        keystore.account_xpub(),
        NETWORK,
        count,
        branch,
        AddressType::Segwit,
    )
    .unwrap();
    chain.ensure_addresses().unwrap();
    chain
        .addresses()
        .iter()
        .map(|address| address.script_pubkey().clone())
        .collect()
}

/// A coinbase-like transaction paying `value` to `script`; `salt` makes the
/// txid unique.
pub fn tx_paying(script: &Script, value: u64, salt: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(salt),
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script.to_owned(),
        }],
    }
}

/// An external address unrelated to the account under test.
pub fn external_address() -> bitcoin::Address {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(NETWORK, &[99u8; 32]).unwrap();
    let xpub = Xpub::from_priv(&secp, &master);
    bitcoin::Address::p2wpkh(&xpub.to_pub(), NETWORK)
}
