use std::collections::{hash_map, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Context, Result};
use bitcoin::{Amount, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::addresses::Address;
use crate::blockchain::{Blockchain, ScriptHashHex, TxHistory};
use crate::db::{Database, DatabaseTx};
use crate::headers::Headers;
use crate::synchronizer::Synchronizer;

/// Durable record of one transaction touching the account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub transaction: Transaction,
    /// Confirmation height; `None` while the transaction sits in the
    /// mempool.
    pub height: Option<u32>,
    /// UNIX timestamp of the moment we first saw the transaction.
    pub first_seen: u64,
    /// Set when the indexer stopped reporting the transaction in any
    /// history. Abandoned records are kept for audit but excluded from
    /// balances and coin selection.
    pub abandoned: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            confirmed: Amount::ZERO,
            unconfirmed: Amount::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxType {
    Receive,
    Send,
    SendToSelf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Abandoned,
}

/// One row of the account's transaction listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInfo {
    pub txid: Txid,
    pub tx_type: TxType,
    /// Received amount for incoming transactions, amount paid to others for
    /// outgoing ones, non-change amount for self-transfers.
    pub amount: Amount,
    /// Known once every input's previous output is resolved and ours.
    pub fee: Option<Amount>,
    pub height: Option<u32>,
    pub num_confirmations: u32,
    pub status: TxStatus,
    pub first_seen: u64,
}

/// An unspent output paying to one of the account's addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendableOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_hash: ScriptHashHex,
    pub height: Option<u32>,
    pub confirmed: bool,
}

/// Maintains the account's transaction set: applies history diffs, fetches
/// missing raw transactions (and, transitively, the previous transactions
/// of their inputs), marks records the indexer no longer reports as
/// abandoned, and derives the UTXO view, balances and the transaction
/// listing from the store.
pub struct Transactions {
    db: Arc<dyn Database>,
    blockchain: Arc<dyn Blockchain>,
    headers: Arc<dyn Headers>,
    synchronizer: Arc<Synchronizer>,
    /// Raw-transaction fetches currently in flight, with the most recently
    /// reported height so a racing history update is not lost.
    requested: Mutex<HashMap<Txid, Option<u32>>>,
    closed: Arc<AtomicBool>,
}

impl Transactions {
    pub fn new(
        db: Arc<dyn Database>,
        blockchain: Arc<dyn Blockchain>,
        headers: Arc<dyn Headers>,
        synchronizer: Arc<Synchronizer>,
        closed: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            blockchain,
            headers,
            synchronizer,
            requested: Mutex::new(HashMap::new()),
            closed,
        })
    }

    /// Apply a freshly fetched history of `address` against the stored one.
    ///
    /// Writes go onto the caller's store transaction so the history row and
    /// the touched transaction records commit atomically per address. Raw
    /// transactions new to the store are fetched asynchronously; each fetch
    /// holds a synchronizer token taken before this function returns.
    pub fn update_address_history(
        self: &Arc<Self>,
        dbtx: &mut dyn DatabaseTx,
        address: &Address,
        history: &TxHistory,
    ) -> Result<()> {
        let stored = dbtx.address_history(address.script_hash())?;
        let new_txids: HashSet<Txid> = history.iter().map(|entry| entry.txid).collect();

        for entry in stored.iter() {
            if new_txids.contains(&entry.txid) {
                continue;
            }
            if let Some(mut tx_entry) = dbtx.get_tx(&entry.txid)? {
                if !tx_entry.abandoned {
                    tracing::info!(
                        txid = %entry.txid,
                        address = %address,
                        "Transaction no longer reported by the indexer, marking abandoned"
                    );
                    tx_entry.abandoned = true;
                    tx_entry.height = None;
                    dbtx.put_tx(&entry.txid, &tx_entry)?;
                }
            }
        }

        for entry in history.iter() {
            let height = if entry.height > 0 {
                Some(entry.height as u32)
            } else {
                None
            };
            match dbtx.get_tx(&entry.txid)? {
                Some(mut tx_entry) => {
                    if tx_entry.height != height || tx_entry.abandoned {
                        tx_entry.height = height;
                        tx_entry.abandoned = false;
                        dbtx.put_tx(&entry.txid, &tx_entry)?;
                    }
                }
                None => {
                    let fetch = {
                        let mut requested = self.requested.lock().expect("not poisoned");
                        match requested.entry(entry.txid) {
                            hash_map::Entry::Occupied(mut occupied) => {
                                occupied.insert(height);
                                false
                            }
                            hash_map::Entry::Vacant(vacant) => {
                                vacant.insert(height);
                                true
                            }
                        }
                    };
                    if fetch {
                        self.schedule_tx_fetch(entry.txid);
                    }
                }
            }
        }

        dbtx.put_address_history(address.script_hash(), history)?;
        Ok(())
    }

    fn schedule_tx_fetch(self: &Arc<Self>, txid: Txid) {
        let token = self.synchronizer.inc_requests();
        let this = self.clone();
        tokio::spawn(async move {
            if this.closed.load(Ordering::SeqCst) {
                this.forget_request(&txid);
                return;
            }
            match this.blockchain.transaction_get(txid).await {
                Ok(transaction) => {
                    // Dependent fetches are scheduled inside; their tokens
                    // are taken before ours is released below.
                    if let Err(error) = this.index_transaction(txid, transaction) {
                        tracing::error!(%txid, ?error, "Failed to store fetched transaction");
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        %txid,
                        ?error,
                        "Failed to fetch transaction, the next status change will retry"
                    );
                    this.forget_request(&txid);
                }
            }
            drop(token);
        });
    }

    fn forget_request(&self, txid: &Txid) {
        self.requested.lock().expect("not poisoned").remove(txid);
    }

    fn index_transaction(self: &Arc<Self>, txid: Txid, transaction: Transaction) -> Result<()> {
        ensure!(
            transaction.compute_txid() == txid,
            "indexer returned transaction with unexpected id"
        );

        let height = self
            .requested
            .lock()
            .expect("not poisoned")
            .remove(&txid)
            .flatten();

        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut dbtx = self.db.begin()?;
        match dbtx.get_tx(&txid)? {
            Some(mut existing) => {
                if height.is_some() && existing.height != height {
                    existing.height = height;
                    dbtx.put_tx(&txid, &existing)?;
                }
            }
            None => {
                dbtx.put_tx(
                    &txid,
                    &TransactionEntry {
                        transaction: transaction.clone(),
                        height,
                        first_seen: unix_now(),
                        abandoned: false,
                    },
                )?;
                tracing::debug!(%txid, ?height, "Stored new transaction");
            }
        }

        for input in &transaction.input {
            if input.previous_output.is_null() {
                continue;
            }
            let prev_txid = input.previous_output.txid;
            if dbtx.get_tx(&prev_txid)?.is_some() {
                continue;
            }
            let fetch = {
                let mut requested = self.requested.lock().expect("not poisoned");
                match requested.entry(prev_txid) {
                    hash_map::Entry::Occupied(_) => false,
                    hash_map::Entry::Vacant(vacant) => {
                        vacant.insert(None);
                        true
                    }
                }
            };
            if fetch {
                self.schedule_tx_fetch(prev_txid);
            }
        }

        dbtx.commit()?;
        Ok(())
    }

    pub fn balance(&self) -> Result<Balance> {
        let dbtx = self.db.begin()?;
        let ledger = Ledger::load(&*dbtx)?;
        let tip = self.headers.tip_height();

        let mut confirmed = 0u64;
        let mut unconfirmed = 0u64;
        for output in ledger.unspent_owned_outputs(tip) {
            if output.confirmed {
                confirmed += output.value.to_sat();
            } else {
                unconfirmed += output.value.to_sat();
            }
        }

        Ok(Balance {
            confirmed: Amount::from_sat(confirmed),
            unconfirmed: Amount::from_sat(unconfirmed),
        })
    }

    /// Snapshot of the derived UTXO view in deterministic order: ascending
    /// confirmation height with unconfirmed outputs last, ties broken by
    /// `(txid, vout)`.
    pub fn spendable_outputs(&self) -> Result<Vec<SpendableOutput>> {
        let dbtx = self.db.begin()?;
        let ledger = Ledger::load(&*dbtx)?;
        let tip = self.headers.tip_height();

        let mut outputs = ledger.unspent_owned_outputs(tip);
        outputs.sort_by(|a, b| {
            let height_a = a.height.filter(|_| a.confirmed).unwrap_or(u32::MAX);
            let height_b = b.height.filter(|_| b.confirmed).unwrap_or(u32::MAX);
            height_a
                .cmp(&height_b)
                .then_with(|| a.outpoint.txid.to_string().cmp(&b.outpoint.txid.to_string()))
                .then_with(|| a.outpoint.vout.cmp(&b.outpoint.vout))
        });
        Ok(outputs)
    }

    /// The transaction listing, newest first. `is_change` classifies owned
    /// output scripts by branch.
    pub fn transactions(
        &self,
        is_change: &dyn Fn(&ScriptHashHex) -> bool,
    ) -> Result<Vec<TxInfo>> {
        let dbtx = self.db.begin()?;
        let ledger = Ledger::load(&*dbtx)?;
        let tip = self.headers.tip_height();

        let mut infos = Vec::new();
        for (txid, entry) in &ledger.entries {
            let mut sum_all_out = 0u64;
            let mut sum_ours_out = 0u64;
            let mut sum_non_change_ours_out = 0u64;
            for output in &entry.transaction.output {
                let value = output.value.to_sat();
                sum_all_out += value;
                let script_hash = ScriptHashHex::from_script(&output.script_pubkey);
                if ledger.owned.contains(&script_hash) {
                    sum_ours_out += value;
                    if !is_change(&script_hash) {
                        sum_non_change_ours_out += value;
                    }
                }
            }

            let mut sum_in = 0u64;
            let mut sum_ours_in = 0u64;
            let mut inputs_resolved = true;
            let mut all_inputs_ours = true;
            for input in &entry.transaction.input {
                match ledger.resolve(&input.previous_output) {
                    Some(prev_output) => {
                        sum_in += prev_output.value.to_sat();
                        let script_hash = ScriptHashHex::from_script(&prev_output.script_pubkey);
                        if ledger.owned.contains(&script_hash) {
                            sum_ours_in += prev_output.value.to_sat();
                        } else {
                            all_inputs_ours = false;
                        }
                    }
                    None => {
                        inputs_resolved = false;
                        all_inputs_ours = false;
                    }
                }
            }

            if sum_ours_out == 0 && sum_ours_in == 0 {
                // Dependency-only record, not a transaction of this account.
                continue;
            }

            let fee = (inputs_resolved && all_inputs_ours)
                .then(|| Amount::from_sat(sum_in - sum_all_out));

            let (tx_type, amount) = if sum_ours_in == 0 {
                (TxType::Receive, sum_ours_out)
            } else if sum_ours_out == sum_all_out {
                (TxType::SendToSelf, sum_non_change_ours_out)
            } else {
                (TxType::Send, sum_all_out - sum_ours_out)
            };

            let confirmed_at = entry.height.filter(|&height| height <= tip);
            let status = if entry.abandoned {
                TxStatus::Abandoned
            } else if confirmed_at.is_some() {
                TxStatus::Confirmed
            } else {
                TxStatus::Pending
            };

            infos.push(TxInfo {
                txid: *txid,
                tx_type,
                amount: Amount::from_sat(amount),
                fee,
                height: entry.height,
                num_confirmations: confirmed_at.map_or(0, |height| tip - height + 1),
                status,
                first_seen: entry.first_seen,
            });
        }

        infos.sort_by(|a, b| {
            let height_a = a.height.unwrap_or(u32::MAX);
            let height_b = b.height.unwrap_or(u32::MAX);
            height_b
                .cmp(&height_a)
                .then_with(|| a.txid.to_string().cmp(&b.txid.to_string()))
        });
        Ok(infos)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// In-memory view over the store used to derive balances and listings.
struct Ledger {
    entries: Vec<(Txid, TransactionEntry)>,
    by_txid: HashMap<Txid, usize>,
    owned: HashSet<ScriptHashHex>,
    /// Outpoints consumed by any non-abandoned stored transaction.
    spent: HashSet<OutPoint>,
}

impl Ledger {
    fn load(dbtx: &dyn DatabaseTx) -> Result<Self> {
        let owned: HashSet<ScriptHashHex> = dbtx.owned_script_hashes()?.into_iter().collect();
        let entries = dbtx.all_txs().context("failed to load transactions")?;

        let by_txid = entries
            .iter()
            .enumerate()
            .map(|(index, (txid, _))| (*txid, index))
            .collect();
        let spent = entries
            .iter()
            .filter(|(_, entry)| !entry.abandoned)
            .flat_map(|(_, entry)| entry.transaction.input.iter())
            .map(|input| input.previous_output)
            .collect();

        Ok(Self {
            entries,
            by_txid,
            owned,
            spent,
        })
    }

    fn resolve(&self, outpoint: &OutPoint) -> Option<&bitcoin::TxOut> {
        let index = self.by_txid.get(&outpoint.txid)?;
        self.entries[*index]
            .1
            .transaction
            .output
            .get(outpoint.vout as usize)
    }

    fn unspent_owned_outputs(&self, tip: u32) -> Vec<SpendableOutput> {
        let mut outputs = Vec::new();
        for (txid, entry) in &self.entries {
            if entry.abandoned {
                continue;
            }
            for (vout, output) in entry.transaction.output.iter().enumerate() {
                let script_hash = ScriptHashHex::from_script(&output.script_pubkey);
                if !self.owned.contains(&script_hash) {
                    continue;
                }
                let outpoint = OutPoint::new(*txid, vout as u32);
                if self.spent.contains(&outpoint) {
                    continue;
                }
                outputs.push(SpendableOutput {
                    outpoint,
                    value: output.value,
                    script_hash,
                    height: entry.height,
                    confirmed: entry.height.map_or(false, |height| height <= tip),
                });
            }
        }
        outputs
    }
}
