pub mod sled;

use anyhow::Result;
use bitcoin::Txid;

use crate::blockchain::{ScriptHashHex, TxHistory};
use crate::transactions::TransactionEntry;

/// Durable, transactional store of raw transactions and per-address
/// histories.
///
/// Every top-level engine activation opens exactly one write transaction;
/// queries open one as well and simply drop it. Writes staged on a
/// [`DatabaseTx`] become visible to other transactions only after
/// [`DatabaseTx::commit`], and dropping an uncommitted transaction rolls it
/// back.
pub trait Database: Send + Sync {
    fn begin(&self) -> Result<Box<dyn DatabaseTx>>;
}

pub trait DatabaseTx: Send {
    fn get_tx(&self, txid: &Txid) -> Result<Option<TransactionEntry>>;

    fn put_tx(&mut self, txid: &Txid, entry: &TransactionEntry) -> Result<()>;

    /// Every stored transaction, staged writes included. Order is
    /// unspecified.
    fn all_txs(&self) -> Result<Vec<(Txid, TransactionEntry)>>;

    /// Stored history of `script_hash`; empty if the address was never
    /// subscribed.
    fn address_history(&self, script_hash: &ScriptHashHex) -> Result<TxHistory>;

    fn put_address_history(
        &mut self,
        script_hash: &ScriptHashHex,
        history: &TxHistory,
    ) -> Result<()>;

    /// The script hashes of every address known to the store (the keys of
    /// the history column family). These are the scripts the wallet owns.
    fn owned_script_hashes(&self) -> Result<Vec<ScriptHashHex>>;

    /// Atomically apply all staged writes.
    fn commit(self: Box<Self>) -> Result<()>;
}
