use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bitcoin::Txid;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use crate::blockchain::{ScriptHashHex, TxHistory};
use crate::db::{Database, DatabaseTx};
use crate::transactions::TransactionEntry;

const TX_TREE: &str = "tx";
const HIST_TREE: &str = "hist";

/// Store backed by two sled trees: `tx` (txid → entry) and `hist`
/// (script hash → ordered history).
pub struct SledDatabase {
    db: sled::Db,
    tx_tree: sled::Tree,
    hist_tree: sled::Tree,
}

impl SledDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Opening transactions database");

        let db = sled::open(path)
            .with_context(|| format!("could not open the store at {}", path.display()))?;
        let tx_tree = db.open_tree(TX_TREE)?;
        let hist_tree = db.open_tree(HIST_TREE)?;

        Ok(Self {
            db,
            tx_tree,
            hist_tree,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Database for SledDatabase {
    fn begin(&self) -> Result<Box<dyn DatabaseTx>> {
        Ok(Box::new(SledTx {
            tx_tree: self.tx_tree.clone(),
            hist_tree: self.hist_tree.clone(),
            staged_tx: BTreeMap::new(),
            staged_hist: BTreeMap::new(),
        }))
    }
}

/// Write transaction over the sled trees. Writes are staged in memory and
/// applied in a single multi-tree sled transaction on commit; reads see the
/// staged writes layered over the trees.
struct SledTx {
    tx_tree: sled::Tree,
    hist_tree: sled::Tree,
    staged_tx: BTreeMap<Vec<u8>, Vec<u8>>,
    staged_hist: BTreeMap<Vec<u8>, Vec<u8>>,
}

fn tx_key(txid: &Txid) -> Vec<u8> {
    txid.to_string().into_bytes()
}

fn hist_key(script_hash: &ScriptHashHex) -> Vec<u8> {
    script_hash.as_str().as_bytes().to_vec()
}

impl SledTx {
    fn read(
        &self,
        tree: &sled::Tree,
        staged: &BTreeMap<Vec<u8>, Vec<u8>>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(value) = staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(tree.get(key)?.map(|ivec| ivec.to_vec()))
    }
}

impl DatabaseTx for SledTx {
    fn get_tx(&self, txid: &Txid) -> Result<Option<TransactionEntry>> {
        match self.read(&self.tx_tree, &self.staged_tx, &tx_key(txid))? {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).context("corrupt transaction entry")?,
            )),
            None => Ok(None),
        }
    }

    fn put_tx(&mut self, txid: &Txid, entry: &TransactionEntry) -> Result<()> {
        self.staged_tx
            .insert(tx_key(txid), serde_json::to_vec(entry)?);
        Ok(())
    }

    fn all_txs(&self) -> Result<Vec<(Txid, TransactionEntry)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.tx_tree.iter() {
            let (key, value) = item?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, value) in &self.staged_tx {
            merged.insert(key.clone(), value.clone());
        }

        merged
            .into_iter()
            .map(|(key, value)| {
                let txid: Txid = String::from_utf8(key)
                    .context("corrupt transaction key")?
                    .parse()
                    .context("corrupt transaction key")?;
                let entry = serde_json::from_slice(&value).context("corrupt transaction entry")?;
                Ok((txid, entry))
            })
            .collect()
    }

    fn address_history(&self, script_hash: &ScriptHashHex) -> Result<TxHistory> {
        match self.read(&self.hist_tree, &self.staged_hist, &hist_key(script_hash))? {
            Some(raw) => serde_json::from_slice(&raw).context("corrupt address history"),
            None => Ok(TxHistory::default()),
        }
    }

    fn put_address_history(
        &mut self,
        script_hash: &ScriptHashHex,
        history: &TxHistory,
    ) -> Result<()> {
        self.staged_hist
            .insert(hist_key(script_hash), serde_json::to_vec(history)?);
        Ok(())
    }

    fn owned_script_hashes(&self) -> Result<Vec<ScriptHashHex>> {
        let mut keys: Vec<Vec<u8>> = self
            .hist_tree
            .iter()
            .keys()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|ivec| ivec.to_vec())
            .collect();
        for key in self.staged_hist.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        keys.into_iter()
            .map(|key| {
                Ok(ScriptHashHex::from(
                    String::from_utf8(key).context("corrupt history key")?,
                ))
            })
            .collect()
    }

    fn commit(self: Box<Self>) -> Result<()> {
        (&self.tx_tree, &self.hist_tree)
            .transaction(|(tx_tree, hist_tree)| {
                for (key, value) in &self.staged_tx {
                    tx_tree.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &self.staged_hist {
                    hist_tree.insert(key.as_slice(), value.as_slice())?;
                }
                Ok::<_, ConflictableTransactionError<Infallible>>(())
            })
            .map_err(|error| anyhow!("failed to commit store transaction: {error}"))?;
        Ok(())
    }
}
