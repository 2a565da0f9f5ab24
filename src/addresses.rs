use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Network, ScriptBuf};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::blockchain::ScriptHashHex;

static SECP: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// Encoding of the addresses derived for an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// Pay-to-pubkey-hash.
    Legacy,
    /// Pay-to-witness-pubkey-hash nested in pay-to-script-hash.
    WrappedSegwit,
    /// Native pay-to-witness-pubkey-hash.
    Segwit,
}

/// One derived address of an account branch.
///
/// The address is identified on the wire by its script hash. The
/// `history_status` mirrors the indexer's status digest of the address
/// history; it is written only under the account engine's lock discipline
/// and the empty string means "no history".
pub struct Address {
    address: bitcoin::Address,
    script_pubkey: ScriptBuf,
    script_hash: ScriptHashHex,
    public_key: CompressedPublicKey,
    keypath: DerivationPath,
    address_type: AddressType,
    branch: u32,
    index: u32,
    history_status: RwLock<String>,
}

impl Address {
    fn derive(
        branch_xpub: &Xpub,
        account_keypath: &DerivationPath,
        network: Network,
        address_type: AddressType,
        branch: u32,
        index: u32,
    ) -> Result<Self> {
        let child = ChildNumber::from_normal_idx(index).context("address index out of range")?;
        let xpub = branch_xpub
            .derive_pub(&SECP, &[child])
            .context("failed to derive address key")?;
        let public_key = xpub.to_pub();

        let address = match address_type {
            AddressType::Legacy => bitcoin::Address::p2pkh(public_key.pubkey_hash(), network),
            AddressType::WrappedSegwit => bitcoin::Address::p2shwpkh(&public_key, network),
            AddressType::Segwit => bitcoin::Address::p2wpkh(&public_key, network),
        };
        let script_pubkey = address.script_pubkey();
        let script_hash = ScriptHashHex::from_script(&script_pubkey);
        let keypath = account_keypath.extend([
            ChildNumber::from_normal_idx(branch).expect("branch is 0 or 1"),
            child,
        ]);

        Ok(Self {
            address,
            script_pubkey,
            script_hash,
            public_key,
            keypath,
            address_type,
            branch,
            index,
            history_status: RwLock::new(String::new()),
        })
    }

    pub fn address(&self) -> &bitcoin::Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }

    pub fn script_hash(&self) -> &ScriptHashHex {
        &self.script_hash
    }

    pub fn public_key(&self) -> &CompressedPublicKey {
        &self.public_key
    }

    pub fn keypath(&self) -> &DerivationPath {
        &self.keypath
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn branch(&self) -> u32 {
        self.branch
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn history_status(&self) -> String {
        self.history_status.read().expect("not poisoned").clone()
    }

    pub(crate) fn set_history_status(&self, status: String) {
        *self.history_status.write().expect("not poisoned") = status;
    }

    /// An address is used once its history status is non-empty.
    pub fn is_used(&self) -> bool {
        !self.history_status.read().expect("not poisoned").is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("address", &self.address)
            .field("branch", &self.branch)
            .field("index", &self.index)
            .finish()
    }
}

/// Densely indexed sequence of derived addresses for one branch of an
/// account (0 = receive, 1 = change).
///
/// After [`AddressChain::ensure_addresses`] settles, the suffix of addresses
/// with an empty history is at least `gap_limit` long. Chains only ever
/// grow; re-creating a chain from the same xpub yields identical script
/// hashes at identical indices.
pub struct AddressChain {
    account_keypath: DerivationPath,
    branch_xpub: Xpub,
    network: Network,
    address_type: AddressType,
    gap_limit: u32,
    branch: u32,
    addresses: Vec<Arc<Address>>,
    by_script_hash: HashMap<ScriptHashHex, Arc<Address>>,
}

impl AddressChain {
    pub fn new(
        account_keypath: DerivationPath,
        xpub: Xpub,
        network: Network,
        gap_limit: u32,
        branch: u32,
        address_type: AddressType,
    ) -> Result<Self> {
        let branch_child =
            ChildNumber::from_normal_idx(branch).context("branch index out of range")?;
        let branch_xpub = xpub
            .derive_pub(&SECP, &[branch_child])
            .context("failed to derive branch key")?;

        Ok(Self {
            account_keypath,
            branch_xpub,
            network,
            address_type,
            gap_limit,
            branch,
            addresses: Vec::new(),
            by_script_hash: HashMap::new(),
        })
    }

    /// Extend the chain until the suffix of unused addresses reaches the gap
    /// limit, one address at a time. Returns the newly derived addresses;
    /// an empty result means the chain already satisfied the invariant.
    pub fn ensure_addresses(&mut self) -> Result<Vec<Arc<Address>>> {
        let mut new_addresses = Vec::new();
        while self.unused_tail_len() < self.gap_limit as usize {
            let index = self.addresses.len() as u32;
            let address = Arc::new(Address::derive(
                &self.branch_xpub,
                &self.account_keypath,
                self.network,
                self.address_type,
                self.branch,
                index,
            )?);
            self.addresses.push(address.clone());
            self.by_script_hash
                .insert(address.script_hash().clone(), address.clone());
            new_addresses.push(address);
        }
        Ok(new_addresses)
    }

    fn unused_tail_len(&self) -> usize {
        self.addresses
            .iter()
            .rev()
            .take_while(|address| !address.is_used())
            .count()
    }

    /// The first address with an empty history, if any.
    pub fn get_unused(&self) -> Option<Arc<Address>> {
        self.addresses
            .iter()
            .find(|address| !address.is_used())
            .cloned()
    }

    pub fn lookup_by_script_hash(&self, script_hash: &ScriptHashHex) -> Option<Arc<Address>> {
        self.by_script_hash.get(script_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[Arc<Address>] {
        &self.addresses
    }
}
