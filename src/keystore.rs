use anyhow::Result;
use bitcoin::bip32::{DerivationPath, Xpub};

use crate::account::maketx::ProposedTransaction;
use crate::addresses::AddressType;

/// Static configuration of a keystore, as reported by the device.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub account_keypath: DerivationPath,
    pub address_type: AddressType,
}

/// The signing device (or software key store) backing an account.
///
/// Only public key material ever crosses this boundary in the outbound
/// direction; signing happens on the other side against the prev-output
/// annotations carried by the proposal.
pub trait Keystore: Send + Sync {
    /// The extended public key at `keypath`. Implementations must never
    /// yield private material.
    fn extended_public_key(&self, keypath: &DerivationPath) -> Result<Xpub>;

    /// Sign every input of the proposed transaction in place.
    fn sign_transaction(&self, proposal: &mut ProposedTransaction) -> Result<()>;

    fn identifier(&self) -> Result<String>;

    /// Whether the device can display the outputs for user verification.
    fn has_secure_output(&self) -> bool;

    fn cosigner_index(&self) -> u32;

    fn configuration(&self) -> Configuration;
}
