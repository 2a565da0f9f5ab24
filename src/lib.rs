//! Deterministic wallet account engine for Bitcoin-like UTXO chains.
//!
//! Given an extended public key, the [`account::Account`] engine discovers
//! every address the account has ever used (gap-limit scanning), keeps the
//! per-address histories in sync with an Electrum-model indexer, maintains
//! the resulting transaction set and balances in a durable store, and builds
//! signed transaction proposals at requested fee targets.
//!
//! The signing device ([`keystore::Keystore`]), the indexer transport
//! ([`blockchain::Blockchain`]), the header oracle ([`headers::Headers`]) and
//! the key-value store ([`db::Database`]) are boundaries; production
//! implementations are provided for the indexer ([`blockchain::electrum`])
//! and the store ([`db::sled`]).

pub mod account;
pub mod addresses;
pub mod blockchain;
pub mod db;
pub mod headers;
pub mod keystore;
pub mod synchronizer;
pub mod transactions;

pub use account::{Account, Event};
pub use transactions::Balance;

/// Number of unused receive addresses kept derived beyond the last used one.
pub const GAP_LIMIT: u32 = 20;

/// Gap limit of the change chain. Change addresses are only ever produced by
/// our own transactions, so a small window is sufficient.
pub const CHANGE_GAP_LIMIT: u32 = 6;
