use bitcoin::absolute::LockTime;
use bitcoin::bip32::DerivationPath;
use bitcoin::key::CompressedPublicKey;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::addresses::AddressType;

/// Outputs below this value are not worth creating.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProposalError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("requested output is below the dust limit")]
    DustOutput,
    #[error("no fee estimate available for target {0}")]
    FeeUnavailable(super::fees::FeeTargetCode),
}

/// Amount requested for a proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendAmount {
    Exact(Amount),
    /// Drain every eligible coin into the recipient output.
    All,
}

/// A spendable coin offered to the selection, annotated with everything the
/// signer will need.
#[derive(Clone, Debug)]
pub struct CandidateUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub keypath: DerivationPath,
    pub address_type: AddressType,
    pub public_key: CompressedPublicKey,
    /// Confirmation height; `None` for unconfirmed coins.
    pub height: Option<u32>,
}

/// A fully determined, unsigned transaction proposal.
#[derive(Clone, Debug)]
pub struct TxProposal {
    pub transaction: Transaction,
    /// Amount paid to the recipient.
    pub amount: Amount,
    pub fee: Amount,
    /// Selected coins, in input order.
    pub selected: Vec<CandidateUtxo>,
    /// Value of the change output, absent when no change was created.
    pub change_amount: Option<Amount>,
}

/// Input annotation handed to the signer alongside the unsigned
/// transaction.
#[derive(Clone, Debug)]
pub struct SigningInput {
    pub prev_value: Amount,
    pub prev_script: ScriptBuf,
    pub keypath: DerivationPath,
    pub address_type: AddressType,
    pub public_key: CompressedPublicKey,
}

/// The hand-off format for the external signer: the unsigned transaction
/// plus per-input previous outputs and derivation paths. The signer fills
/// in script sigs and witnesses in place.
#[derive(Clone, Debug)]
pub struct ProposedTransaction {
    pub transaction: Transaction,
    pub inputs: Vec<SigningInput>,
}

impl TxProposal {
    pub fn into_proposed(self) -> ProposedTransaction {
        let inputs = self
            .selected
            .iter()
            .map(|utxo| SigningInput {
                prev_value: utxo.value,
                prev_script: utxo.script_pubkey.clone(),
                keypath: utxo.keypath.clone(),
                address_type: utxo.address_type,
                public_key: utxo.public_key,
            })
            .collect();
        ProposedTransaction {
            transaction: self.transaction,
            inputs,
        }
    }
}

/// Build a transaction proposal paying `recipient_script`.
///
/// Coins are selected oldest-first (ascending confirmation height,
/// unconfirmed last) with ties broken by `(txid, vout)`; the policy is fully
/// deterministic. For [`SendAmount::Exact`] the fee is iterated to a fixed
/// point of the estimated size and a change output to `change_script` is
/// created when the remainder stays above the dust limit (a sub-dust
/// remainder is folded into the fee). [`SendAmount::All`] spends every
/// candidate and creates no change.
pub fn new_tx_proposal(
    recipient_script: &Script,
    amount: SendAmount,
    fee_rate_per_kb: Amount,
    candidates: Vec<CandidateUtxo>,
    change_script: &Script,
) -> Result<TxProposal, ProposalError> {
    let mut candidates = candidates;
    candidates.sort_by(|a, b| {
        let height_a = a.height.unwrap_or(u32::MAX);
        let height_b = b.height.unwrap_or(u32::MAX);
        height_a
            .cmp(&height_b)
            .then_with(|| a.outpoint.txid.to_string().cmp(&b.outpoint.txid.to_string()))
            .then_with(|| a.outpoint.vout.cmp(&b.outpoint.vout))
    });

    match amount {
        SendAmount::All => propose_drain(recipient_script, fee_rate_per_kb, candidates),
        SendAmount::Exact(amount) => propose_exact(
            recipient_script,
            amount,
            fee_rate_per_kb,
            candidates,
            change_script,
        ),
    }
}

fn propose_drain(
    recipient_script: &Script,
    fee_rate_per_kb: Amount,
    candidates: Vec<CandidateUtxo>,
) -> Result<TxProposal, ProposalError> {
    if candidates.is_empty() {
        return Err(ProposalError::InsufficientFunds);
    }

    let sum: u64 = candidates.iter().map(|utxo| utxo.value.to_sat()).sum();
    let vsize = estimate_vsize(&candidates, &[recipient_script]);
    let fee = fee_for_vsize(fee_rate_per_kb, vsize).to_sat();
    let output = sum.checked_sub(fee).ok_or(ProposalError::InsufficientFunds)?;
    if output < DUST_LIMIT.to_sat() {
        return Err(ProposalError::DustOutput);
    }

    let transaction = build_transaction(
        &candidates,
        vec![TxOut {
            value: Amount::from_sat(output),
            script_pubkey: recipient_script.to_owned(),
        }],
    );
    Ok(TxProposal {
        transaction,
        amount: Amount::from_sat(output),
        fee: Amount::from_sat(fee),
        selected: candidates,
        change_amount: None,
    })
}

fn propose_exact(
    recipient_script: &Script,
    amount: Amount,
    fee_rate_per_kb: Amount,
    candidates: Vec<CandidateUtxo>,
    change_script: &Script,
) -> Result<TxProposal, ProposalError> {
    if amount < DUST_LIMIT {
        return Err(ProposalError::DustOutput);
    }
    let amount_sat = amount.to_sat();

    let mut remaining = candidates.into_iter();
    let mut selected: Vec<CandidateUtxo> = Vec::new();
    let mut sum = 0u64;
    let mut fee = 0u64;

    loop {
        while sum < amount_sat + fee {
            let utxo = remaining.next().ok_or(ProposalError::InsufficientFunds)?;
            sum += utxo.value.to_sat();
            selected.push(utxo);
        }

        // Fee at the size the transaction would have with a change output;
        // the fixed point is reached once the current selection still covers
        // it.
        let vsize = estimate_vsize(&selected, &[recipient_script, change_script]);
        let fee_with_change = fee_for_vsize(fee_rate_per_kb, vsize).to_sat();
        if sum < amount_sat + fee_with_change {
            fee = fee_with_change;
            continue;
        }

        let change = sum - amount_sat - fee_with_change;
        let (fee, change_amount) = if change >= DUST_LIMIT.to_sat() {
            (fee_with_change, Some(change))
        } else {
            // Not worth a change output: the remainder goes to the miners.
            (sum - amount_sat, None)
        };

        let mut outputs = vec![TxOut {
            value: amount,
            script_pubkey: recipient_script.to_owned(),
        }];
        if let Some(change_amount) = change_amount {
            outputs.push(TxOut {
                value: Amount::from_sat(change_amount),
                script_pubkey: change_script.to_owned(),
            });
        }

        let transaction = build_transaction(&selected, outputs);
        return Ok(TxProposal {
            transaction,
            amount,
            fee: Amount::from_sat(fee),
            selected,
            change_amount: change_amount.map(Amount::from_sat),
        });
    }
}

fn build_transaction(selected: &[CandidateUtxo], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Per-input serialized sizes: non-witness bytes and witness bytes. The
/// script-sig and witness sizes assume a 72-byte DER signature.
fn input_sizes(address_type: AddressType) -> (u64, u64) {
    match address_type {
        // outpoint (36) + script len (1) + sig + pubkey push (107) + sequence (4)
        AddressType::Legacy => (148, 0),
        // outpoint (36) + redeem script push (24) + sequence (4); witness
        // carries sig + pubkey
        AddressType::WrappedSegwit => (64, 108),
        // outpoint (36) + empty script (1) + sequence (4)
        AddressType::Segwit => (41, 108),
    }
}

fn output_size(script: &Script) -> u64 {
    // value (8) + script length varint (1, scripts here are short) + script
    8 + 1 + script.len() as u64
}

/// Estimated virtual size of the fully signed transaction.
fn estimate_vsize(inputs: &[CandidateUtxo], output_scripts: &[&Script]) -> u64 {
    // version (4) + locktime (4) + input/output count varints (1 + 1)
    let mut base: u64 = 10;
    let mut witness_total: u64 = 0;
    for input in inputs {
        let (input_base, witness) = input_sizes(input.address_type);
        base += input_base;
        witness_total += witness;
    }
    for script in output_scripts {
        base += output_size(script);
    }

    let mut weight = base * 4 + witness_total;
    if witness_total > 0 {
        // Segwit marker and flag bytes.
        weight += 2;
    }
    weight.div_ceil(4)
}

fn fee_for_vsize(fee_rate_per_kb: Amount, vsize: u64) -> Amount {
    Amount::from_sat((vsize * fee_rate_per_kb.to_sat()).div_ceil(1000))
}
