use crate::error::ProveError;
use bitcoin::{Amount, ScriptBuf};
use charms_client::{
    NormalizedSpell,
    tx::{EnchantedTx, Tx},
};
use charms_data::{TxId, UtxoId};
use std::collections::BTreeMap;

/// A spell input resolved to the output it spends.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundInput {
    pub utxo_id: UtxoId,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

/// Index the supplied previous transactions by their ID, failing if the same
/// transaction is supplied more than once.
pub fn by_txid_strict(prev_txs: &[Tx]) -> Result<BTreeMap<TxId, Tx>, ProveError> {
    let mut prev_txs_by_id = BTreeMap::new();
    for prev_tx in prev_txs {
        let tx_id = prev_tx.tx_id();
        if prev_txs_by_id.insert(tx_id.clone(), prev_tx.clone()).is_some() {
            return Err(ProveError::AmbiguousBinding(tx_id));
        }
    }
    Ok(prev_txs_by_id)
}

/// Resolve every spell input and reference to the concrete output it spends.
/// Fails with `UnresolvedInput` if the creating transaction is missing from
/// `prev_txs_by_id` or does not have the referenced output.
pub fn bind_inputs(
    spell: &NormalizedSpell,
    prev_txs_by_id: &BTreeMap<TxId, Tx>,
) -> Result<Vec<BoundInput>, ProveError> {
    let spell_ins = spell
        .tx
        .ins
        .as_ref()
        .ok_or_else(|| ProveError::MalformedSpell("spell.tx.ins must be present".to_string()))?;

    spell_ins
        .iter()
        .chain(spell.tx.refs.iter().flatten())
        .map(|utxo_id| bind_input(utxo_id, prev_txs_by_id))
        .collect()
}

fn bind_input(
    utxo_id: &UtxoId,
    prev_txs_by_id: &BTreeMap<TxId, Tx>,
) -> Result<BoundInput, ProveError> {
    let prev_tx = prev_txs_by_id
        .get(&utxo_id.0)
        .ok_or_else(|| ProveError::UnresolvedInput(utxo_id.clone()))?;
    let Tx::Bitcoin(prev_tx) = prev_tx;
    let tx_out = prev_tx
        .inner()
        .output
        .get(utxo_id.1 as usize)
        .ok_or_else(|| ProveError::UnresolvedInput(utxo_id.clone()))?;
    Ok(BoundInput {
        utxo_id: utxo_id.clone(),
        value: tx_out.value,
        script_pubkey: tx_out.script_pubkey.clone(),
    })
}

/// The funding UTXO pays for the transaction pair; it may not coincide with
/// anything the spell itself spends or references.
pub fn ensure_funding_distinct(
    spell: &NormalizedSpell,
    funding_utxo: &UtxoId,
) -> Result<(), ProveError> {
    let overlaps = (spell.tx.ins.iter().flatten())
        .chain(spell.tx.refs.iter().flatten())
        .any(|utxo_id| utxo_id == funding_utxo);
    if overlaps {
        return Err(ProveError::OverlapViolation(funding_utxo.clone()));
    }
    Ok(())
}
