use crate::{
    error::ProveError,
    script::{control_block, data_script, taproot_spend_info},
    tx::TransactionPair,
};
use bitcoin::{
    Address, Amount, FeeRate, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid, Weight,
    Witness, absolute::LockTime, hashes::Hash, transaction::Version,
};
use charms_client::{
    NormalizedSpell, NormalizedTransaction,
    bitcoin_tx::BitcoinTx,
    tx::Tx,
};
use charms_data::{TxId, UtxoId};
use std::{collections::BTreeMap, str::FromStr};

/// Outputs below this are not relayed by default.
const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Weight of a commit transaction spending one Taproot output: 111 vbytes.
const COMMIT_TX_VBYTES: u64 = 111;

/// Build the commit/spell transaction pair for a proven spell.
///
/// The commit transaction spends the funding UTXO into a Taproot output whose
/// only script leaf carries `spell_data` (the spell and its proof). The spell
/// transaction spends the spell's inputs plus that output (as its last input,
/// witness already attached), creates the spell's outputs, and sends any
/// remaining sats above the dust limit to `change_address`.
///
/// Both transactions are deterministic functions of the arguments: the commit
/// output uses the BIP-341 NUMS internal key and the envelope script reduces
/// to `OP_TRUE`, so no key material is involved. Only the spell's own inputs
/// and the funding input still need signatures.
pub fn make_transaction_pair(
    norm_spell: &NormalizedSpell,
    spell_data: &[u8],
    funding_utxo: &UtxoId,
    funding_utxo_value: u64,
    change_address: &str,
    fee_rate: f64,
    prev_txs_by_id: &BTreeMap<TxId, Tx>,
) -> Result<TransactionPair, ProveError> {
    let change_pubkey = Address::from_str(change_address)
        .map_err(|e| ProveError::Other(e.into()))?
        .assume_checked()
        .script_pubkey();
    let fee_rate = FeeRate::from_sat_per_kwu((fee_rate * 250.0) as u64);

    let script = data_script(spell_data);
    let funding_out_point = out_point(funding_utxo);

    let commit_tx = create_commit_tx(funding_out_point, funding_utxo_value, &script, fee_rate)?;
    let commit_txout = &commit_tx.output[0];

    let mut spell_tx = from_spell(norm_spell)?;

    let change_amount = compute_change_amount(
        fee_rate,
        script.len(),
        &spell_tx,
        prev_txs_by_id,
        commit_txout.value,
    )?;

    attach_commit_input(
        &mut spell_tx,
        commit_tx.compute_txid(),
        change_pubkey,
        change_amount,
        script,
    );

    Ok(TransactionPair {
        commit_tx: Tx::Bitcoin(BitcoinTx(commit_tx)),
        spell_tx: Tx::Bitcoin(BitcoinTx(spell_tx)),
    })
}

fn create_commit_tx(
    funding_out_point: OutPoint,
    funding_output_value: u64,
    script: &ScriptBuf,
    fee_rate: FeeRate,
) -> Result<Transaction, ProveError> {
    let fee = fee_rate
        .fee_vb(COMMIT_TX_VBYTES)
        .ok_or_else(|| ProveError::Other(anyhow::anyhow!("fee overflow")))?;

    let funding_output_value = Amount::from_sat(funding_output_value);
    let commit_value = funding_output_value
        .checked_sub(fee)
        .filter(|value| *value >= DUST_LIMIT)
        .ok_or(ProveError::InsufficientFunds {
            required: (fee + DUST_LIMIT).to_sat(),
            available: funding_output_value.to_sat(),
        })?;

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding_out_point,
            script_sig: Default::default(),
            sequence: Default::default(),
            witness: Default::default(),
        }],
        output: vec![TxOut {
            value: commit_value,
            script_pubkey: ScriptBuf::new_p2tr_tweaked(
                taproot_spend_info(script.clone()).output_key(),
            ),
        }],
    })
}

/// Change left after the spell transaction pays its own fee out of the commit
/// output and its inputs. The fee estimate accounts for the spell input's
/// witness (script plus control block, no signature) and one signature per
/// remaining input.
fn compute_change_amount(
    fee_rate: FeeRate,
    script_len: usize,
    tx: &Transaction,
    prev_txs_by_id: &BTreeMap<TxId, Tx>,
    commit_txout_value: Amount,
) -> Result<Amount, ProveError> {
    let script_input_weight = Weight::from_wu(script_len as u64 + 202);
    let change_output_weight = Weight::from_wu(172);
    let signatures_weight = Weight::from_wu(66) * tx.input.len() as u64;

    let total_tx_weight = tx.weight()
        + Weight::from_wu(2)
        + signatures_weight
        + script_input_weight
        + change_output_weight;

    let fee = fee_rate
        .fee_wu(total_tx_weight)
        .ok_or_else(|| ProveError::Other(anyhow::anyhow!("fee overflow")))?;

    let tx_amount_in = tx_total_amount_in(prev_txs_by_id, tx)?;
    let tx_amount_out = tx_total_amount_out(tx);

    let available = commit_txout_value + tx_amount_in;
    let required = tx_amount_out + fee;
    available
        .checked_sub(required)
        .ok_or(ProveError::InsufficientFunds {
            required: required.to_sat(),
            available: available.to_sat(),
        })
}

fn attach_commit_input(
    tx: &mut Transaction,
    commit_txid: Txid,
    change_script_pubkey: ScriptBuf,
    change_amount: Amount,
    script: ScriptBuf,
) {
    let witness = Witness::from_slice(&[script.to_bytes(), control_block(script).serialize()]);
    tx.input.push(TxIn {
        previous_output: OutPoint {
            txid: commit_txid,
            vout: 0,
        },
        script_sig: Default::default(),
        sequence: Default::default(),
        witness,
    });

    // sub-dust change goes to fee
    if change_amount >= DUST_LIMIT {
        tx.output.push(TxOut {
            value: change_amount,
            script_pubkey: change_script_pubkey,
        });
    }
}

pub fn tx_total_amount_in(
    prev_txs_by_id: &BTreeMap<TxId, Tx>,
    tx: &Transaction,
) -> Result<Amount, ProveError> {
    let mut total = Amount::ZERO;
    for tx_in in &tx.input {
        let utxo_id = UtxoId(
            TxId(tx_in.previous_output.txid.to_byte_array()),
            tx_in.previous_output.vout,
        );
        let Some(Tx::Bitcoin(prev_tx)) = prev_txs_by_id.get(&utxo_id.0) else {
            return Err(ProveError::UnresolvedInput(utxo_id));
        };
        let tx_out = prev_tx
            .inner()
            .output
            .get(utxo_id.1 as usize)
            .ok_or_else(|| ProveError::UnresolvedInput(utxo_id.clone()))?;
        total += tx_out.value;
    }
    Ok(total)
}

pub fn tx_total_amount_out(tx: &Transaction) -> Amount {
    tx.output.iter().map(|tx_out| tx_out.value).sum::<Amount>()
}

fn out_point(utxo_id: &UtxoId) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array(utxo_id.0.0),
        vout: utxo_id.1,
    }
}

pub fn tx_input(ins: &[UtxoId]) -> Vec<TxIn> {
    ins.iter()
        .map(|utxo_id| TxIn {
            previous_output: out_point(utxo_id),
            script_sig: Default::default(),
            sequence: Default::default(),
            witness: Default::default(),
        })
        .collect()
}

pub fn tx_output(tx: &NormalizedTransaction) -> Result<Vec<TxOut>, ProveError> {
    let coins = tx.coins.as_ref().ok_or_else(|| {
        ProveError::MalformedSpell("spell.tx.coins must be present".to_string())
    })?;
    if coins.len() != tx.outs.len() {
        return Err(ProveError::MalformedSpell(
            "spell.tx.coins must have one entry per output".to_string(),
        ));
    }
    Ok(coins
        .iter()
        .map(|coin| TxOut {
            value: Amount::from_sat(coin.amount),
            script_pubkey: ScriptBuf::from_bytes(coin.dest.clone()),
        })
        .collect())
}

/// The unsigned spell transaction before the commit input is attached:
/// the spell's inputs in order, and one output per spell output.
pub fn from_spell(norm_spell: &NormalizedSpell) -> Result<Transaction, ProveError> {
    let ins = norm_spell.tx.ins.as_ref().ok_or_else(|| {
        ProveError::MalformedSpell("spell.tx.ins must be present".to_string())
    })?;
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_input(ins),
        output: tx_output(&norm_spell.tx)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use charms_client::{NormalizedSpell, tx::EnchantedTx};
    use charms_data::NativeOutput;

    const CHANGE_ADDRESS: &str = "bcrt1q6u6qyya3sryhh42lahtnz2m7zuufe7dlt8j0j5";

    fn mint_spell() -> NormalizedSpell {
        let mut norm_spell = NormalizedSpell::default();
        norm_spell.tx.ins = Some(vec![]);
        norm_spell.tx.outs = vec![Default::default()];
        norm_spell.tx.coins = Some(vec![NativeOutput {
            amount: 1000,
            dest: Address::from_str(CHANGE_ADDRESS)
                .unwrap()
                .assume_checked()
                .script_pubkey()
                .into_bytes(),
        }]);
        norm_spell
    }

    fn make_pair(funding_value: u64) -> Result<TransactionPair, ProveError> {
        let norm_spell = mint_spell();
        let spell_data = charms_data::util::write(&(&norm_spell, vec![7u8; 128])).unwrap();
        make_transaction_pair(
            &norm_spell,
            &spell_data,
            &UtxoId(TxId([1u8; 32]), 0),
            funding_value,
            CHANGE_ADDRESS,
            2.0,
            &BTreeMap::new(),
        )
    }

    #[test]
    fn spell_tx_spends_commit_output_last() {
        let pair = make_pair(10_000).unwrap();
        let Tx::Bitcoin(commit_tx) = &pair.commit_tx;
        let Tx::Bitcoin(spell_tx) = &pair.spell_tx;

        assert!(commit_tx.inner().output[0].script_pubkey.is_p2tr());

        let last_in = spell_tx.inner().input.last().unwrap();
        assert_eq!(
            last_in.previous_output,
            OutPoint {
                txid: commit_tx.inner().compute_txid(),
                vout: 0
            }
        );
        // witness carries the envelope script and control block, no signature
        assert_eq!(last_in.witness.len(), 2);
    }

    #[test]
    fn pair_is_deterministic() {
        let a = make_pair(10_000).unwrap();
        let b = make_pair(10_000).unwrap();
        assert_eq!(a.commit_tx.hex(), b.commit_tx.hex());
        assert_eq!(a.spell_tx.hex(), b.spell_tx.hex());
    }

    #[test]
    fn value_is_conserved_between_funding_and_outputs() {
        let funding_value = 10_000;
        let pair = make_pair(funding_value).unwrap();
        let Tx::Bitcoin(commit_tx) = &pair.commit_tx;
        let Tx::Bitcoin(spell_tx) = &pair.spell_tx;

        let commit_out = commit_tx.inner().output[0].value;
        assert!(commit_out < Amount::from_sat(funding_value));

        // spell tx spends only the commit output, so fee = in - out
        let spell_out = tx_total_amount_out(spell_tx.inner());
        assert!(spell_out < commit_out);
        assert!(spell_out >= Amount::from_sat(1000)); // the minted output
    }

    #[test]
    fn insufficient_funding_is_reported() {
        let err = make_pair(200).unwrap_err();
        assert!(matches!(err, ProveError::InsufficientFunds { .. }));
    }

    #[test]
    fn spell_tx_pays_the_requested_fee_rate() {
        let pair = make_pair(100_000).unwrap();
        let Tx::Bitcoin(commit_tx) = &pair.commit_tx;
        let Tx::Bitcoin(spell_tx) = &pair.spell_tx;

        let norm_spell = mint_spell();
        let spell_data = charms_data::util::write(&(&norm_spell, vec![7u8; 128])).unwrap();
        let script = data_script(&spell_data);

        let base_tx = from_spell(&norm_spell).unwrap();
        let estimated_weight = base_tx.weight()
            + Weight::from_wu(2)
            + Weight::from_wu(66) * base_tx.input.len() as u64
            + Weight::from_wu(script.len() as u64 + 202)
            + Weight::from_wu(172);
        let fee = FeeRate::from_sat_per_kwu(500)
            .fee_wu(estimated_weight)
            .unwrap();

        let commit_out = commit_tx.inner().output[0].value;
        let change = spell_tx.inner().output[1].value;
        assert_eq!(change, commit_out - Amount::from_sat(1000) - fee);
    }

    #[test]
    fn sub_dust_change_is_dropped() {
        // funding leaves positive change, but below the dust limit:
        // no change output appears
        let pair_small = make_pair(1_800).unwrap();
        let pair_large = make_pair(100_000).unwrap();
        let Tx::Bitcoin(small) = &pair_small.spell_tx;
        let Tx::Bitcoin(large) = &pair_large.spell_tx;
        assert_eq!(small.inner().output.len(), 1);
        assert_eq!(large.inner().output.len(), 2);
    }

    #[test]
    fn missing_coins_is_malformed() {
        let mut norm_spell = mint_spell();
        norm_spell.tx.coins = None;
        let err = from_spell(&norm_spell).unwrap_err();
        assert!(matches!(err, ProveError::MalformedSpell(_)));
    }
}
