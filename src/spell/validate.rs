use super::{prove_spell_tx::ProveSpellTxImpl, request::ProveRequest, required_binary_vks};
use crate::{
    error::ProveError,
    tx::{binder, bitcoin_tx::from_spell},
};
use anyhow::{anyhow, bail, ensure};
use bitcoin::Network;
use charms_client::{NormalizedSpell, SPELL_VK, tx::Tx};
use charms_data::{App, B32, Data, TxId, util};
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

pub fn ensure_exact_app_binaries(
    norm_spell: &NormalizedSpell,
    app_private_inputs: &BTreeMap<App, Data>,
    tx: &charms_data::Transaction,
    binaries: &BTreeMap<B32, Vec<u8>>,
) -> anyhow::Result<()> {
    let required_vks = required_binary_vks(norm_spell, app_private_inputs, tx);
    let provided_vks: BTreeSet<_> = binaries.keys().cloned().collect();

    ensure!(
        required_vks == provided_vks,
        "binaries must contain exactly the required app binaries.\n\
         Required VKs: {:?}\n\
         Provided VKs: {:?}",
        required_vks,
        provided_vks
    );

    Ok(())
}

/// Previous transactions must cover every spell input and reference, and
/// nothing else.
pub fn ensure_all_prev_txs_are_present(
    spell: &NormalizedSpell,
    prev_txs_by_id: &BTreeMap<TxId, Tx>,
) -> Result<(), ProveError> {
    let spell_ins = spell
        .tx
        .ins
        .as_ref()
        .ok_or_else(|| ProveError::MalformedSpell("spell.tx.ins must be present".to_string()))?;

    let mut required_txids = BTreeSet::new();
    required_txids.extend(spell_ins.iter().map(|utxo_id| &utxo_id.0));
    if let Some(refs) = spell.tx.refs.as_ref() {
        required_txids.extend(refs.iter().map(|utxo_id| &utxo_id.0));
    }

    if let Some(utxo_id) = (spell_ins.iter())
        .chain(spell.tx.refs.iter().flatten())
        .find(|utxo_id| !prev_txs_by_id.contains_key(&utxo_id.0))
    {
        return Err(ProveError::UnresolvedInput(utxo_id.clone()));
    }

    let provided_txids: BTreeSet<_> = prev_txs_by_id.keys().collect();
    if required_txids != provided_txids {
        return Err(ProveError::Other(anyhow!(
            "prev_txs must contain exactly the transactions creating spell inputs.\n\
             Required: {:?}\n\
             Provided: {:?}",
            required_txids,
            provided_txids
        )));
    }

    Ok(())
}

fn infer_network(change_address: &str) -> anyhow::Result<Network> {
    let change_address = bitcoin::Address::from_str(change_address)?;
    let network = match &change_address {
        a if a.is_valid_for_network(Network::Bitcoin) => Network::Bitcoin,
        a if a.is_valid_for_network(Network::Testnet4) => Network::Testnet4,
        a if a.is_valid_for_network(Network::Regtest) => Network::Regtest,
        _ => bail!("unsupported network of change address: {:?}", change_address),
    };
    Ok(network)
}

impl ProveSpellTxImpl {
    /// Check a proving request end to end without generating a proof:
    /// resolve the spell against the supplied previous transactions, run
    /// every app over the declared transition, and pre-check that the funds
    /// cover the outputs and fees.
    ///
    /// Anything that would make proving pointless fails here first, with
    /// the precise [`ProveError`] variant.
    pub fn validate_prove_request(
        &self,
        prove_request: &ProveRequest,
    ) -> Result<(NormalizedSpell, charms_data::Transaction), ProveError> {
        let prev_txs = &prove_request.prev_txs;
        let prev_txs_by_id = binder::by_txid_strict(prev_txs)?;

        let norm_spell = &prove_request.spell;
        let app_private_inputs = &prove_request.app_private_inputs;

        binder::ensure_funding_distinct(norm_spell, &prove_request.funding_utxo)?;
        ensure_all_prev_txs_are_present(norm_spell, &prev_txs_by_id)?;
        binder::bind_inputs(norm_spell, &prev_txs_by_id)?;

        let prev_spells = charms_client::prev_spells(prev_txs, SPELL_VK);
        if !charms_client::well_formed(norm_spell, &prev_spells) {
            return Err(ProveError::MalformedSpell(
                "spell is not well-formed against the supplied previous transactions".to_string(),
            ));
        }

        let tx = charms_client::to_tx(norm_spell, &prev_spells);

        ensure_exact_app_binaries(norm_spell, app_private_inputs, &tx, &prove_request.binaries)?;

        self.runner.run_all(
            &prove_request.binaries,
            &tx,
            &norm_spell.app_public_inputs,
            app_private_inputs,
        )?;

        self.pre_check_funds(prove_request, norm_spell, &prev_txs_by_id)?;

        Ok((norm_spell.clone(), tx))
    }

    /// A cheap upper-bound fee estimate. The assembler computes the exact
    /// fee later; this catches obviously underfunded requests before any
    /// proving work happens.
    fn pre_check_funds(
        &self,
        prove_request: &ProveRequest,
        norm_spell: &NormalizedSpell,
        prev_txs_by_id: &BTreeMap<TxId, Tx>,
    ) -> Result<(), ProveError> {
        let network = infer_network(&prove_request.change_address)?;

        let coin_outs = norm_spell.tx.coins.as_ref().ok_or_else(|| {
            ProveError::MalformedSpell("spell.tx.coins must be present".to_string())
        })?;
        if !coin_outs.iter().all(|o| {
            bitcoin::Address::from_script(&bitcoin::ScriptBuf::from_bytes(o.dest.clone()), network)
                .is_ok()
        }) {
            return Err(ProveError::Other(anyhow!(
                "all output addresses must be valid for the network"
            )));
        }

        let spell_tx = from_spell(norm_spell)?;
        let total_sats_in = crate::tx::bitcoin_tx::tx_total_amount_in(prev_txs_by_id, &spell_tx)?;
        let total_sats_out: u64 = coin_outs.iter().map(|o| o.amount).sum();

        let mut norm_spell_for_size = norm_spell.clone();
        norm_spell_for_size.tx.ins = None;
        norm_spell_for_size.tx.coins = None;
        let proof_dummy: Vec<u8> = vec![0xff; 128];
        let spell_cbor = util::write(&(norm_spell_for_size, proof_dummy))
            .map_err(ProveError::Other)?;

        let num_inputs = spell_tx.input.len() as u64;
        let estimated_fee: u64 = (111
            + (spell_cbor.len() as u64 + 372) / 4
            + spell_tx.vsize() as u64
            + 28 * num_inputs)
            * prove_request.fee_rate as u64;

        let available = prove_request.funding_utxo_value + total_sats_in.to_sat();
        let required = total_sats_out + estimated_fee;

        tracing::info!(
            total_sats_in = total_sats_in.to_sat(),
            total_sats_out,
            estimated_fee,
            "pre-checked funds"
        );

        if available < required {
            return Err(ProveError::InsufficientFunds {
                required,
                available,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spell::prove_spell_tx::ProveSpellTxImpl;
    use bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
        absolute::LockTime, transaction::Version,
    };
    use charms_client::{NormalizedTransaction, bitcoin_tx::BitcoinTx, tx::EnchantedTx};
    use charms_data::{NativeOutput, UtxoId};

    const CHANGE_ADDRESS: &str = "bcrt1q6u6qyya3sryhh42lahtnz2m7zuufe7dlt8j0j5";

    fn change_script() -> ScriptBuf {
        bitcoin::Address::from_str(CHANGE_ADDRESS)
            .unwrap()
            .assume_checked()
            .script_pubkey()
    }

    fn funding_prev_tx(value: u64) -> Tx {
        Tx::Bitcoin(BitcoinTx(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Default::default(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: change_script(),
            }],
        }))
    }

    /// A plain transfer of sats: no apps, one input, one output.
    fn transfer_request(prev_tx: Tx, out_amount: u64, funding_value: u64) -> ProveRequest {
        let spell = NormalizedSpell {
            tx: NormalizedTransaction {
                ins: Some(vec![UtxoId(prev_tx.tx_id(), 0)]),
                outs: vec![Default::default()],
                coins: Some(vec![NativeOutput {
                    amount: out_amount,
                    dest: change_script().into_bytes(),
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        ProveRequest {
            spell,
            app_private_inputs: BTreeMap::new(),
            binaries: BTreeMap::new(),
            prev_txs: vec![prev_tx],
            funding_utxo: UtxoId(TxId([0xaa; 32]), 0),
            funding_utxo_value: funding_value,
            change_address: CHANGE_ADDRESS.to_string(),
            fee_rate: 2.0,
        }
    }

    #[test]
    fn accepts_plain_transfer() {
        let prev_tx = funding_prev_tx(20_000);
        let request = transfer_request(prev_tx, 10_000, 10_000);
        let (norm_spell, tx) = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap();
        assert_eq!(norm_spell, request.spell);
        assert_eq!(tx.ins.len(), 1);
        assert_eq!(tx.outs.len(), 1);
    }

    #[test]
    fn rejects_funding_utxo_spent_by_spell() {
        let prev_tx = funding_prev_tx(20_000);
        let mut request = transfer_request(prev_tx.clone(), 10_000, 10_000);
        request.funding_utxo = UtxoId(prev_tx.tx_id(), 0);
        let err = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap_err();
        assert!(matches!(err, ProveError::OverlapViolation(_)));
    }

    #[test]
    fn rejects_duplicate_prev_txs() {
        let prev_tx = funding_prev_tx(20_000);
        let mut request = transfer_request(prev_tx.clone(), 10_000, 10_000);
        request.prev_txs.push(prev_tx);
        let err = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap_err();
        assert!(matches!(err, ProveError::AmbiguousBinding(_)));
    }

    #[test]
    fn rejects_missing_prev_tx() {
        let prev_tx = funding_prev_tx(20_000);
        let mut request = transfer_request(prev_tx, 10_000, 10_000);
        request.prev_txs.clear();
        let err = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap_err();
        assert!(matches!(err, ProveError::UnresolvedInput(_)));
    }

    #[test]
    fn rejects_input_vout_out_of_range() {
        let prev_tx = funding_prev_tx(20_000);
        let mut request = transfer_request(prev_tx.clone(), 10_000, 10_000);
        request.spell.tx.ins = Some(vec![UtxoId(prev_tx.tx_id(), 7)]);
        let err = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap_err();
        assert!(matches!(err, ProveError::UnresolvedInput(_)));
    }

    #[test]
    fn rejects_wrong_spell_version() {
        let prev_tx = funding_prev_tx(20_000);
        let mut request = transfer_request(prev_tx, 10_000, 10_000);
        request.spell.version = 42;
        let err = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap_err();
        assert!(matches!(err, ProveError::MalformedSpell(_)));
    }

    #[test]
    fn rejects_underfunded_request() {
        let prev_tx = funding_prev_tx(1_000);
        let request = transfer_request(prev_tx, 11_000, 10_000);
        let err = ProveSpellTxImpl::default()
            .validate_prove_request(&request)
            .unwrap_err();
        assert!(matches!(err, ProveError::InsufficientFunds { .. }));
    }

    #[test]
    fn rejects_unexpected_binaries() {
        let prev_tx = funding_prev_tx(20_000);
        let mut request = transfer_request(prev_tx, 10_000, 10_000);
        request.binaries.insert(B32([3u8; 32]), vec![0u8; 4]);
        assert!(
            ProveSpellTxImpl::default()
                .validate_prove_request(&request)
                .is_err()
        );
    }
}
