use crate::{NormalizedSpell, Proof, tx, tx::EnchantedTx};
use anyhow::{anyhow, bail, ensure};
use bitcoin::{
    OutPoint, Transaction, TxIn, XOnlyPublicKey,
    consensus::encode::{deserialize_hex, serialize_hex},
    hashes::Hash,
    key::Secp256k1,
    opcodes::all::{OP_ENDIF, OP_IF},
    script::{Instruction, PushBytes},
    taproot::ControlBlock,
};
use charms_data::{NativeOutput, TxId, UtxoId, util};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

serde_with::serde_conv!(
    TransactionHex,
    Transaction,
    |tx: &Transaction| serialize_hex(tx),
    |s: String| deserialize_hex(&s)
);

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BitcoinTx(#[serde_as(as = "TransactionHex")] pub Transaction);

impl BitcoinTx {
    pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
        let tx = deserialize_hex(hex)?;
        Ok(Self(tx))
    }

    pub fn inner(&self) -> &Transaction {
        &self.0
    }
}

impl From<Transaction> for BitcoinTx {
    fn from(tx: Transaction) -> Self {
        Self(tx)
    }
}

impl EnchantedTx for BitcoinTx {
    fn extract_and_verify_spell(&self, spell_vk: &str) -> anyhow::Result<NormalizedSpell> {
        let tx = self.inner();

        // The commit output is spent by the last input, which carries the spell envelope.
        let Some((spell_tx_in, _tx_ins)) = tx.input.split_last() else {
            bail!("transaction does not have inputs")
        };
        let (spell, proof) = parse_spell_and_proof_from_witness(spell_tx_in)?;

        ensure!(
            spell.tx.ins.is_none(),
            "spell must inherit inputs from the enchanted tx"
        );
        ensure!(
            spell.tx.outs.len() <= tx.output.len(),
            "spell tx outs mismatch"
        );
        let spell = spell_with_committed_ins_and_coins(self, spell);

        let spell_vk = tx::spell_vk(spell.version, spell_vk)?;

        let public_values = tx::to_serialized_pv(&(spell_vk, &spell))?;

        tx::verify_snark_proof(&proof, &public_values)?;

        Ok(spell)
    }

    fn tx_outs_len(&self) -> usize {
        self.inner().output.len()
    }

    fn tx_id(&self) -> TxId {
        TxId(self.inner().compute_txid().to_byte_array())
    }

    fn hex(&self) -> String {
        serialize_hex(self.inner())
    }

    fn spell_ins(&self) -> Vec<UtxoId> {
        let tx = self.inner();

        tx.input
            .iter()
            .map(|tx_in| {
                let out_point = tx_in.previous_output;
                UtxoId(TxId(out_point.txid.to_byte_array()), out_point.vout)
            })
            .collect()
    }

    fn all_coin_outs(&self) -> Vec<NativeOutput> {
        self.inner()
            .output
            .iter()
            .map(|tx_out| NativeOutput {
                amount: tx_out.value.to_sat(),
                dest: tx_out.script_pubkey.to_bytes(),
            })
            .collect()
    }
}

/// Re-attach the data erased before committing the spell on-chain: the input
/// UTXO list and the native output amounts, both taken from the hosting
/// transaction. The proof commits over the re-attached form, so a transaction
/// that was mutated after proving fails verification.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn spell_with_committed_ins_and_coins(
    tx: &BitcoinTx,
    mut spell: NormalizedSpell,
) -> NormalizedSpell {
    let mut tx_ins = tx.spell_ins();

    // the last input spends the commit output and carries no charms
    tx_ins.pop();

    spell.tx.ins = Some(tx_ins);

    let mut coins = tx.all_coin_outs();
    coins.truncate(spell.tx.outs.len());
    spell.tx.coins = Some(coins);

    spell
}

/// Verify a commit/spell transaction pair: the spell transaction's last input
/// must spend the first output of the commit transaction, and the spell
/// envelope script in its witness must be committed to by that output's
/// Taproot output key. Returns the verified spell.
pub fn verify_transaction_pair(
    commit_tx: &BitcoinTx,
    spell_tx: &BitcoinTx,
    spell_vk: &str,
) -> anyhow::Result<NormalizedSpell> {
    let Some((spell_tx_in, _)) = spell_tx.inner().input.split_last() else {
        bail!("spell transaction does not have inputs")
    };
    let commit_outpoint = OutPoint {
        txid: commit_tx.inner().compute_txid(),
        vout: 0,
    };
    ensure!(
        spell_tx_in.previous_output == commit_outpoint,
        "spell transaction does not spend the commit output"
    );

    let commit_out = (commit_tx.inner().output)
        .first()
        .ok_or(anyhow!("commit transaction does not have outputs"))?;
    ensure!(
        commit_out.script_pubkey.is_p2tr(),
        "commit output is not Taproot"
    );
    let output_key = XOnlyPublicKey::from_slice(&commit_out.script_pubkey.as_bytes()[2..34])?;

    let control_block_bytes = (spell_tx_in.witness)
        .taproot_control_block()
        .ok_or(anyhow!("no control block"))?;
    let control_block = ControlBlock::decode(control_block_bytes)?;
    let leaf_script = (spell_tx_in.witness)
        .taproot_leaf_script()
        .ok_or(anyhow!("no spell data in the last input's witness"))?;

    let secp = Secp256k1::verification_only();
    ensure!(
        control_block.verify_taproot_commitment(&secp, output_key, leaf_script.script),
        "spell envelope is not committed to by the commit output"
    );

    spell_tx.extract_and_verify_spell(spell_vk)
}

pub const SPELL_MARKER: &[u8] = b"spell";

#[tracing::instrument(level = "debug", skip_all)]
pub fn parse_spell_and_proof_from_witness(
    spell_tx_in: &TxIn,
) -> anyhow::Result<(NormalizedSpell, Proof)> {
    ensure!(
        spell_tx_in
            .witness
            .taproot_control_block()
            .ok_or(anyhow!("no control block"))?
            .len()
            == 33,
        "the Taproot tree contains more than one leaf: only a single script is supported"
    );

    let leaf_script = spell_tx_in
        .witness
        .taproot_leaf_script()
        .ok_or(anyhow!("no spell data in the last input's witness"))?;

    let mut instructions = leaf_script.script.instructions();

    ensure!(instructions.next() == Some(Ok(Instruction::PushBytes(PushBytes::empty()))));
    ensure!(instructions.next() == Some(Ok(Instruction::Op(OP_IF))));
    let Some(Ok(Instruction::PushBytes(push_bytes))) = instructions.next() else {
        bail!("no spell data")
    };
    if push_bytes.as_bytes() != SPELL_MARKER {
        bail!("no spell marker")
    }

    let mut spell_data = vec![];

    loop {
        match instructions.next() {
            Some(Ok(Instruction::PushBytes(push_bytes))) => {
                spell_data.extend(push_bytes.as_bytes());
            }
            Some(Ok(Instruction::Op(OP_ENDIF))) => {
                break;
            }
            _ => {
                bail!("unexpected opcode")
            }
        }
    }

    let (spell, proof): (NormalizedSpell, Proof) = util::read(spell_data.as_slice())
        .map_err(|e| anyhow!("could not parse spell and proof: {}", e))?;
    Ok((spell, proof))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        Sequence, Witness,
        opcodes::{OP_0, OP_TRUE},
        script::{Builder, PushBytesBuf},
    };
    use charms_data::Data;
    use std::collections::BTreeMap;

    fn envelope_witness(spell: &NormalizedSpell, proof: &Proof) -> Witness {
        let data = util::write(&(spell, proof)).unwrap();
        let mut builder = Builder::new()
            .push_opcode(OP_0)
            .push_opcode(OP_IF)
            .push_slice(PushBytesBuf::try_from(SPELL_MARKER.to_vec()).unwrap());
        for chunk in data.chunks(520) {
            builder = builder.push_slice(PushBytesBuf::try_from(chunk.to_vec()).unwrap());
        }
        let script = builder
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_TRUE)
            .into_script();

        // leaf version byte plus a 32-byte internal key x-coordinate
        let mut control_block = vec![0xc0u8];
        control_block.extend_from_slice(&[2u8; 32]);

        Witness::from_slice(&[script.to_bytes(), control_block])
    }

    fn tx_in_with_witness(witness: Witness) -> TxIn {
        TxIn {
            previous_output: OutPoint::null(),
            script_sig: Default::default(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness,
        }
    }

    #[test]
    fn parse_witness_round_trip() {
        let mut spell = NormalizedSpell::default();
        spell.tx.outs = vec![BTreeMap::from([(0u32, Data::from(&"state"))])];
        let proof: Proof = vec![7u8; 128];

        let tx_in = tx_in_with_witness(envelope_witness(&spell, &proof));
        let (parsed_spell, parsed_proof) = parse_spell_and_proof_from_witness(&tx_in).unwrap();
        assert_eq!(parsed_spell, spell);
        assert_eq!(parsed_proof, proof);
    }

    #[test]
    fn rejects_witness_without_marker() {
        let script = Builder::new()
            .push_opcode(OP_0)
            .push_opcode(OP_IF)
            .push_slice(b"not-a-spell")
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_TRUE)
            .into_script();
        let mut control_block = vec![0xc0u8];
        control_block.extend_from_slice(&[2u8; 32]);
        let tx_in =
            tx_in_with_witness(Witness::from_slice(&[script.to_bytes(), control_block]));
        assert!(parse_spell_and_proof_from_witness(&tx_in).is_err());
    }

    #[test]
    fn rejects_empty_witness() {
        let tx_in = tx_in_with_witness(Witness::new());
        assert!(parse_spell_and_proof_from_witness(&tx_in).is_err());
    }
}
