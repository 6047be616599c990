use anyhow::ensure;
use ark_bls12_381::Bls12_381;
use ark_groth16::Groth16;
use ark_serialize::CanonicalSerialize;
use ark_snark::SNARK;
use ark_std::{
    rand::{RngCore, SeedableRng, rngs::StdRng},
    test_rng,
};
use charms_client::{NormalizedSpell, Proof, SPELL_VK, ark, ark::CommitmentCircuit, tx::Tx};
use charms_data::{App, AppInput, B32, Data, util};
use std::collections::BTreeMap;

pub trait Prove: Send + Sync {
    /// Prove the correctness of a spell.
    ///
    /// Re-checks that the spell is correct (well-formed against `prev_txs`,
    /// and accepted by every app it exercises), then generates a succinct
    /// proof of the commitment over `(SPELL_VK, spell)`, where the spell still
    /// carries its inputs and native coin outputs.
    ///
    /// Returns the spell in its onchain form (inputs and coins erased: the
    /// hosting transaction already lists them) and the proof.
    fn prove(
        &self,
        norm_spell: NormalizedSpell,
        app_binaries: BTreeMap<B32, Vec<u8>>,
        app_private_inputs: BTreeMap<App, Data>,
        prev_txs: Vec<Tx>,
    ) -> anyhow::Result<(NormalizedSpell, Proof)>;
}

pub struct Prover;

impl Prove for Prover {
    #[tracing::instrument(level = "info", skip_all)]
    fn prove(
        &self,
        norm_spell: NormalizedSpell,
        app_binaries: BTreeMap<B32, Vec<u8>>,
        app_private_inputs: BTreeMap<App, Data>,
        prev_txs: Vec<Tx>,
    ) -> anyhow::Result<(NormalizedSpell, Proof)> {
        let app_input = match app_binaries.is_empty() {
            true => None,
            false => Some(AppInput {
                app_binaries,
                app_private_inputs,
            }),
        };

        ensure!(
            charms_client::is_correct(&norm_spell, &prev_txs, app_input, SPELL_VK),
            "spell verification failed"
        );

        let committed_data = util::write(&(SPELL_VK, &norm_spell))?;
        let circuit = CommitmentCircuit {
            commitment: Some(ark::commitment_field_element(&committed_data)),
        };

        let mut rng = StdRng::seed_from_u64(test_rng().next_u64());
        let proof = Groth16::<Bls12_381>::prove(ark::groth16_pk(), circuit, &mut rng)?;
        let mut proof_bytes = vec![];
        proof.serialize_compressed(&mut proof_bytes)?;
        tracing::info!("spell proof generated");

        let norm_spell = clear_inputs_and_coins(norm_spell);

        Ok((norm_spell, proof_bytes))
    }
}

pub(super) fn clear_inputs_and_coins(mut norm_spell: NormalizedSpell) -> NormalizedSpell {
    norm_spell.tx.ins = None;
    norm_spell.tx.coins = None;
    norm_spell
}

#[cfg(test)]
mod test {
    use super::*;
    use charms_client::tx::to_serialized_pv;

    #[test]
    fn proof_verifies_against_committed_spell() {
        let mut norm_spell = NormalizedSpell::default();
        norm_spell.tx.ins = Some(vec![]);
        norm_spell.tx.coins = Some(vec![]);

        let prover = Prover;
        let (onchain_spell, proof) = prover
            .prove(norm_spell.clone(), BTreeMap::new(), BTreeMap::new(), vec![])
            .unwrap();

        assert!(onchain_spell.tx.ins.is_none());
        assert!(onchain_spell.tx.coins.is_none());

        // the verifier re-attaches ins and coins from the hosting tx
        let pv = to_serialized_pv(&(SPELL_VK, &norm_spell)).unwrap();
        charms_client::tx::verify_snark_proof(&proof, &pv).unwrap();
    }

    #[test]
    fn proof_does_not_verify_against_mutated_spell() {
        let mut norm_spell = NormalizedSpell::default();
        norm_spell.tx.ins = Some(vec![]);
        norm_spell.tx.coins = Some(vec![]);

        let prover = Prover;
        let (_, proof) = prover
            .prove(norm_spell.clone(), BTreeMap::new(), BTreeMap::new(), vec![])
            .unwrap();

        let mut mutated = norm_spell.clone();
        mutated.tx.outs = vec![Default::default()];
        let pv = to_serialized_pv(&(SPELL_VK, &mutated)).unwrap();
        assert!(charms_client::tx::verify_snark_proof(&proof, &pv).is_err());
    }
}
