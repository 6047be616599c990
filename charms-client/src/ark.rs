use anyhow::{anyhow, ensure};
use ark_bls12_381::{Bls12_381, Fr};
use ark_ff::PrimeField;
use ark_groth16::{Groth16, PreparedVerifyingKey, Proof, ProvingKey, prepare_verifying_key};
use ark_relations::{
    lc,
    r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError, Variable},
};
use ark_serialize::CanonicalDeserialize;
use ark_snark::SNARK;
use ark_std::rand::{SeedableRng, rngs::StdRng};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Circuit binding a single public field element: the spell commitment.
/// One constraint, `witness * 1 = public`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitmentCircuit<F: PrimeField> {
    pub commitment: Option<F>,
}

impl<F: PrimeField> ConstraintSynthesizer<F> for CommitmentCircuit<F> {
    fn generate_constraints(self, cs: ConstraintSystemRef<F>) -> Result<(), SynthesisError> {
        let a = cs.new_witness_variable(|| self.commitment.ok_or(SynthesisError::AssignmentMissing))?;
        let c = cs.new_input_variable(|| self.commitment.ok_or(SynthesisError::AssignmentMissing))?;

        cs.enforce_constraint(lc!() + a, lc!() + Variable::One, lc!() + c)?;

        Ok(())
    }
}

// Parameters are derived from a fixed seed so every build of this crate
// produces the same proving and verifying keys.
const PARAMS_SEED: u64 = 0x636861_726d73;

static PARAMS: OnceLock<(ProvingKey<Bls12_381>, PreparedVerifyingKey<Bls12_381>)> =
    OnceLock::new();

fn params() -> &'static (ProvingKey<Bls12_381>, PreparedVerifyingKey<Bls12_381>) {
    PARAMS.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PARAMS_SEED);
        let (pk, vk) = Groth16::<Bls12_381>::circuit_specific_setup(
            CommitmentCircuit::<Fr>::default(),
            &mut rng,
        )
        .expect("one-constraint circuit setup must not fail");
        let pvk = prepare_verifying_key(&vk);
        (pk, pvk)
    })
}

/// Proving key for [`CommitmentCircuit`].
pub fn groth16_pk() -> &'static ProvingKey<Bls12_381> {
    &params().0
}

/// The field element a proof over `public_inputs` commits to.
/// The first 31 bytes of the SHA-256 digest, interpreted little-endian,
/// always fit in the BLS12-381 scalar field.
pub fn commitment_field_element(public_inputs: &[u8]) -> Fr {
    let hash = Sha256::digest(public_inputs);
    Fr::from_le_bytes_mod_order(&hash[..31])
}

pub fn verify_groth16_proof(proof: &[u8], public_inputs: &[u8]) -> anyhow::Result<()> {
    let proof = Proof::<Bls12_381>::deserialize_compressed(proof)
        .map_err(|e| anyhow!("could not deserialize proof: {}", e))?;

    let c = commitment_field_element(public_inputs);
    let ok = Groth16::<Bls12_381>::verify_with_processed_vk(&params().1, &[c], &proof)
        .map_err(|e| anyhow!("could not verify spell proof: {}", e))?;
    ensure!(ok, "spell proof does not verify");
    Ok(())
}
