use super::{
    prove::{Prove, Prover},
    request::ProveRequest,
};
use crate::{error::ProveError, tx::TransactionPair, tx::binder, tx::bitcoin_tx};
use charms_app_runner::AppRunner;
use charms_data::util;

pub trait ProveSpellTx: Send + Sync {
    /// Run the whole pipeline for a proving request: validate, prove, and
    /// assemble the commit/spell transaction pair.
    fn prove_spell_tx(&self, prove_request: ProveRequest) -> Result<TransactionPair, ProveError>;
}

pub struct ProveSpellTxImpl {
    pub prover: Box<dyn Prove>,
    // the runner carries the compiled-module cache across requests
    pub runner: AppRunner,
}

impl ProveSpellTxImpl {
    pub fn new(prover: Box<dyn Prove>) -> Self {
        Self {
            prover,
            runner: AppRunner::new(),
        }
    }
}

impl Default for ProveSpellTxImpl {
    fn default() -> Self {
        Self::new(Box::new(Prover))
    }
}

impl ProveSpellTx for ProveSpellTxImpl {
    #[tracing::instrument(level = "info", skip_all)]
    fn prove_spell_tx(&self, prove_request: ProveRequest) -> Result<TransactionPair, ProveError> {
        let (norm_spell, _tx) = self.validate_prove_request(&prove_request)?;

        let ProveRequest {
            app_private_inputs,
            binaries,
            prev_txs,
            funding_utxo,
            funding_utxo_value,
            change_address,
            fee_rate,
            ..
        } = prove_request;

        let prev_txs_by_id = binder::by_txid_strict(&prev_txs)?;

        let (truncated_norm_spell, proof) = self
            .prover
            .prove(norm_spell.clone(), binaries, app_private_inputs, prev_txs)
            .map_err(|e| ProveError::ProvingFailed(format!("{e:#}")))?;

        let spell_data =
            util::write(&(&truncated_norm_spell, &proof)).map_err(ProveError::Other)?;

        bitcoin_tx::make_transaction_pair(
            &norm_spell,
            &spell_data,
            &funding_utxo,
            funding_utxo_value,
            &change_address,
            fee_rate,
            &prev_txs_by_id,
        )
    }
}
