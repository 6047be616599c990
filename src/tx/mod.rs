use crate::spell::Spell;
use charms_client::{NormalizedSpell, SPELL_VK, tx::Tx};
use serde::{Deserialize, Serialize};

pub mod binder;
pub mod bitcoin_tx;

/// The result of a proving run: both transactions are unsigned and must be
/// signed and broadcast together (the spell transaction spends the commit
/// transaction's output).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionPair {
    pub commit_tx: Tx,
    pub spell_tx: Tx,
}

/// The status a third party assigns to a spell transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpellValidity {
    Valid(NormalizedSpell),
    Invalid { reason: String },
}

/// Check a commit/spell transaction pair: the proof must verify against the
/// commitment recomputed from the spell transaction, and the spell envelope
/// must be committed to by the commit transaction's first output.
#[tracing::instrument(level = "debug", skip_all)]
pub fn verify_transaction_pair(pair: &TransactionPair) -> SpellValidity {
    let Tx::Bitcoin(commit_tx) = &pair.commit_tx;
    let Tx::Bitcoin(spell_tx) = &pair.spell_tx;
    match charms_client::bitcoin_tx::verify_transaction_pair(commit_tx, spell_tx, SPELL_VK) {
        Ok(norm_spell) => SpellValidity::Valid(norm_spell),
        Err(e) => SpellValidity::Invalid {
            reason: format!("{e:#}"),
        },
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn norm_spell(tx: &Tx) -> Option<NormalizedSpell> {
    charms_client::tx::committed_normalized_spell(SPELL_VK, tx)
        .map_err(|e| {
            tracing::debug!("spell verification failed: {:?}", e);
            e
        })
        .ok()
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn spell(tx: &Tx) -> anyhow::Result<Option<Spell>> {
    match norm_spell(tx) {
        Some(norm_spell) => Ok(Some(Spell::denormalized(&norm_spell)?)),
        None => Ok(None),
    }
}
