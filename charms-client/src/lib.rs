use crate::tx::{EnchantedTx, Tx, extended_normalized_spell};
use anyhow::{anyhow, ensure};
use charms_app_runner::AppRunner;
use charms_data::{
    App, AppInput, Charms, Data, NativeOutput, TOKEN, Transaction, TxId, UtxoId, check,
    is_simple_transfer,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod ark;
pub mod bitcoin_tx;
pub mod tx;

/// Verification key for version `0` of the spell-checking protocol.
pub const V0_SPELL_VK: &str = "0x00e9398ac819e6dd281f81db3ada3fe5159c3cc40222b5ddb0e7584ed2327c5d";

/// Version `0` of the protocol.
pub const V0: u32 = 0;

/// Current version of the protocol.
pub const CURRENT_VERSION: u32 = V0;

/// Verification key for the current version of the protocol.
pub const SPELL_VK: &str = V0_SPELL_VK;

/// Maps the index of the charm's app (in [`NormalizedSpell`].`app_public_inputs`) to the charm's
/// data.
pub type NormalizedCharms = BTreeMap<u32, Data>;

/// Normalized representation of a Charms transaction.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    /// (Optional) input UTXO list. Is None when serialized in the transaction: the transaction
    /// already lists all inputs. **Must** be in the order of the transaction inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ins: Option<Vec<UtxoId>>,

    /// Reference UTXO list. **May** be empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<UtxoId>>,

    /// Output charms. When proving spell correctness, we can't know the transaction ID yet.
    /// We only know the index of each output charm.
    /// **Must** be in the order of the hosting transaction's outputs.
    /// **Must not** be larger than the number of outputs in the hosting transaction.
    pub outs: Vec<NormalizedCharms>,

    /// Amounts of native coin in transaction outputs. Is None when serialized in the
    /// transaction: the transaction already lists the output amounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coins: Option<Vec<NativeOutput>>,
}

impl NormalizedTransaction {
    /// Return a sorted set of transaction IDs of the inputs.
    pub fn prev_txids(&self) -> Option<BTreeSet<&TxId>> {
        self.ins
            .as_ref()
            .map(|ins| ins.iter().map(|utxo_id| &utxo_id.0).collect())
    }
}

/// Proof of spell correctness.
pub type Proof = Vec<u8>;

/// Normalized representation of a spell.
/// Can be committed as public input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSpell {
    /// Protocol version.
    pub version: u32,
    /// Transaction data.
    pub tx: NormalizedTransaction,
    /// Maps all `App`s in the transaction to (potentially empty) public input data.
    pub app_public_inputs: BTreeMap<App, Data>,
}

impl Default for NormalizedSpell {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            tx: Default::default(),
            app_public_inputs: Default::default(),
        }
    }
}

/// Extract spells from previous transactions.
#[tracing::instrument(level = "debug", skip(prev_txs, spell_vk))]
pub fn prev_spells(prev_txs: &[Tx], spell_vk: &str) -> BTreeMap<TxId, (NormalizedSpell, usize)> {
    prev_txs
        .iter()
        .map(|tx| {
            (
                tx.tx_id(),
                (extended_normalized_spell(spell_vk, tx), tx.tx_outs_len()),
            )
        })
        .collect()
}

/// Check if the spell is well-formed.
#[tracing::instrument(level = "debug", skip(spell, prev_spells))]
pub fn well_formed(
    spell: &NormalizedSpell,
    prev_spells: &BTreeMap<TxId, (NormalizedSpell, usize)>,
) -> bool {
    check!(spell.version == CURRENT_VERSION);
    check!(ensure_no_zero_amounts(spell).is_ok());
    let created_by_prev_txs = |utxo_id: &UtxoId| -> bool {
        prev_spells
            .get(&utxo_id.0)
            .is_some_and(|(_, num_tx_outs)| (utxo_id.1 as usize) < *num_tx_outs)
    };
    check!({
        spell.tx.outs.iter().all(|n_charms| {
            n_charms
                .keys()
                .all(|&i| i < spell.app_public_inputs.len() as u32)
        })
    });
    // check that UTXOs we're spending or referencing in this tx
    // are created by pre-req transactions
    let Some(tx_ins) = &spell.tx.ins else {
        eprintln!("no tx.ins");
        return false;
    };
    check!(
        tx_ins.iter().all(created_by_prev_txs)
            && (spell.tx.refs.iter().flatten()).all(created_by_prev_txs)
    );
    true
}

/// Return the list of apps in the spell.
pub fn apps(spell: &NormalizedSpell) -> Vec<App> {
    spell.app_public_inputs.keys().cloned().collect()
}

/// Convert normalized spell to [`charms_data::Transaction`].
pub fn to_tx(
    spell: &NormalizedSpell,
    prev_spells: &BTreeMap<TxId, (NormalizedSpell, usize)>,
) -> Transaction {
    let Some(tx_ins) = &spell.tx.ins else {
        unreachable!("spell.tx.ins MUST be Some at this point");
    };

    let from_utxo_id = |utxo_id: &UtxoId| -> (UtxoId, Charms) {
        let (prev_spell, _) = &prev_spells[&utxo_id.0];
        let charms = charms_in_utxo(prev_spell, utxo_id).unwrap_or_default();
        (utxo_id.clone(), charms)
    };

    let from_normalized_charms =
        |n_charms: &NormalizedCharms| -> Charms { charms(spell, n_charms) };

    Transaction {
        ins: tx_ins.iter().map(from_utxo_id).collect(),
        refs: spell.tx.refs.iter().flatten().map(from_utxo_id).collect(),
        outs: spell.tx.outs.iter().map(from_normalized_charms).collect(),
    }
}

fn charms_in_utxo(prev_spell: &NormalizedSpell, utxo_id: &UtxoId) -> Option<Charms> {
    (prev_spell.tx.outs)
        .get(utxo_id.1 as usize)
        .map(|n_charms| charms(prev_spell, n_charms))
}

/// Return [`charms_data::Charms`] for the given [`NormalizedCharms`].
/// Entries referencing an app index the spell does not declare are dropped:
/// prev spells come from untrusted transactions and may claim any index.
pub fn charms(spell: &NormalizedSpell, n_charms: &NormalizedCharms) -> Charms {
    let apps = apps(spell);
    n_charms
        .iter()
        .filter_map(|(&i, data)| {
            apps.get(i as usize)
                .map(|app| (app.clone(), data.clone()))
        })
        .collect()
}

/// Check if the spell is correct: well-formed against the spells carried by the
/// transactions that created its inputs, and accepted by every app it exercises.
pub fn is_correct(
    spell: &NormalizedSpell,
    prev_txs: &[Tx],
    app_input: Option<AppInput>,
    spell_vk: &str,
) -> bool {
    let prev_spells = prev_spells(prev_txs, spell_vk);

    check!(well_formed(spell, &prev_spells));

    let Some(prev_txids) = spell.tx.prev_txids() else {
        unreachable!("the spell is well formed: tx.ins MUST be Some");
    };
    check!(prev_txids == prev_spells.keys().collect());

    let apps = apps(spell);

    let charms_tx = to_tx(spell, &prev_spells);
    let tx_is_simple_transfer_or_app_contracts_satisfied =
        apps.iter().all(|app| is_simple_transfer(app, &charms_tx)) && app_input.is_none()
            || app_input.is_some_and(|app_input| {
                apps_satisfied(&app_input, &spell.app_public_inputs, &charms_tx)
            });
    check!(tx_is_simple_transfer_or_app_contracts_satisfied);

    true
}

fn apps_satisfied(
    app_input: &AppInput,
    app_public_inputs: &BTreeMap<App, Data>,
    tx: &Transaction,
) -> bool {
    let app_runner = AppRunner::new();
    app_runner
        .run_all(
            &app_input.app_binaries,
            tx,
            app_public_inputs,
            &app_input.app_private_inputs,
        )
        .is_ok()
}

pub fn ensure_no_zero_amounts(norm_spell: &NormalizedSpell) -> anyhow::Result<()> {
    let apps = apps(norm_spell);
    for out in &norm_spell.tx.outs {
        for (i, data) in out {
            let app = apps
                .get(*i as usize)
                .ok_or(anyhow!("no app for index {}", i))?;
            if app.tag == TOKEN {
                ensure!(
                    data.value::<u64>()? != 0,
                    "zero output amount for app {}",
                    app
                );
            };
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use charms_data::{B32, NFT};

    fn nft_app() -> App {
        App {
            tag: NFT,
            identity: B32([1u8; 32]),
            vk: B32([2u8; 32]),
        }
    }

    fn token_app() -> App {
        App {
            tag: TOKEN,
            identity: B32([1u8; 32]),
            vk: B32([2u8; 32]),
        }
    }

    fn spell_with_outs(app: App, outs: Vec<NormalizedCharms>) -> NormalizedSpell {
        NormalizedSpell {
            version: CURRENT_VERSION,
            tx: NormalizedTransaction {
                ins: Some(vec![UtxoId(TxId([3u8; 32]), 0)]),
                refs: None,
                outs,
                coins: None,
            },
            app_public_inputs: BTreeMap::from([(app, Data::empty())]),
        }
    }

    fn prev_spells_with_outs(num_tx_outs: usize) -> BTreeMap<TxId, (NormalizedSpell, usize)> {
        let mut prev_spell = NormalizedSpell::default();
        prev_spell.tx.ins = Some(vec![]);
        prev_spell.tx.coins = Some(vec![]);
        BTreeMap::from([(TxId([3u8; 32]), (prev_spell, num_tx_outs))])
    }

    #[test]
    fn well_formed_nft_mint() {
        let spell = spell_with_outs(
            nft_app(),
            vec![BTreeMap::from([(0u32, Data::from(&"state"))])],
        );
        assert!(well_formed(&spell, &prev_spells_with_outs(1)));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut spell = spell_with_outs(nft_app(), vec![]);
        spell.version = CURRENT_VERSION + 1;
        assert!(!well_formed(&spell, &prev_spells_with_outs(1)));
    }

    #[test]
    fn rejects_missing_ins() {
        let mut spell = spell_with_outs(nft_app(), vec![]);
        spell.tx.ins = None;
        assert!(!well_formed(&spell, &prev_spells_with_outs(1)));
    }

    #[test]
    fn rejects_out_of_range_app_index() {
        let spell = spell_with_outs(
            nft_app(),
            vec![BTreeMap::from([(7u32, Data::from(&"state"))])],
        );
        assert!(!well_formed(&spell, &prev_spells_with_outs(1)));
    }

    #[test]
    fn rejects_input_not_created_by_prev_txs() {
        // prev tx has only one output, vout 0; spending vout 1 must fail
        let mut spell = spell_with_outs(nft_app(), vec![]);
        spell.tx.ins = Some(vec![UtxoId(TxId([3u8; 32]), 1)]);
        assert!(!well_formed(&spell, &prev_spells_with_outs(1)));
    }

    #[test]
    fn rejects_zero_token_amount() {
        let spell = spell_with_outs(
            token_app(),
            vec![BTreeMap::from([(0u32, Data::from(&0u64))])],
        );
        assert!(ensure_no_zero_amounts(&spell).is_err());
        assert!(!well_formed(&spell, &prev_spells_with_outs(1)));
    }

    #[test]
    fn accepts_nonzero_token_amount() {
        let spell = spell_with_outs(
            token_app(),
            vec![BTreeMap::from([(0u32, Data::from(&42u64))])],
        );
        assert!(ensure_no_zero_amounts(&spell).is_ok());
    }

    #[test]
    fn to_tx_drops_unknown_app_indices_in_prev_outputs() {
        // a prev tx's spell declares no apps yet its output claims app index 5;
        // the charm must come through empty, not panic
        let mut prev_spell = NormalizedSpell::default();
        prev_spell.tx.ins = Some(vec![]);
        prev_spell.tx.outs = vec![BTreeMap::from([(5u32, Data::from(&"state"))])];
        prev_spell.tx.coins = Some(vec![]);
        let prev_spells = BTreeMap::from([(TxId([3u8; 32]), (prev_spell, 1usize))]);

        let spell = spell_with_outs(nft_app(), vec![]);
        assert!(well_formed(&spell, &prev_spells));
        let tx = to_tx(&spell, &prev_spells);
        assert_eq!(tx.ins[0].1, Charms::new());
    }

    #[test]
    fn to_tx_maps_charms_by_app_index() {
        let spell = spell_with_outs(
            nft_app(),
            vec![BTreeMap::from([(0u32, Data::from(&"state"))])],
        );
        let tx = to_tx(&spell, &prev_spells_with_outs(1));
        assert_eq!(tx.ins.len(), 1);
        assert_eq!(tx.outs.len(), 1);
        assert_eq!(tx.outs[0][&nft_app()], Data::from(&"state"));
    }
}
