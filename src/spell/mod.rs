mod sorted_app_map;

pub mod prove;
pub mod prove_spell_tx;
pub mod request;
mod validate;

pub use prove::{Prove, Prover};
pub use prove_spell_tx::{ProveSpellTx, ProveSpellTxImpl};
pub use request::ProveRequest;
pub use validate::{ensure_all_prev_txs_are_present, ensure_exact_app_binaries};

pub use charms_client::{
    CURRENT_VERSION, NormalizedCharms, NormalizedSpell, NormalizedTransaction, Proof, to_tx,
};

use crate::utils;
use anyhow::{Context, anyhow, bail, ensure};
use charms_client::tx::Tx;
use charms_data::{App, B32, Charms, Data, NativeOutput, UtxoId};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

/// Value of a charm output when the spell does not name one.
pub const DEFAULT_COIN_AMOUNT: u64 = 1000;

/// Charm as represented in a spell.
/// Map of `$KEY: data`.
pub type KeyedCharms = BTreeMap<String, Data>;

/// UTXO as represented in a spell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utxo_id: Option<UtxoId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charms: Option<KeyedCharms>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(
        alias = "sats",
        alias = "coin",
        alias = "coins",
        skip_serializing_if = "Option::is_none"
    )]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charms: Option<KeyedCharms>,
}

/// Defines how spells are represented in their source form,
/// in both human-friendly (JSON/YAML) and machine-friendly (CBOR) formats.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Spell {
    /// Version of the protocol.
    pub version: u32,

    /// Apps used in the spell. Map of `$KEY: App`.
    /// Keys are arbitrary strings. They just need to be unique (inside the spell).
    pub apps: BTreeMap<String, App>,

    /// Public inputs to the apps for this spell. Map of `$KEY: Data`.
    #[serde(alias = "public_inputs", skip_serializing_if = "Option::is_none")]
    pub public_args: Option<BTreeMap<String, Data>>,

    /// Private inputs to the apps for this spell. Map of `$KEY: Data`.
    #[serde(alias = "private_inputs", skip_serializing_if = "Option::is_none")]
    pub private_args: Option<BTreeMap<String, Data>>,

    /// Transaction inputs.
    pub ins: Vec<Input>,
    /// Reference inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<Input>>,
    /// Transaction outputs.
    pub outs: Vec<Output>,
}

impl Spell {
    /// New empty spell.
    pub fn new() -> Self {
        Self {
            version: CURRENT_VERSION,
            apps: BTreeMap::new(),
            public_args: None,
            private_args: None,
            ins: vec![],
            refs: None,
            outs: vec![],
        }
    }

    pub fn charms(&self, charms_opt: &Option<KeyedCharms>) -> anyhow::Result<Charms> {
        charms_opt
            .as_ref()
            .ok_or(anyhow!("missing charms field"))?
            .iter()
            .map(|(k, v)| {
                let app = self.apps.get(k).ok_or(anyhow!("missing app {}", k))?;
                Ok((app.clone(), v.clone()))
            })
            .collect::<Result<Charms, _>>()
    }

    /// Get a [`NormalizedSpell`] and apps' private inputs for the spell.
    pub fn normalized(&self) -> anyhow::Result<(NormalizedSpell, BTreeMap<App, Data>)> {
        ensure!(self.version == CURRENT_VERSION);

        let empty_map = BTreeMap::new();
        let keyed_public_inputs = self.public_args.as_ref().unwrap_or(&empty_map);

        let keyed_apps = &self.apps;
        let apps: BTreeSet<App> = keyed_apps.values().cloned().collect();
        let app_to_index: BTreeMap<App, u32> = apps.iter().cloned().zip(0..).collect();
        ensure!(apps.len() == keyed_apps.len(), "duplicate apps");

        let app_public_inputs: BTreeMap<App, Data> = app_inputs(keyed_apps, keyed_public_inputs);

        let ins: Vec<UtxoId> = self
            .ins
            .iter()
            .map(|utxo| utxo.utxo_id.clone().ok_or(anyhow!("missing input utxo_id")))
            .collect::<Result<_, _>>()?;
        ensure!(
            ins.iter().collect::<BTreeSet<_>>().len() == ins.len(),
            "duplicate inputs"
        );
        let ins = Some(ins);

        let refs = self
            .refs
            .as_ref()
            .map(|refs| {
                refs.iter()
                    .map(|utxo| utxo.utxo_id.clone().ok_or(anyhow!("missing input utxo_id")))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let empty_charm = KeyedCharms::new();

        let outs: Vec<NormalizedCharms> = self
            .outs
            .iter()
            .map(|utxo| {
                let n_charms = utxo
                    .charms
                    .as_ref()
                    .unwrap_or(&empty_charm)
                    .iter()
                    .map(|(k, v)| {
                        let app = keyed_apps.get(k).ok_or(anyhow!("missing app key"))?;
                        let i = *app_to_index
                            .get(app)
                            .ok_or(anyhow!("app is expected to be in app_to_index"))?;
                        Ok((i, v.clone()))
                    })
                    .collect::<anyhow::Result<NormalizedCharms>>()?;
                Ok(n_charms)
            })
            .collect::<anyhow::Result<_>>()?;

        let coins = get_coin_outs(&self.outs)?;

        let norm_spell = NormalizedSpell {
            version: self.version,
            tx: NormalizedTransaction {
                ins,
                refs,
                outs,
                coins: Some(coins),
            },
            app_public_inputs,
        };

        let keyed_private_inputs = self.private_args.as_ref().unwrap_or(&empty_map);
        let app_private_inputs = app_inputs(keyed_apps, keyed_private_inputs);

        Ok((norm_spell, app_private_inputs))
    }

    /// De-normalize a normalized spell.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn denormalized(norm_spell: &NormalizedSpell) -> anyhow::Result<Self> {
        let apps = (0..)
            .zip(norm_spell.app_public_inputs.keys())
            .map(|(i, app)| (utils::str_index(&i), app.clone()))
            .collect();

        let public_args = match norm_spell
            .app_public_inputs
            .values()
            .enumerate()
            .filter_map(|(i, data)| match data {
                data if data.is_empty() => None,
                data => Some((utils::str_index(&(i as u32)), data.clone())),
            })
            .collect::<BTreeMap<_, _>>()
        {
            map if map.is_empty() => None,
            map => Some(map),
        };

        let Some(norm_spell_ins) = &norm_spell.tx.ins else {
            bail!("spell must have inputs");
        };
        let ins = norm_spell_ins
            .iter()
            .map(|utxo_id| Input {
                utxo_id: Some(utxo_id.clone()),
                charms: None,
            })
            .collect();

        let refs = norm_spell.tx.refs.as_ref().map(|refs| {
            refs.iter()
                .map(|utxo_id| Input {
                    utxo_id: Some(utxo_id.clone()),
                    charms: None,
                })
                .collect::<Vec<_>>()
        });

        let coins = norm_spell.tx.coins.as_deref().unwrap_or(&[]);
        let outs = norm_spell
            .tx
            .outs
            .iter()
            .enumerate()
            .map(|(i, n_charms)| Output {
                address: None,
                amount: coins.get(i).map(|coin| coin.amount),
                charms: match n_charms
                    .iter()
                    .map(|(i, data)| (utils::str_index(i), data.clone()))
                    .collect::<KeyedCharms>()
                {
                    charms if charms.is_empty() => None,
                    charms => Some(charms),
                },
            })
            .collect();

        Ok(Self {
            version: norm_spell.version,
            apps,
            public_args,
            private_args: None,
            ins,
            refs,
            outs,
        })
    }
}

fn get_coin_outs(outs: &[Output]) -> anyhow::Result<Vec<NativeOutput>> {
    outs.iter()
        .map(|output| {
            let address = output
                .address
                .as_ref()
                .ok_or(anyhow!("output address is expected"))?;
            Ok(NativeOutput {
                amount: output.amount.unwrap_or(DEFAULT_COIN_AMOUNT),
                dest: script_pubkey_bytes(address)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()
}

fn script_pubkey_bytes(address: &str) -> anyhow::Result<Vec<u8>> {
    let addr = bitcoin::Address::from_str(address)
        .with_context(|| format!("invalid address: {}", address))?;
    Ok(addr.assume_checked().script_pubkey().to_bytes())
}

fn app_inputs(
    keyed_apps: &BTreeMap<String, App>,
    keyed_inputs: &BTreeMap<String, Data>,
) -> BTreeMap<App, Data> {
    keyed_apps
        .iter()
        .map(|(k, app)| {
            (
                app.clone(),
                keyed_inputs.get(k).cloned().unwrap_or_default(),
            )
        })
        .collect()
}

/// JSON/YAML-facing form of [`NormalizedSpell`], carrying the apps' private
/// inputs alongside. Trivially decomposes into `NormalizedSpell` + extras.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpellInput {
    /// Protocol version.
    pub version: u32,
    /// Transaction data.
    pub tx: NormalizedTransaction,
    /// Maps all `App`s in the transaction to (potentially empty) public input data.
    /// Keys must be in sorted order in the input (human-readable formats).
    #[serde(
        serialize_with = "sorted_app_map::serialize",
        deserialize_with = "sorted_app_map::deserialize"
    )]
    pub app_public_inputs: BTreeMap<App, Data>,

    /// Private inputs to the apps for this spell.
    #[serde(
        alias = "private_inputs",
        skip_serializing_if = "Option::is_none",
        default
    )]
    #[serde_as(as = "Option<BTreeMap<DisplayFromStr, _>>")]
    pub app_private_inputs: Option<BTreeMap<App, Data>>,
}

impl SpellInput {
    /// Decompose into `NormalizedSpell` and private inputs.
    pub fn into_parts(self) -> (NormalizedSpell, BTreeMap<App, Data>) {
        let spell = NormalizedSpell {
            version: self.version,
            tx: self.tx,
            app_public_inputs: self.app_public_inputs,
        };
        let private_inputs = self.app_private_inputs.unwrap_or_default();
        (spell, private_inputs)
    }

    /// Create a `SpellInput` from a `NormalizedSpell` (for display).
    pub fn from_normalized_spell(ns: &NormalizedSpell) -> Self {
        SpellInput {
            version: ns.version,
            tx: ns.tx.clone(),
            app_public_inputs: ns.app_public_inputs.clone(),
            app_private_inputs: None,
        }
    }
}

pub fn from_strings(prev_txs: &[String]) -> anyhow::Result<Vec<Tx>> {
    prev_txs
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|tx_hex| {
            Tx::try_from(tx_hex)
                .context("failed to convert from hex")
                .or_else(|_| serde_json::from_str(tx_hex).context("failed to convert from JSON"))
                .or_else(|_| serde_yaml::from_str(tx_hex).context("failed to convert from YAML"))
        })
        .collect()
}

/// Required app binaries: the VKs of apps that have a public or private input,
/// or whose part of the transaction is not a simple transfer.
pub fn required_binary_vks(
    norm_spell: &NormalizedSpell,
    app_private_inputs: &BTreeMap<App, Data>,
    tx: &charms_data::Transaction,
) -> BTreeSet<B32> {
    norm_spell
        .app_public_inputs
        .iter()
        .filter(|(app, data)| {
            !data.is_empty()
                || !app_private_inputs
                    .get(app)
                    .is_none_or(|data| data.is_empty())
                || !charms_data::is_simple_transfer(app, tx)
        })
        .map(|(app, _)| app.vk.clone())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use charms_data::{NFT, TxId};

    fn nft_app() -> App {
        App {
            tag: NFT,
            identity: B32([1u8; 32]),
            vk: B32([2u8; 32]),
        }
    }

    fn spell_yaml() -> String {
        let app = nft_app();
        format!(
            r#"
version: 0
apps:
  $00: {app}
public_args:
  $00: 7
ins:
  - utxo_id: {txid}:0
outs:
  - address: bcrt1q6u6qyya3sryhh42lahtnz2m7zuufe7dlt8j0j5
    amount: 4000
    charms:
      $00: "genesis"
"#,
            app = app,
            txid = TxId([7u8; 32]),
        )
    }

    #[test]
    fn spell_round_trips_through_yaml() {
        let spell: Spell = serde_yaml::from_str(&spell_yaml()).unwrap();
        let yaml = serde_yaml::to_string(&spell).unwrap();
        let spell_back: Spell = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spell.apps, spell_back.apps);
        assert_eq!(spell.ins, spell_back.ins);
        assert_eq!(spell.outs, spell_back.outs);
    }

    #[test]
    fn normalize_maps_apps_to_indices() {
        let spell: Spell = serde_yaml::from_str(&spell_yaml()).unwrap();
        let (norm_spell, app_private_inputs) = spell.normalized().unwrap();

        assert_eq!(norm_spell.version, CURRENT_VERSION);
        assert_eq!(norm_spell.tx.ins, Some(vec![UtxoId(TxId([7u8; 32]), 0)]));
        assert_eq!(norm_spell.tx.outs.len(), 1);
        assert!(norm_spell.tx.outs[0].contains_key(&0));
        assert_eq!(
            norm_spell.tx.coins.as_ref().unwrap()[0].amount,
            4000
        );
        assert_eq!(app_private_inputs[&nft_app()], Data::empty());
    }

    #[test]
    fn normalize_rejects_duplicate_inputs() {
        let mut spell: Spell = serde_yaml::from_str(&spell_yaml()).unwrap();
        spell.ins.push(spell.ins[0].clone());
        assert!(spell.normalized().is_err());
    }

    #[test]
    fn denormalize_keeps_structure() {
        let spell: Spell = serde_yaml::from_str(&spell_yaml()).unwrap();
        let (norm_spell, _) = spell.normalized().unwrap();
        let spell_back = Spell::denormalized(&norm_spell).unwrap();
        assert_eq!(spell_back.ins.len(), 1);
        assert_eq!(spell_back.ins[0].utxo_id, Some(UtxoId(TxId([7u8; 32]), 0)));
        assert_eq!(spell_back.outs.len(), 1);
        assert_eq!(spell_back.outs[0].amount, Some(4000));
        assert!(spell_back.outs[0].charms.is_some());
        assert_eq!(spell_back.apps.values().next(), Some(&nft_app()));
    }

    #[test]
    fn prev_txs_from_strings() {
        use charms_client::tx::EnchantedTx;

        let tx = bitcoin::Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let tx_hex = Tx::Bitcoin(tx.into()).hex();

        let txs = from_strings(&[tx_hex, "  ".to_string()]).unwrap();
        assert_eq!(txs.len(), 1);

        assert!(from_strings(&["not a tx".to_string()]).is_err());
    }

    #[test]
    fn spell_input_rejects_unsorted_app_keys() {
        let json = format!(
            r#"{{
                "version": 0,
                "tx": {{ "outs": [] }},
                "app_public_inputs": {{
                    "{b}": null,
                    "{a}": null
                }}
            }}"#,
            b = App {
                tag: NFT,
                identity: B32([9u8; 32]),
                vk: B32([2u8; 32]),
            },
            a = nft_app(),
        );
        assert!(serde_json::from_str::<SpellInput>(&json).is_err());
    }
}
