use charms_client::{NormalizedSpell, tx::Tx};
use charms_data::{App, B32, Data, UtxoId, util};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, IfIsHumanReadable, base64::Base64, serde_as};
use std::collections::BTreeMap;

serde_with::serde_conv!(
    NormalizedSpellHex,
    NormalizedSpell,
    |spell: &NormalizedSpell| hex::encode(util::write(spell).expect("failed to write spell")),
    |s: String| util::read(hex::decode(&s)?.as_slice())
);

serde_with::serde_conv!(
    DataHex,
    Data,
    |data: &Data| hex::encode(util::write(data).expect("failed to write Data")),
    |s: String| util::read(hex::decode(&s)?.as_slice())
);

/// A complete proving request: everything the engine needs to turn a spell
/// into a signable commit/spell transaction pair. All chain data (previous
/// transactions, funding) is supplied by the caller up front.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct ProveRequest {
    #[serde_as(as = "IfIsHumanReadable<NormalizedSpellHex>")]
    pub spell: NormalizedSpell,
    #[serde_as(as = "IfIsHumanReadable<BTreeMap<DisplayFromStr, DataHex>>")]
    pub app_private_inputs: BTreeMap<App, Data>,
    #[serde_as(as = "IfIsHumanReadable<BTreeMap<_, Base64>>")]
    pub binaries: BTreeMap<B32, Vec<u8>>,
    pub prev_txs: Vec<Tx>,
    /// UTXO paying for the transaction pair. Spent by the commit transaction.
    pub funding_utxo: UtxoId,
    /// Value of the funding UTXO, in sats.
    pub funding_utxo_value: u64,
    pub change_address: String,
    /// Fee rate in sats per vbyte.
    pub fee_rate: f64,
}
