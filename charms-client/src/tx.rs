use crate::{CURRENT_VERSION, NormalizedSpell, ark, bitcoin_tx::BitcoinTx};
use anyhow::bail;
use charms_data::{NativeOutput, TxId, UtxoId, util};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[enum_dispatch]
pub trait EnchantedTx {
    fn extract_and_verify_spell(&self, spell_vk: &str) -> anyhow::Result<NormalizedSpell>;
    fn tx_outs_len(&self) -> usize;
    fn tx_id(&self) -> TxId;
    fn hex(&self) -> String;
    fn spell_ins(&self) -> Vec<UtxoId>;
    fn all_coin_outs(&self) -> Vec<NativeOutput>;
}

#[enum_dispatch(EnchantedTx)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tx {
    Bitcoin(BitcoinTx),
}

impl TryFrom<&str> for Tx {
    type Error = anyhow::Error;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        if let Ok(b_tx) = BitcoinTx::from_hex(hex) {
            Ok(Self::Bitcoin(b_tx))
        } else {
            bail!("invalid hex")
        }
    }
}

impl Tx {
    pub fn new(tx: impl Into<Tx>) -> Self {
        tx.into()
    }
}

/// Extract a [`NormalizedSpell`] from a transaction and verify it.
/// Incorrect spells are rejected.
#[tracing::instrument(level = "debug", skip_all)]
pub fn committed_normalized_spell(spell_vk: &str, tx: &Tx) -> anyhow::Result<NormalizedSpell> {
    tx.extract_and_verify_spell(spell_vk)
}

/// Extract and verify [`NormalizedSpell`] from a transaction. Return an empty spell if the
/// transaction does not have one. Extend with native coin output amounts.
pub fn extended_normalized_spell(spell_vk: &str, tx: &Tx) -> NormalizedSpell {
    match tx.extract_and_verify_spell(spell_vk) {
        Ok(mut spell) => {
            spell.tx.coins = Some(tx.all_coin_outs());
            spell
        }
        Err(_) => {
            let mut spell = NormalizedSpell::default();
            spell.tx.ins = Some(tx.spell_ins());
            spell.tx.outs = vec![];
            spell.tx.coins = Some(tx.all_coin_outs());
            spell
        }
    }
}

pub fn spell_vk(spell_version: u32, spell_vk: &str) -> anyhow::Result<&str> {
    match spell_version {
        CURRENT_VERSION => Ok(spell_vk),
        _ => bail!("unsupported spell version: {}", spell_version),
    }
}

pub fn to_serialized_pv<T: Serialize>(t: &T) -> anyhow::Result<Vec<u8>> {
    // we commit to the CBOR-encoded tuple `(spell_vk, n_spell)`
    util::write(t)
}

pub fn verify_snark_proof(proof: &[u8], public_inputs: &[u8]) -> anyhow::Result<()> {
    ark::verify_groth16_proof(proof, public_inputs)
}

pub fn by_txid(prev_txs: &[Tx]) -> BTreeMap<TxId, Tx> {
    prev_txs
        .iter()
        .map(|prev_tx| (prev_tx.tx_id(), prev_tx.clone()))
        .collect::<BTreeMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    const B_TX_HEX: &str = "0200000000010115ccf0534b7969e5ac0f4699e51bf7805168244057059caa333397fcf8a9acdd0000000000fdffffff027a6faf85150000001600147b458433d0c04323426ef88365bd4cfef141ac7520a107000000000022512087a397fc19d816b6f938dad182a54c778d2d5db8b31f4528a758b989d42f0b78024730440220072d64b2e3bbcd27bd79cb8859c83ca524dad60dc6310569c2a04c997d116381022071d4df703d037a9fe16ccb1a2b8061f10cda86ccbb330a49c5dcc95197436c960121030db9616d96a7b7a8656191b340f77e905ee2885a09a7a1e80b9c8b64ec746fb300000000";

    #[test]
    fn tx_hex_round_trip() {
        let tx: Tx = Tx::try_from(B_TX_HEX).unwrap();
        assert_eq!(tx.hex(), B_TX_HEX);
    }

    #[test]
    fn rejects_garbage_hex() {
        assert!(Tx::try_from("not a transaction").is_err());
    }

    #[test]
    fn ser_to_json() {
        let tx: Tx = Tx::try_from(B_TX_HEX).unwrap();
        let json_str = serde_json::to_string(&tx).unwrap();
        let tx_back: Tx = serde_json::from_str(&json_str).unwrap();
        assert_eq!(tx, tx_back);
    }

    #[test]
    fn ser_to_cbor() {
        let tx: Tx = Tx::try_from(B_TX_HEX).unwrap();

        let v0 = vec![tx];
        let v0_cbor = ciborium::Value::serialized(&v0).unwrap();

        let v1: Vec<Tx> = ciborium::Value::deserialized(&v0_cbor).unwrap();
        let v1_cbor = ciborium::Value::serialized(&v1).unwrap();
        assert_eq!(v0, v1);
        assert_eq!(v0_cbor, v1_cbor);
    }

    #[test]
    fn by_txid_keys_match() {
        let tx: Tx = Tx::try_from(B_TX_HEX).unwrap();
        let map = by_txid(&[tx.clone()]);
        assert_eq!(map[&tx.tx_id()], tx);
    }
}
