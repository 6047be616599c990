use anyhow::{anyhow, ensure, Result};
use ciborium::Value;
use serde::{
    de,
    de::{DeserializeOwned, SeqAccess, Visitor},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

/// 32-byte value. Hex string in human-readable formats, raw bytes in CBOR.
#[derive(Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct B32(pub [u8; 32]);

impl fmt::Display for B32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for B32 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| anyhow!("invalid hex: {}", e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("expected 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for B32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for B32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for B32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct B32Visitor;

        impl<'de> Visitor<'de> for B32Visitor {
            type Value = B32;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 64-character hex string or 32 bytes")
            }

            fn visit_str<E>(self, value: &str) -> Result<B32, E>
            where
                E: de::Error,
            {
                value.parse().map_err(E::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<B32, E>
            where
                E: de::Error,
            {
                let bytes: [u8; 32] = v
                    .try_into()
                    .map_err(|_| E::custom("expected 32 bytes"))?;
                Ok(B32(bytes))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(B32Visitor)
        } else {
            deserializer.deserialize_bytes(B32Visitor)
        }
    }
}

/// Transaction ID. Displayed in reversed-hex, as transaction IDs are
/// conventionally shown by Bitcoin tooling.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct TxId(pub [u8; 32]);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = self.0;
        bytes.reverse();
        f.write_str(&hex::encode(bytes))
    }
}

impl FromStr for TxId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| anyhow!("invalid txid hex: {}", e))?;
        let mut bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("expected 32 bytes of txid"))?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl Serialize for TxId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TxIdVisitor;

        impl<'de> Visitor<'de> for TxIdVisitor {
            type Value = TxId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a transaction id as hex string or 32 bytes")
            }

            fn visit_str<E>(self, value: &str) -> Result<TxId, E>
            where
                E: de::Error,
            {
                value.parse().map_err(E::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<TxId, E>
            where
                E: de::Error,
            {
                let bytes: [u8; 32] = v
                    .try_into()
                    .map_err(|_| E::custom("expected 32 bytes"))?;
                Ok(TxId(bytes))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(TxIdVisitor)
        } else {
            deserializer.deserialize_bytes(TxIdVisitor)
        }
    }
}

/// ID of a transaction output: `(transaction ID, output index)`.
/// String form is `txid_hex:index`. Binary form is 36 bytes.
#[derive(Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct UtxoId(pub TxId, pub u32);

impl UtxoId {
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..32].copy_from_slice(&self.0 .0);
        bytes[32..].copy_from_slice(&self.1.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 36]) -> Self {
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[..32]);
        let index = u32::from_le_bytes(bytes[32..].try_into().expect("4 bytes"));
        UtxoId(TxId(txid), index)
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

impl FromStr for UtxoId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (txid, index) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected format: txid_hex:index"))?;
        let txid = txid.parse()?;
        let index = index
            .parse::<u32>()
            .map_err(|e| anyhow!("invalid index: {}", e))?;
        Ok(UtxoId(txid, index))
    }
}

impl Serialize for UtxoId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(self.to_bytes().as_ref())
        }
    }
}

impl<'de> Deserialize<'de> for UtxoId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct UtxoIdVisitor;

        impl<'de> Visitor<'de> for UtxoIdVisitor {
            type Value = UtxoId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string in format 'txid_hex:index' or 36 bytes")
            }

            fn visit_str<E>(self, value: &str) -> Result<UtxoId, E>
            where
                E: de::Error,
            {
                value.parse().map_err(E::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<UtxoId, E>
            where
                E: de::Error,
            {
                let bytes: [u8; 36] = v
                    .try_into()
                    .map_err(|_| E::custom("expected 36 bytes"))?;
                Ok(UtxoId::from_bytes(bytes))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(UtxoIdVisitor)
        } else {
            deserializer.deserialize_bytes(UtxoIdVisitor)
        }
    }
}

/// Tag of fungible token apps.
pub const TOKEN: char = 't';
/// Tag of NFT apps.
pub const NFT: char = 'n';

/// Reference to an application governing charms.
/// String form is `tag/identity_hex/vk_hex`.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct App {
    /// Kind of the app: [`TOKEN`], [`NFT`] or another single character.
    pub tag: char,
    /// App identity. Usually the hash of the UTXO the app was minted from.
    pub identity: B32,
    /// SHA-256 hash of the app's binary. Content-addresses the program.
    pub vk: B32,
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tag, self.identity, self.vk)
    }
}

impl FromStr for App {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        ensure!(
            parts.len() == 3,
            "expected format: tag/identity_hex/vk_hex"
        );
        let mut chars = parts[0].chars();
        let tag = chars.next().ok_or_else(|| anyhow!("expected tag"))?;
        ensure!(chars.next().is_none(), "tag must be a single character");
        let identity = parts[1].parse()?;
        let vk = parts[2].parse()?;
        Ok(App { tag, identity, vk })
    }
}

impl Serialize for App {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            let mut s = serializer.serialize_tuple(3)?;
            s.serialize_element(&self.tag)?;
            s.serialize_element(&self.identity)?;
            s.serialize_element(&self.vk)?;
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for App {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AppVisitor;

        impl<'de> Visitor<'de> for AppVisitor {
            type Value = App;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter
                    .write_str("a string in format 'tag/identity_hex/vk_hex' or a 3-tuple")
            }

            fn visit_str<E>(self, value: &str) -> Result<App, E>
            where
                E: de::Error,
            {
                value.parse().map_err(E::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<App, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let tag = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::missing_field("tag"))?;
                let identity = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::missing_field("identity"))?;
                let vk = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::missing_field("vk"))?;
                Ok(App { tag, identity, vk })
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(AppVisitor)
        } else {
            deserializer.deserialize_tuple(3, AppVisitor)
        }
    }
}

/// Arbitrary app data. Stored as CBOR bytes, presented as a structured value
/// in human-readable formats.
#[derive(Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Data(Vec<u8>);

impl Data {
    pub fn empty() -> Self {
        Self(vec![])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the data as a `T`.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        ciborium::de::from_reader(self.0.as_slice())
            .map_err(|e| anyhow!("failed to decode Data: {}", e))
    }
}

impl<T: Serialize> From<&T> for Data {
    fn from(value: &T) -> Self {
        let mut bytes = vec![];
        ciborium::ser::into_writer(value, &mut bytes)
            .expect("CBOR encoding into a Vec cannot fail");
        Self(bytes)
    }
}

impl Serialize for Data {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            if self.is_empty() {
                return serializer.serialize_unit();
            }
            let value: Value = self.value().map_err(serde::ser::Error::custom)?;
            value.serialize(serializer)
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let value = Value::deserialize(deserializer)?;
            if value == Value::Null {
                return Ok(Data::empty());
            }
            Ok(Data::from(&value))
        } else {
            struct BytesVisitor;

            impl<'de> Visitor<'de> for BytesVisitor {
                type Value = Data;

                fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                    formatter.write_str("CBOR bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Data, E>
                where
                    E: de::Error,
                {
                    Ok(Data(v.to_vec()))
                }
            }

            deserializer.deserialize_bytes(BytesVisitor)
        }
    }
}

/// Charm content of a single output: maps apps to their data in this output.
pub type Charms = BTreeMap<App, Data>;

/// Transaction as seen by the apps: charm content of inputs, reference inputs
/// and outputs. No chain-level details (sats, scripts) are visible here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Charms of the consumed UTXOs, in transaction input order.
    pub ins: Vec<(UtxoId, Charms)>,
    /// Charms of read-only reference UTXOs.
    pub refs: Vec<(UtxoId, Charms)>,
    /// Charms of the created outputs, in transaction output order.
    pub outs: Vec<Charms>,
}

impl Transaction {
    /// Transaction IDs of all UTXOs consumed or referenced by this transaction.
    pub fn prev_txids(&self) -> BTreeSet<&TxId> {
        self.ins
            .iter()
            .chain(self.refs.iter())
            .map(|(utxo_id, _)| &utxo_id.0)
            .collect()
    }
}

/// Value of a transaction output at the chain level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeOutput {
    /// Amount in the chain's native units (sats).
    pub amount: u64,
    /// Destination script bytes.
    pub dest: Vec<u8>,
}

/// Binaries and private inputs of the apps exercised by a spell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppInput {
    /// App binaries keyed by their VK (SHA-256 of the binary).
    pub app_binaries: BTreeMap<B32, Vec<u8>>,
    /// Private inputs keyed by app.
    pub app_private_inputs: BTreeMap<App, Data>,
}

/// Evaluate the condition. If false, print it to stderr and
/// `return false` from the enclosing function.
#[macro_export]
macro_rules! check {
    ($condition:expr) => {
        if !($condition) {
            eprintln!("check failed: {}", stringify!($condition));
            return false;
        }
    };
}

/// Can the transition be accepted for `app` without running its binary?
/// True iff the app's charms are merely moved: token amounts balanced for
/// token apps, state multiset preserved for NFT apps.
pub fn is_simple_transfer(app: &App, tx: &Transaction) -> bool {
    match app.tag {
        TOKEN => token_amounts_balanced(app, tx),
        NFT => nft_state_preserved(app, tx),
        _ => false,
    }
}

pub fn token_amounts_balanced(app: &App, tx: &Transaction) -> bool {
    let ins = tx.ins.iter().map(|(_, charms)| charms);
    let outs = tx.outs.iter();
    match (sum_token_amount(app, ins), sum_token_amount(app, outs)) {
        (Ok(amount_in), Ok(amount_out)) => amount_in == amount_out,
        (..) => false,
    }
}

pub fn nft_state_preserved(app: &App, tx: &Transaction) -> bool {
    let ins = tx.ins.iter().map(|(_, charms)| charms);
    let outs = tx.outs.iter();
    app_state_multiset(app, ins) == app_state_multiset(app, outs)
}

pub fn sum_token_amount<'a>(
    app: &App,
    charms_iter: impl Iterator<Item = &'a Charms>,
) -> Result<u64> {
    let mut total: u64 = 0;
    for charms in charms_iter {
        if let Some(state) = charms.get(app) {
            let amount: u64 = state.value()?;
            total = total
                .checked_add(amount)
                .ok_or_else(|| anyhow!("token amount overflow"))?;
        }
    }
    Ok(total)
}

pub fn app_state_multiset<'a>(
    app: &App,
    charms_iter: impl Iterator<Item = &'a Charms>,
) -> BTreeMap<&'a Data, usize> {
    charms_iter
        .filter_map(|charms| charms.get(app))
        .fold(BTreeMap::new(), |mut r, s| {
            *r.entry(s).or_insert(0) += 1;
            r
        })
}

pub mod util {
    use super::*;

    /// Serialize a value to CBOR bytes.
    pub fn write<T: Serialize>(t: &T) -> Result<Vec<u8>> {
        let mut buf = vec![];
        ciborium::ser::into_writer(t, &mut buf)
            .map_err(|e| anyhow!("failed to write CBOR: {}", e))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR bytes.
    pub fn read<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
        ciborium::de::from_reader(buf).map_err(|e| anyhow!("failed to read CBOR: {}", e))
    }
}
