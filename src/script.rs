use bitcoin::{
    ScriptBuf, XOnlyPublicKey,
    constants::MAX_SCRIPT_ELEMENT_SIZE,
    opcodes::{
        OP_FALSE, OP_TRUE,
        all::{OP_ENDIF, OP_IF},
    },
    script::{Builder, PushBytes},
    secp256k1::Secp256k1,
    taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo},
};
use charms_client::bitcoin_tx::SPELL_MARKER;

/// x-coordinate of the BIP-341 "nothing up my sleeve" point. Using it as the
/// internal key makes key-path spending impossible, so the commit output can
/// only be spent via the spell script, with no signature involved.
const NUMS_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
    0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80,
    0x3a, 0xc0,
];

pub fn nums_key() -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&NUMS_KEY).expect("NUMS_KEY is a valid x-only public key")
}

pub fn control_block(script: ScriptBuf) -> ControlBlock {
    taproot_spend_info(script.clone())
        .control_block(&(script, LeafVersion::TapScript))
        .expect("the script is the only leaf")
}

/// Tapscript carrying the spell envelope. The envelope sits in an unexecuted
/// `OP_FALSE OP_IF .. OP_ENDIF` branch; the script itself reduces to `OP_TRUE`,
/// so spending it needs no signature and stays fully deterministic.
pub fn data_script(data: &[u8]) -> ScriptBuf {
    let builder = ScriptBuf::builder();
    push_envelope(builder, data).push_opcode(OP_TRUE).into_script()
}

fn push_envelope(builder: Builder, data: &[u8]) -> Builder {
    let mut builder = builder
        .push_opcode(OP_FALSE)
        .push_opcode(OP_IF)
        .push_slice::<&PushBytes>(SPELL_MARKER.try_into().expect("marker fits in a push"));
    for chunk in data.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
        builder = builder.push_slice::<&PushBytes>(chunk.try_into().expect("chunk fits in a push"));
    }
    builder.push_opcode(OP_ENDIF)
}

pub fn taproot_spend_info(script: ScriptBuf) -> TaprootSpendInfo {
    let secp256k1 = Secp256k1::new();
    TaprootBuilder::new()
        .add_leaf(0, script)
        .expect("a single leaf at depth 0 is a valid Taproot tree")
        .finalize(&secp256k1, nums_key())
        .expect("a single-leaf tree finalizes")
}
