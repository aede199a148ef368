//! BIP37 transaction matching against a bloom filter.

use bitcoin::{hashes::Hash, script::Instruction, Script, Transaction};

use crate::bloom::{BloomFilter, BloomFlags};

/// Tests `tx` against `filter`, mutating the filter per BIP37.
///
/// A transaction matches when the filter contains its txid, any non-empty
/// push-data chunk of any output script, any input's previous outpoint, or
/// any push-data chunk of an input's unlocking script. Checks run cheapest
/// first (txid, outputs, inputs) since most filters are output-oriented.
///
/// When an output matches and the filter's update flags allow it, the
/// output's outpoint (`txid ++ vout` as u32 LE) is inserted back into the
/// filter, so a later transaction spending that output matches too. The
/// self-growing filter is required BIP37 behavior, not an accident.
pub fn matches_transaction(filter: &mut BloomFilter, tx: &Transaction) -> bool {
    let txid = tx.compute_txid();
    let mut matched = filter.contains(txid.as_byte_array());

    for (index, output) in tx.output.iter().enumerate() {
        if !script_push_data_matches(filter, &output.script_pubkey) {
            continue;
        }
        matched = true;

        let update = match filter.flags() {
            BloomFlags::All => true,
            BloomFlags::PubkeyOnly => {
                output.script_pubkey.is_p2pk() || output.script_pubkey.is_multisig()
            }
            BloomFlags::None => false,
        };
        if update {
            let mut outpoint = Vec::with_capacity(36);
            outpoint.extend_from_slice(txid.as_byte_array());
            outpoint.extend_from_slice(&(index as u32).to_le_bytes());
            filter.insert(&outpoint);
        }
    }

    if matched {
        return true;
    }

    for input in &tx.input {
        let mut outpoint = Vec::with_capacity(36);
        outpoint.extend_from_slice(input.previous_output.txid.as_byte_array());
        outpoint.extend_from_slice(&input.previous_output.vout.to_le_bytes());

        if filter.contains(&outpoint) {
            return true;
        }
        if script_push_data_matches(filter, &input.script_sig) {
            return true;
        }
    }

    false
}

/// True if any non-empty push-data chunk of `script` is in the filter.
/// Zero-length pushes and bare opcodes never match. Iteration stops at the
/// first malformed opcode, mirroring script parsing on the node side.
fn script_push_data_matches(filter: &BloomFilter, script: &Script) -> bool {
    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(push)) => {
                if !push.is_empty() && filter.contains(push.as_bytes()) {
                    return true;
                }
            }
            Ok(Instruction::Op(_)) => {}
            Err(_) => break,
        }
    }
    false
}
