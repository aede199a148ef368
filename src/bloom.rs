//! BIP37 bloom filter.
//!
//! The filter is owned exclusively by one subscription and mutated in place
//! by the matcher (see [`filter_matcher`](crate::filter_matcher)), so its
//! matching power only ever grows over the subscription's lifetime.

use std::io::Cursor;

use bitcoin::hashes::{sha256d, Hash};

use crate::GatewayError;

/// Maximum serialized filter size in bytes (BIP37).
pub const MAX_FILTER_DATA_SIZE: usize = 36_000;
/// Maximum number of hash functions (BIP37).
pub const MAX_HASH_FUNCS: u32 = 50;

const SEED_MULTIPLIER: u32 = 0xFBA4_C795;

/// What the matcher inserts back into the filter when an output matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFlags {
    /// Never update the filter.
    None,
    /// Insert the outpoint of every matching output.
    All,
    /// Insert the outpoint only for pay-to-pubkey and bare multisig outputs.
    PubkeyOnly,
}

impl BloomFlags {
    /// Decodes the wire representation. Unknown values are rejected at
    /// subscription creation.
    pub fn from_consensus(value: u8) -> Result<Self, GatewayError> {
        match value {
            0 => Ok(BloomFlags::None),
            1 => Ok(BloomFlags::All),
            2 => Ok(BloomFlags::PubkeyOnly),
            _ => Err(GatewayError::InvalidBloomFilter("unknown nFlags value")),
        }
    }

    fn to_consensus(self) -> u8 {
        match self {
            BloomFlags::None => 0,
            BloomFlags::All => 1,
            BloomFlags::PubkeyOnly => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    n_hash_funcs: u32,
    n_tweak: u32,
    flags: BloomFlags,
}

impl BloomFilter {
    /// Validates and builds a filter from client-supplied parameters.
    ///
    /// # Errors
    ///
    /// Rejects an empty or oversized bit vector and an out-of-bound hash
    /// function count. This is the only place filter parameters are checked;
    /// the matching path assumes a well-formed filter.
    pub fn new(
        data: Vec<u8>,
        n_hash_funcs: u32,
        n_tweak: u32,
        flags: BloomFlags,
    ) -> Result<Self, GatewayError> {
        if data.is_empty() {
            return Err(GatewayError::InvalidBloomFilter("empty filter data"));
        }
        if data.len() > MAX_FILTER_DATA_SIZE {
            return Err(GatewayError::InvalidBloomFilter("filter data exceeds 36000 bytes"));
        }
        if n_hash_funcs == 0 || n_hash_funcs > MAX_HASH_FUNCS {
            return Err(GatewayError::InvalidBloomFilter("nHashFuncs out of bounds"));
        }
        Ok(Self { data, n_hash_funcs, n_tweak, flags })
    }

    #[must_use]
    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    /// Inserts `item` into the filter.
    pub fn insert(&mut self, item: &[u8]) {
        for i in 0..self.n_hash_funcs {
            let bit = self.bit_index(i, item);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
    }

    /// Tests whether `item` may be in the filter.
    #[must_use]
    pub fn contains(&self, item: &[u8]) -> bool {
        for i in 0..self.n_hash_funcs {
            let bit = self.bit_index(i, item);
            if self.data[bit >> 3] & (1 << (bit & 7)) == 0 {
                return false;
            }
        }
        true
    }

    fn bit_index(&self, hash_num: u32, item: &[u8]) -> usize {
        let seed = hash_num.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.n_tweak);
        // Reading from an in-memory cursor cannot fail.
        let hash = murmur3::murmur3_32(&mut Cursor::new(item), seed).unwrap_or(0);
        (hash as usize) % (self.data.len() * 8)
    }

    /// BIP37 `filterload` payload: compact-size data length, data,
    /// nHashFuncs (u32 LE), nTweak (u32 LE), nFlags (u8).
    ///
    /// This is the byte form handed to the node when requesting historical
    /// merkle blocks, and the form whose content hash identifies the
    /// subscription.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 12);
        write_compact_size(&mut bytes, self.data.len() as u64);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.n_hash_funcs.to_le_bytes());
        bytes.extend_from_slice(&self.n_tweak.to_le_bytes());
        bytes.push(self.flags.to_consensus());
        bytes
    }

    /// Content hash of the serialized filter, used as the registry key.
    #[must_use]
    pub fn content_hash(&self) -> [u8; 32] {
        sha256d::Hash::hash(&self.to_bytes()).to_byte_array()
    }
}

pub(crate) fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 0xFD {
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(0xFD);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFFFF_FFFF {
        out.push(0xFE);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn read_compact_size(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *bytes.get(*pos)?;
    *pos += 1;
    match first {
        0xFD => {
            let raw = bytes.get(*pos..*pos + 2)?;
            *pos += 2;
            Some(u64::from(u16::from_le_bytes([raw[0], raw[1]])))
        }
        0xFE => {
            let raw = bytes.get(*pos..*pos + 4)?;
            *pos += 4;
            Some(u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
        }
        0xFF => {
            let raw = bytes.get(*pos..*pos + 8)?;
            *pos += 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            Some(u64::from_le_bytes(buf))
        }
        small => Some(u64::from(small)),
    }
}
