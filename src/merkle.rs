//! Partial merkle trees and merkle blocks.
//!
//! A merkle block is a block header plus the minimal set of internal tree
//! hashes needed to prove that specific transactions are committed to by the
//! header's merkle root, without shipping the whole block. The construction
//! and traversal follow the BIP37 depth-first encoding, so the wire bytes are
//! interchangeable with what chain nodes produce and SPV clients verify.

use bitcoin::{
    block::Header,
    consensus::{deserialize, serialize},
    hashes::{sha256d, Hash},
    TxMerkleNode, Txid,
};

use crate::{
    bloom::{read_compact_size, write_compact_size},
    GatewayError,
};

/// The pruned merkle tree of one block: for every reachable node a flag bit,
/// and a hash for every node whose subtree is not descended into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMerkleTree {
    num_transactions: u32,
    bits: Vec<bool>,
    hashes: Vec<TxMerkleNode>,
}

impl PartialMerkleTree {
    /// Builds the proof for a block's transaction list.
    ///
    /// `txids` must be the complete transaction list in block order and
    /// `matched` a parallel flag vector. An all-false `matched` produces a
    /// structurally valid tree revealing nothing; callers normally suppress
    /// sending those.
    ///
    /// # Panics
    ///
    /// Panics if `txids` is empty or the lengths differ; a block always has
    /// at least its coinbase transaction.
    #[must_use]
    pub fn from_txids(txids: &[Txid], matched: &[bool]) -> Self {
        assert!(!txids.is_empty(), "a block has at least one transaction");
        assert_eq!(txids.len(), matched.len(), "matched flags must parallel txids");

        let mut tree = PartialMerkleTree {
            num_transactions: txids.len() as u32,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        let mut height = 0;
        while tree.width(height) > 1 {
            height += 1;
        }
        tree.build(height, 0, txids, matched);
        tree
    }

    #[must_use]
    pub fn num_transactions(&self) -> u32 {
        self.num_transactions
    }

    #[must_use]
    pub fn hashes(&self) -> &[TxMerkleNode] {
        &self.hashes
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Walks the tree, recomputing the merkle root and collecting the
    /// revealed (matched) txids with their in-block indexes.
    ///
    /// # Errors
    ///
    /// Fails when the encoded bits/hashes are inconsistent with the declared
    /// transaction count — over- or under-consumed, or containing the
    /// duplicate-subtree pattern of CVE-2012-2459.
    pub fn extract_matches(
        &self,
        matches: &mut Vec<Txid>,
        indexes: &mut Vec<u32>,
    ) -> Result<TxMerkleNode, GatewayError> {
        if self.num_transactions == 0 {
            return Err(GatewayError::MalformedMerkleBlock("zero transactions"));
        }
        if self.hashes.len() > self.num_transactions as usize {
            return Err(GatewayError::MalformedMerkleBlock("more hashes than transactions"));
        }
        if self.bits.len() < self.hashes.len() {
            return Err(GatewayError::MalformedMerkleBlock("fewer bits than hashes"));
        }

        let mut height = 0;
        while self.width(height) > 1 {
            height += 1;
        }

        let mut bits_used = 0;
        let mut hashes_used = 0;
        let root =
            self.traverse(height, 0, &mut bits_used, &mut hashes_used, matches, indexes)?;

        if hashes_used != self.hashes.len() {
            return Err(GatewayError::MalformedMerkleBlock("unconsumed hashes"));
        }
        // Trailing bits only pad to the byte boundary and must be zero.
        if self.bits[bits_used..].iter().any(|bit| *bit) {
            return Err(GatewayError::MalformedMerkleBlock("unconsumed flag bits set"));
        }

        Ok(root)
    }

    fn width(&self, height: u32) -> u32 {
        (self.num_transactions + (1 << height) - 1) >> height
    }

    fn build(&mut self, height: u32, pos: u32, txids: &[Txid], matched: &[bool]) {
        let begin = ((pos as u64) << height) as usize;
        let end = usize::min(txids.len(), (((pos as u64) + 1) << height) as usize);
        let parent_of_match = matched[begin..end].iter().any(|m| *m);

        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            self.hashes.push(self.calc_hash(height, pos, txids));
        } else {
            self.build(height - 1, pos * 2, txids, matched);
            if pos * 2 + 1 < self.width(height - 1) {
                self.build(height - 1, pos * 2 + 1, txids, matched);
            }
        }
    }

    fn calc_hash(&self, height: u32, pos: u32, txids: &[Txid]) -> TxMerkleNode {
        if height == 0 {
            return TxMerkleNode::from_byte_array(txids[pos as usize].to_byte_array());
        }
        let left = self.calc_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1, txids)
        } else {
            // Odd node count at this level: the last hash pairs with itself.
            left
        };
        combine(left, right)
    }

    fn traverse(
        &self,
        height: u32,
        pos: u32,
        bits_used: &mut usize,
        hashes_used: &mut usize,
        matches: &mut Vec<Txid>,
        indexes: &mut Vec<u32>,
    ) -> Result<TxMerkleNode, GatewayError> {
        let Some(&parent_of_match) = self.bits.get(*bits_used) else {
            return Err(GatewayError::MalformedMerkleBlock("flag bits overrun"));
        };
        *bits_used += 1;

        if height == 0 || !parent_of_match {
            let Some(&hash) = self.hashes.get(*hashes_used) else {
                return Err(GatewayError::MalformedMerkleBlock("hash list overrun"));
            };
            *hashes_used += 1;

            if height == 0 && parent_of_match {
                matches.push(Txid::from_byte_array(hash.to_byte_array()));
                indexes.push(pos);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2, bits_used, hashes_used, matches, indexes)?;
        let right = if pos * 2 + 1 < self.width(height - 1) {
            let right =
                self.traverse(height - 1, pos * 2 + 1, bits_used, hashes_used, matches, indexes)?;
            if right == left {
                return Err(GatewayError::MalformedMerkleBlock("duplicate subtree hashes"));
            }
            right
        } else {
            left
        };
        Ok(combine(left, right))
    }
}

fn combine(left: TxMerkleNode, right: TxMerkleNode) -> TxMerkleNode {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(left.as_byte_array());
    concat[32..].copy_from_slice(right.as_byte_array());
    TxMerkleNode::from_byte_array(sha256d::Hash::hash(&concat).to_byte_array())
}

/// A block header together with the partial merkle tree of its matched
/// transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: Header,
    pub tree: PartialMerkleTree,
}

impl MerkleBlock {
    #[must_use]
    pub fn from_header_txids(header: Header, txids: &[Txid], matched: &[bool]) -> Self {
        MerkleBlock { header, tree: PartialMerkleTree::from_txids(txids, matched) }
    }

    #[must_use]
    pub fn block_hash(&self) -> bitcoin::BlockHash {
        self.header.block_hash()
    }

    /// Wire encoding: 80-byte header, transaction count (u32 LE),
    /// compact-size hash count, hashes in internal byte order, compact-size
    /// flag-byte count, flag bits packed little-endian first.
    ///
    /// This is the historical `merkleblock` message layout that downstream
    /// consumers verify; byte order must never change.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = serialize(&self.header);
        bytes.extend_from_slice(&self.tree.num_transactions.to_le_bytes());

        write_compact_size(&mut bytes, self.tree.hashes.len() as u64);
        for hash in &self.tree.hashes {
            bytes.extend_from_slice(hash.as_byte_array());
        }

        let mut flag_bytes = vec![0u8; self.tree.bits.len().div_ceil(8)];
        for (position, bit) in self.tree.bits.iter().enumerate() {
            if *bit {
                flag_bytes[position / 8] |= 1 << (position % 8);
            }
        }
        write_compact_size(&mut bytes, flag_bytes.len() as u64);
        bytes.extend_from_slice(&flag_bytes);
        bytes
    }

    /// Decodes the wire layout produced by [`MerkleBlock::to_bytes`] (and by
    /// chain nodes).
    ///
    /// # Errors
    ///
    /// Fails on truncated input or an undecodable header. Tree consistency
    /// is not checked here; that happens in
    /// [`PartialMerkleTree::extract_matches`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        if bytes.len() < 84 {
            return Err(GatewayError::MalformedMerkleBlock("truncated header"));
        }
        let header: Header = deserialize(&bytes[..80])
            .map_err(|_| GatewayError::MalformedMerkleBlock("undecodable header"))?;

        let num_transactions =
            u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]);
        let mut pos = 84;

        let hash_count = read_compact_size(bytes, &mut pos)
            .ok_or(GatewayError::MalformedMerkleBlock("truncated hash count"))?;
        // The declared count is untrusted input; bound it by what the buffer
        // can actually hold before allocating.
        if hash_count > ((bytes.len() - pos) / 32) as u64 {
            return Err(GatewayError::MalformedMerkleBlock("hash count exceeds remaining bytes"));
        }
        let mut hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            let raw = bytes
                .get(pos..pos + 32)
                .ok_or(GatewayError::MalformedMerkleBlock("truncated hashes"))?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(raw);
            hashes.push(TxMerkleNode::from_byte_array(hash));
            pos += 32;
        }

        let flag_byte_count = read_compact_size(bytes, &mut pos)
            .ok_or(GatewayError::MalformedMerkleBlock("truncated flag count"))?;
        if flag_byte_count > (bytes.len() - pos) as u64 {
            return Err(GatewayError::MalformedMerkleBlock("truncated flag bits"));
        }
        let flag_bytes = bytes
            .get(pos..pos + flag_byte_count as usize)
            .ok_or(GatewayError::MalformedMerkleBlock("truncated flag bits"))?;
        pos += flag_byte_count as usize;

        if pos != bytes.len() {
            return Err(GatewayError::MalformedMerkleBlock("trailing bytes"));
        }

        let mut bits = Vec::with_capacity(flag_bytes.len() * 8);
        for byte in flag_bytes {
            for shift in 0..8 {
                bits.push(byte & (1 << shift) != 0);
            }
        }

        Ok(MerkleBlock {
            header,
            tree: PartialMerkleTree { num_transactions, bits, hashes },
        })
    }
}
