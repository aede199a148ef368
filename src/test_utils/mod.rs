//! Builders, a mock node client, and stream assertion macros for tests.
//!
//! Compiled for the crate's own tests and, behind the `test-utils` feature,
//! for downstream integration tests.

pub mod macros;

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version},
    consensus::serialize,
    hashes::Hash,
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, PubkeyHash, ScriptBuf,
    Sequence, Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

use crate::{
    core_rpc::{BlockInfo, BlockRef, CoreRpc, CoreRpcError},
    types::ChainLock,
};

/// A standalone header whose fields are derived from `seed`.
pub fn make_header(seed: u8) -> Header {
    Header {
        version: Version::from_consensus(2),
        prev_blockhash: BlockHash::from_byte_array([seed; 32]),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_700_000_000 + u32::from(seed),
        bits: CompactTarget::from_consensus(0x1d00_ffff),
        nonce: u32::from(seed),
    }
}

/// A block with the given transactions and a consistent merkle root.
pub fn make_block(seed: u8, txdata: Vec<Transaction>) -> Block {
    let mut block = Block { header: make_header(seed), txdata };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

/// A chain of `len` empty blocks with unique hashes, heights 1 onward.
pub fn make_chain(len: u32) -> Vec<Block> {
    (0..len)
        .map(|i| Block {
            header: Header {
                version: Version::from_consensus(2),
                prev_blockhash: BlockHash::from_byte_array([0xEE; 32]),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000 + i,
                bits: CompactTarget::from_consensus(0x1d00_ffff),
                nonce: i,
            },
            txdata: vec![],
        })
        .collect()
}

/// A minimal transaction paying to the hash `[seed; 20]`; distinct seeds
/// yield distinct txids.
pub fn make_tx(seed: u8) -> Transaction {
    make_tx_paying(seed, [seed; 20])
}

/// A transaction with a seed-unique input paying to `address_hash`.
pub fn make_tx_paying(seed: u8, address_hash: [u8; 20]) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: Txid::from_byte_array([seed; 32]), vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1000 + u64::from(seed)),
            script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(address_hash)),
        }],
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Chain blocks; index 0 is height 1.
    blocks: Vec<Block>,
    /// Txids the node pretends the subscription filter matches.
    matching: HashSet<Txid>,
    chain_lock: Option<ChainLock>,
    mempool: Vec<Transaction>,
    fail_merkle_blocks: bool,
    merkle_block_requests: Vec<(BlockHash, u32)>,
    header_requests: Vec<(u32, u32)>,
}

/// In-memory stand-in for the chain node client.
///
/// Serves a fixed chain starting at height 1. `get_merkle_blocks` returns a
/// proof for every block in the requested range containing at least one
/// txid registered via [`MockChainNode::add_matching_txid`], and skips the
/// rest, which is how a real node responds to a filter.
#[derive(Debug, Default)]
pub struct MockChainNode {
    state: Mutex<MockState>,
}

impl MockChainNode {
    #[must_use]
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        MockChainNode {
            state: Mutex::new(MockState { blocks, ..MockState::default() }),
        }
    }

    pub fn add_matching_txid(&self, txid: Txid) {
        self.lock().matching.insert(txid);
    }

    pub fn set_chain_lock(&self, chain_lock: ChainLock) {
        self.lock().chain_lock = Some(chain_lock);
    }

    pub fn set_mempool(&self, transactions: Vec<Transaction>) {
        self.lock().mempool = transactions;
    }

    pub fn fail_merkle_blocks(&self) {
        self.lock().fail_merkle_blocks = true;
    }

    /// The `(from_hash, count)` of every `get_merkle_blocks` call so far.
    #[must_use]
    pub fn merkle_block_requests(&self) -> Vec<(BlockHash, u32)> {
        self.lock().merkle_block_requests.clone()
    }

    /// The `(from_height, count)` of every `get_block_headers` call so far.
    #[must_use]
    pub fn header_requests(&self) -> Vec<(u32, u32)> {
        self.lock().header_requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn height_of(blocks: &[Block], hash: BlockHash) -> Option<u32> {
    blocks.iter().position(|b| b.block_hash() == hash).map(|i| i as u32 + 1)
}

#[async_trait]
impl CoreRpc for MockChainNode {
    async fn get_block(&self, block: BlockRef) -> Result<BlockInfo, CoreRpcError> {
        let state = self.lock();
        let (found, height) = match block {
            BlockRef::Height(height) => (
                state.blocks.get(height.wrapping_sub(1) as usize),
                height,
            ),
            BlockRef::Hash(hash) => match height_of(&state.blocks, hash) {
                Some(height) => (state.blocks.get(height as usize - 1), height),
                None => (None, 0),
            },
        };
        let Some(found) = found else {
            return Err(CoreRpcError::BlockNotFound(block));
        };
        Ok(BlockInfo {
            hash: found.block_hash(),
            height,
            tx_ids: found.txdata.iter().map(Transaction::compute_txid).collect(),
        })
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash, CoreRpcError> {
        let state = self.lock();
        state
            .blocks
            .get(height.wrapping_sub(1) as usize)
            .map(Block::block_hash)
            .ok_or(CoreRpcError::HeightOutOfRange(height))
    }

    async fn get_merkle_blocks(
        &self,
        _filter: &[u8],
        from_hash: BlockHash,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, CoreRpcError> {
        let mut state = self.lock();
        state.merkle_block_requests.push((from_hash, count));
        if state.fail_merkle_blocks {
            return Err(CoreRpcError::Transport("merkle block fetch failed".into()));
        }

        let from_height = height_of(&state.blocks, from_hash)
            .ok_or(CoreRpcError::BlockNotFound(BlockRef::Hash(from_hash)))?;

        let mut merkle_blocks = Vec::new();
        for block in state
            .blocks
            .iter()
            .skip(from_height as usize - 1)
            .take(count as usize)
        {
            let txids: Vec<Txid> = block.txdata.iter().map(Transaction::compute_txid).collect();
            let matched: Vec<bool> = txids.iter().map(|id| state.matching.contains(id)).collect();
            if matched.iter().any(|m| *m) {
                let merkle_block =
                    crate::merkle::MerkleBlock::from_header_txids(block.header, &txids, &matched);
                merkle_blocks.push(merkle_block.to_bytes());
            }
        }
        Ok(merkle_blocks)
    }

    async fn get_raw_transaction(&self, txid: Txid) -> Result<Vec<u8>, CoreRpcError> {
        let state = self.lock();
        state
            .blocks
            .iter()
            .flat_map(|b| b.txdata.iter())
            .chain(state.mempool.iter())
            .find(|tx| tx.compute_txid() == txid)
            .map(|tx| serialize(tx))
            .ok_or_else(|| CoreRpcError::InvalidParameter(format!("unknown txid {txid}")))
    }

    async fn get_best_block_height(&self) -> Result<u32, CoreRpcError> {
        Ok(self.lock().blocks.len() as u32)
    }

    async fn get_best_chain_lock(&self) -> Result<Option<ChainLock>, CoreRpcError> {
        Ok(self.lock().chain_lock.clone())
    }

    async fn get_mempool_transaction_ids(&self) -> Result<Vec<Txid>, CoreRpcError> {
        Ok(self.lock().mempool.iter().map(Transaction::compute_txid).collect())
    }

    async fn get_block_headers(
        &self,
        from_height: u32,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, CoreRpcError> {
        let mut state = self.lock();
        state.header_requests.push((from_height, count));
        let last = from_height
            .checked_add(count)
            .ok_or(CoreRpcError::HeightOutOfRange(u32::MAX))?
            - 1;
        if from_height == 0 || last as usize > state.blocks.len() {
            return Err(CoreRpcError::HeightOutOfRange(last));
        }
        Ok(state
            .blocks
            .iter()
            .skip(from_height as usize - 1)
            .take(count as usize)
            .map(|b| serialize(&b.header))
            .collect())
    }
}
