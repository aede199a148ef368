//! Historical replay of filter-matched transactions with proofs.

use std::{collections::VecDeque, sync::Arc};

use bitcoin::{BlockHash, Txid};
use tracing::debug;

use crate::{core_rpc::CoreRpc, merkle::MerkleBlock, GatewayError};

/// Upper bound on blocks per `get_merkle_blocks` node call.
pub const MAX_BLOCKS_PER_REQUEST: u32 = 2000;

/// Everything delivered for one historical block: the matched raw
/// transactions first, then the merkle block proving them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReplayBatch {
    pub block_hash: BlockHash,
    pub transactions: Vec<Vec<u8>>,
    pub merkle_block: Vec<u8>,
}

/// Walks `count` blocks from `from_height`, yielding one matched block per
/// [`next`](HistoricalTransactionReplay::next) call.
///
/// The node is asked for merkle blocks in ranges of up to
/// [`MAX_BLOCKS_PER_REQUEST`]; ranges without any match are skipped
/// silently, so a subscription over a quiet chain segment ends without
/// producing anything.
pub struct HistoricalTransactionReplay<C: CoreRpc> {
    core: Arc<C>,
    filter_bytes: Vec<u8>,
    next_height: u32,
    remaining: u32,
    fetched: VecDeque<Vec<u8>>,
}

impl<C: CoreRpc> HistoricalTransactionReplay<C> {
    #[must_use]
    pub fn new(core: Arc<C>, filter_bytes: Vec<u8>, from_height: u32, count: u32) -> Self {
        HistoricalTransactionReplay {
            core,
            filter_bytes,
            next_height: from_height,
            remaining: count,
            fetched: VecDeque::new(),
        }
    }

    /// The next matched historical block, or `None` once the range is
    /// exhausted.
    pub async fn next(&mut self) -> Result<Option<TransactionReplayBatch>, GatewayError> {
        loop {
            if let Some(raw_merkle_block) = self.fetched.pop_front() {
                return Ok(Some(self.assemble_batch(raw_merkle_block).await?));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.fetch_next_range().await?;
        }
    }

    async fn fetch_next_range(&mut self) -> Result<(), GatewayError> {
        let range_len = self.remaining.min(MAX_BLOCKS_PER_REQUEST);
        let from_hash = self.core.get_block_hash(self.next_height).await?;

        debug!(
            from_height = self.next_height,
            blocks = range_len,
            "Requesting historical merkle blocks"
        );
        let raw_merkle_blocks =
            self.core.get_merkle_blocks(&self.filter_bytes, from_hash, range_len).await?;

        self.next_height += range_len;
        self.remaining -= range_len;
        self.fetched.extend(raw_merkle_blocks);
        Ok(())
    }

    async fn assemble_batch(
        &self,
        raw_merkle_block: Vec<u8>,
    ) -> Result<TransactionReplayBatch, GatewayError> {
        let merkle_block = MerkleBlock::from_bytes(&raw_merkle_block)?;

        let mut matched: Vec<Txid> = Vec::new();
        let mut indexes = Vec::new();
        merkle_block.tree.extract_matches(&mut matched, &mut indexes)?;

        let mut transactions = Vec::with_capacity(matched.len());
        for txid in matched {
            transactions.push(self.core.get_raw_transaction(txid).await?);
        }

        Ok(TransactionReplayBatch {
            block_hash: merkle_block.block_hash(),
            transactions,
            merkle_block: raw_merkle_block,
        })
    }
}
