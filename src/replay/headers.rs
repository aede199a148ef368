//! Historical replay of raw block headers.

use std::sync::Arc;

use bitcoin::{block::Header, consensus::deserialize, BlockHash};
use tracing::debug;

use crate::{cache::HeaderCache, core_rpc::CoreRpc, GatewayError};

/// Upper bound on headers per `get_block_headers` node call.
pub const MAX_HEADERS_PER_CHUNK: u32 = 500;

/// One chunk of consecutive raw headers, with their hashes for delivery
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBatch {
    pub from_height: u32,
    pub headers: Vec<Vec<u8>>,
    pub block_hashes: Vec<BlockHash>,
}

/// Walks `count` headers from `from_height` in chunks of up to
/// [`MAX_HEADERS_PER_CHUNK`], going through the shared [`HeaderCache`] so
/// concurrent subscriptions replaying the same range hit the node once.
pub struct HistoricalHeaderReplay<C: CoreRpc> {
    core: Arc<C>,
    cache: Arc<HeaderCache>,
    next_height: u32,
    remaining: u32,
}

impl<C: CoreRpc> HistoricalHeaderReplay<C> {
    #[must_use]
    pub fn new(core: Arc<C>, cache: Arc<HeaderCache>, from_height: u32, count: u32) -> Self {
        HistoricalHeaderReplay { core, cache, next_height: from_height, remaining: count }
    }

    /// The next header chunk, or `None` once the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<HeaderBatch>, GatewayError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let chunk_len = self.remaining.min(MAX_HEADERS_PER_CHUNK);
        let from_height = self.next_height;

        let (headers, cached) = match self.cache.get_range(from_height, chunk_len) {
            Some(headers) => (headers, true),
            None => {
                debug!(from_height, count = chunk_len, "Fetching headers from node");
                (self.core.get_block_headers(from_height, chunk_len).await?, false)
            }
        };

        let mut block_hashes = Vec::with_capacity(headers.len());
        for (offset, raw) in headers.iter().enumerate() {
            let header: Header =
                deserialize(raw).map_err(|_| GatewayError::MalformedHeader)?;
            let hash = header.block_hash();
            block_hashes.push(hash);
            if !cached {
                self.cache.insert(from_height + offset as u32, hash, raw.clone());
            }
        }

        self.next_height += chunk_len;
        self.remaining -= chunk_len;
        Ok(Some(HeaderBatch { from_height, headers, block_hashes }))
    }
}
