//! Interface to the external chain node client.
//!
//! The gateway never talks HTTP/JSON-RPC itself; it is handed something
//! implementing [`CoreRpc`] and treats it as an opaque collaborator. The
//! concrete client (connection pooling, retries, serialization) lives outside
//! this crate.

use std::fmt;

use async_trait::async_trait;
use bitcoin::{BlockHash, Txid};
use thiserror::Error;

use crate::types::ChainLock;

/// A block identified either by hash or by height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Hash(BlockHash),
    Height(u32),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Hash(hash) => write!(f, "hash {hash}"),
            BlockRef::Height(height) => write!(f, "height {height}"),
        }
    }
}

impl From<BlockHash> for BlockRef {
    fn from(hash: BlockHash) -> Self {
        BlockRef::Hash(hash)
    }
}

impl From<u32> for BlockRef {
    fn from(height: u32) -> Self {
        BlockRef::Height(height)
    }
}

/// Errors surfaced by the node client.
///
/// `BlockNotFound` and `HeightOutOfRange` are remapped by the gateway to
/// [`GatewayError::NotFound`](crate::GatewayError::NotFound); everything else
/// propagates unchanged.
#[derive(Error, Debug)]
pub enum CoreRpcError {
    /// The requested block does not exist on the node's best chain.
    #[error("Block not found: {0}")]
    BlockNotFound(BlockRef),

    /// The requested height is past the node's chain tip.
    #[error("Block height {0} out of range")]
    HeightOutOfRange(u32),

    /// The node rejected a request parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Transport-level failure talking to the node.
    #[error("Node transport error: {0}")]
    Transport(String),
}

/// Minimal block metadata returned by [`CoreRpc::get_block`].
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub height: u32,
    pub tx_ids: Vec<Txid>,
}

/// Chain node operations the gateway depends on.
///
/// Raw byte payloads (`get_merkle_blocks`, `get_raw_transaction`,
/// `get_block_headers`) are returned consensus-encoded, exactly as the node
/// serves them; the gateway decodes only what it needs.
#[async_trait]
pub trait CoreRpc: Send + Sync + 'static {
    async fn get_block(&self, block: BlockRef) -> Result<BlockInfo, CoreRpcError>;

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash, CoreRpcError>;

    /// Merkle blocks in `[from_hash, from_hash + count)` whose transactions
    /// match the BIP37 `filter` bytes, consensus-encoded.
    async fn get_merkle_blocks(
        &self,
        filter: &[u8],
        from_hash: BlockHash,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, CoreRpcError>;

    async fn get_raw_transaction(&self, txid: Txid) -> Result<Vec<u8>, CoreRpcError>;

    async fn get_best_block_height(&self) -> Result<u32, CoreRpcError>;

    async fn get_best_chain_lock(&self) -> Result<Option<ChainLock>, CoreRpcError>;

    async fn get_mempool_transaction_ids(&self) -> Result<Vec<Txid>, CoreRpcError>;

    /// `count` consecutive raw 80-byte headers starting at `from_height`.
    async fn get_block_headers(
        &self,
        from_height: u32,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, CoreRpcError>;
}
