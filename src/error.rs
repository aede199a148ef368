use std::{mem::discriminant, sync::Arc};

use thiserror::Error;

use crate::core_rpc::{BlockRef, CoreRpcError};

/// Errors emitted by the gateway.
///
/// `GatewayError` values are returned by stream-handler constructors during
/// request validation and are also yielded by open streams (as
/// `Err(GatewayError)` items) when something goes wrong mid-stream.
///
/// Validation errors are always surfaced before the first stream item, so a
/// caller that gets a stream back never has to clean up partial state.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// The supplied bloom filter parameters are malformed.
    #[error("Invalid bloom filter: {0}")]
    InvalidBloomFilter(&'static str),

    /// Neither a starting block hash nor a starting height >= 1 was given.
    #[error("Either starting block hash or starting block height must be provided")]
    MissingStartPoint,

    /// The requested range extends past the best chain tip.
    #[error("Requested range from height {from} with count {count} exceeds the chain tip {best}")]
    CountExceedsChainTip { from: u32, count: u32, best: u32 },

    /// The starting block could not be resolved by the node.
    #[error("Block not found: {0}")]
    NotFound(BlockRef),

    /// The node client failed for a reason other than a missing block.
    /// Passed through unchanged.
    #[error("Core RPC error: {0}")]
    CoreRpc(Arc<CoreRpcError>),

    /// The live event source could not be established within its retry
    /// budget. Fatal at process startup; never retried inside the core.
    #[error("Live event source unavailable after {attempts} attempts")]
    EventSourceUnavailable { attempts: u32 },

    /// A merkle block received from the node could not be decoded or its
    /// partial tree is inconsistent.
    #[error("Malformed merkle block: {0}")]
    MalformedMerkleBlock(&'static str),

    /// A raw block header received from the node could not be decoded.
    #[error("Malformed block header")]
    MalformedHeader,

    /// The background service backing a stream has shut down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<CoreRpcError> for GatewayError {
    fn from(error: CoreRpcError) -> GatewayError {
        match error {
            CoreRpcError::BlockNotFound(block) => GatewayError::NotFound(block),
            CoreRpcError::HeightOutOfRange(height) => {
                GatewayError::NotFound(BlockRef::Height(height))
            }
            other => GatewayError::CoreRpc(Arc::new(other)),
        }
    }
}

impl PartialEq for GatewayError {
    fn eq(&self, other: &GatewayError) -> bool {
        discriminant(self) == discriminant(other)
    }
}
