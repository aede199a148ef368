//! spv-gateway streams filter-matched blockchain data to light clients.
//!
//! A client registers a BIP37 bloom filter and receives, over a single
//! stream, the matching historical transactions with merkle proofs followed
//! by live matches as they happen; a second stream serves raw block headers
//! with chain locks. The crate owns the matching, proof construction,
//! replay/live merging, and per-subscription bookkeeping; the gRPC surface
//! and the chain node client stay outside, plugged in through
//! [`CoreRpc`] and [`registry::EventSource`].
//!
//! # Entry points
//!
//! [`subscribe_to_transactions_with_proofs`] and
//! [`subscribe_to_block_headers_with_chain_locks`] validate the request and
//! return a [`ReceiverStream`](tokio_stream::wrappers::ReceiverStream) of
//! `Result` items plus a [`StreamHandle`]; dropping the handle tears the
//! subscription down. Live events enter the process through
//! [`registry::run_event_pump`].
//!
//! # Ordering
//!
//! Per subscription, every matched item is delivered exactly once: the
//! historical replay and the live feed are merged by a per-subscription
//! mediator that buffers live events until the replay completes and purges
//! whatever the replay already covered. For any one block, raw transactions
//! precede the merkle block that proves them.
//!
//! # Errors
//!
//! Request validation fails fast with a [`GatewayError`] before any state is
//! registered. After that, node failures end the stream with a final `Err`
//! item; client disconnects and cancellations end it cleanly.

pub mod bloom;
pub mod cache;
pub mod core_rpc;
pub mod filter_matcher;
pub mod mediator;
pub mod merkle;
pub mod registry;
pub mod replay;
pub mod streams;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod error;
mod types;

pub use bloom::{BloomFilter, BloomFlags, MAX_FILTER_DATA_SIZE, MAX_HASH_FUNCS};
pub use core_rpc::{BlockInfo, BlockRef, CoreRpc, CoreRpcError};
pub use error::GatewayError;
pub use merkle::{MerkleBlock, PartialMerkleTree};
pub use streams::{
    subscribe_to_block_headers_with_chain_locks, subscribe_to_transactions_with_proofs,
    HeaderStreamRequest, StartPoint, StreamHandle, TransactionStreamRequest,
};
pub use types::{
    BlockHeadersItem, ChainEvent, ChainLock, InstantLockMessage, StreamResult,
    TransactionsWithProofsItem,
};
