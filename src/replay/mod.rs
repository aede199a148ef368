//! Pull-based iterators over historical chain data.
//!
//! Both replays walk a fixed `[from_height, from_height + count)` range in
//! node-friendly chunks and are driven by the stream handlers, which pace
//! the calls and report delivered blocks to the mediator.

pub mod headers;
pub mod transactions;

pub use headers::{HeaderBatch, HistoricalHeaderReplay, MAX_HEADERS_PER_CHUNK};
pub use transactions::{
    HistoricalTransactionReplay, TransactionReplayBatch, MAX_BLOCKS_PER_REQUEST,
};
