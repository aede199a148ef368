use std::{fmt::Debug, sync::Arc};

use bitcoin::{Block, BlockHash, Transaction, Txid};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::GatewayError;

/// A finality assertion for a block at a given height.
///
/// At most one chain lock is considered "current" at any time; a newer one
/// supersedes the previous without keeping history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLock {
    pub height: u32,
    pub block_hash: BlockHash,
    pub signature: Vec<u8>,
}

impl ChainLock {
    /// Wire form: height (u32 LE), block hash (internal byte order), signature.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        use bitcoin::hashes::Hash;

        let mut bytes = Vec::with_capacity(4 + 32 + self.signature.len());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(self.block_hash.as_byte_array());
        bytes.extend_from_slice(&self.signature);
        bytes
    }
}

/// A pre-confirmation transaction finality signal, pre-parsed by the event
/// transport so the core never has to understand its wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantLockMessage {
    pub txid: Txid,
    pub raw: Vec<u8>,
}

/// Live chain events fanned out by the
/// [`FilterSubscriptionRegistry`](crate::registry::FilterSubscriptionRegistry).
///
/// Blocks are shared behind `Arc` because every active subscription receives
/// the same block and blocks are the largest payload on the bus.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Transaction(Transaction),
    Block(Arc<Block>),
    InstantLock(InstantLockMessage),
    ChainLock(ChainLock),
}

/// Items yielded by the transactions-with-proofs stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionsWithProofsItem {
    /// Consensus-encoded transactions matching the subscription filter.
    RawTransactions(Vec<Vec<u8>>),
    /// A consensus-encoded merkle block proving the preceding transactions.
    RawMerkleBlock(Vec<u8>),
    /// Instant-lock messages for previously delivered transactions.
    InstantLockMessages(Vec<Vec<u8>>),
}

/// Items yielded by the block-headers-with-chain-locks stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHeadersItem {
    /// Raw 80-byte block headers in chain order.
    BlockHeaders(Vec<Vec<u8>>),
    /// The current chain lock, wire-encoded.
    ChainLock(Vec<u8>),
}

pub type StreamResult<T> = Result<T, GatewayError>;

/// Best-effort send into a client-facing stream channel.
///
/// Returns `false` once the downstream receiver is gone, which callers treat
/// as "client went away, stop producing".
pub(crate) trait TryStream<T> {
    async fn try_stream(&self, item: StreamResult<T>) -> bool;
}

impl<T: Debug> TryStream<T> for mpsc::Sender<StreamResult<T>> {
    async fn try_stream(&self, item: StreamResult<T>) -> bool {
        match &item {
            Ok(msg) => debug!(item = ?msg, "Sending stream item"),
            Err(err) => debug!(error = ?err, "Sending stream error"),
        }
        if self.send(item).await.is_err() {
            warn!("Downstream channel closed, stopping stream");
            return false;
        }
        true
    }
}
