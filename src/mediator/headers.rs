//! Reconciler for block-headers-with-chain-locks subscriptions.

use std::collections::HashSet;

use bitcoin::{consensus::serialize, BlockHash};

use crate::{
    mediator::Reconciler,
    types::{BlockHeadersItem, ChainEvent, ChainLock},
};

/// Buffers live headers (dedup by block hash) and the single most recent
/// chain lock.
///
/// Chain locks are last-write-wins: only the newest undelivered lock is ever
/// sent, and each distinct lock at most once.
#[derive(Debug, Default)]
pub struct HeaderReconciler {
    pending: Vec<(BlockHash, Vec<u8>)>,
    seen: HashSet<BlockHash>,
    pending_chain_lock: Option<ChainLock>,
    last_delivered_chain_lock: Option<ChainLock>,
}

impl HeaderReconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `lock` as already delivered, so a live repeat of the lock the
    /// subscription was greeted with is not sent twice.
    #[must_use]
    pub fn with_delivered_chain_lock(lock: Option<ChainLock>) -> Self {
        HeaderReconciler { last_delivered_chain_lock: lock, ..Self::default() }
    }
}

impl Reconciler for HeaderReconciler {
    type Item = BlockHeadersItem;

    fn observe(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::Block(block) => {
                let hash = block.block_hash();
                if self.seen.insert(hash) {
                    self.pending.push((hash, serialize(&block.header)));
                }
            }
            ChainEvent::ChainLock(lock) => {
                if self.last_delivered_chain_lock.as_ref() != Some(&lock) {
                    self.pending_chain_lock = Some(lock);
                }
            }
            ChainEvent::Transaction(_) | ChainEvent::InstantLock(_) => {}
        }
    }

    fn purge_delivered(&mut self, block_hashes: &[BlockHash]) {
        for hash in block_hashes {
            self.seen.insert(*hash);
        }
        self.pending.retain(|(hash, _)| !block_hashes.contains(hash));
    }

    fn drain(&mut self) -> Vec<BlockHeadersItem> {
        let mut items = Vec::new();

        if !self.pending.is_empty() {
            let headers = self.pending.drain(..).map(|(_, raw)| raw).collect();
            items.push(BlockHeadersItem::BlockHeaders(headers));
        }

        if let Some(lock) = self.pending_chain_lock.take() {
            items.push(BlockHeadersItem::ChainLock(lock.to_bytes()));
            self.last_delivered_chain_lock = Some(lock);
        }

        items
    }
}
