//! Per-subscription reconciliation cache.
//!
//! Tracks what a transaction subscription has matched but not yet delivered,
//! which confirmed blocks those matches landed in, and which txids are still
//! waiting for an instant-lock signal. The cache never matches anything
//! itself; the mediator feeds it transactions that already passed the bloom
//! filter.

use std::collections::{HashMap, VecDeque};

use bitcoin::{Block, BlockHash, Transaction, Txid};
use tracing::debug;

use crate::merkle::MerkleBlock;

/// How many recent merkle blocks the cache retains. Evicting the oldest also
/// drops every transaction and proof tied to it.
pub const CACHE_SIZE: usize = 10;

/// For how many subsequent blocks a matched txid keeps waiting for its
/// instant lock. A txid first seen at block-count `H` is awaited through
/// `H + INSTANT_LOCK_HORIZON` inclusive.
pub const INSTANT_LOCK_HORIZON: u64 = 10;

#[derive(Debug)]
struct TxEntry {
    tx: Transaction,
    delivered: bool,
    /// Set once the transaction is seen confirmed in a retained block.
    block_hash: Option<BlockHash>,
}

#[derive(Debug)]
struct MerkleEntry {
    merkle_block: MerkleBlock,
    delivered: bool,
}

#[derive(Debug, Default)]
pub struct TransactionCache {
    transactions: HashMap<Txid, TxEntry>,
    /// Txids in arrival order; drives deterministic drain order.
    transaction_order: Vec<Txid>,
    /// Retained block hashes, oldest first.
    block_window: VecDeque<BlockHash>,
    merkle_blocks: HashMap<BlockHash, MerkleEntry>,
    /// Txid -> block-count at which it was first matched.
    instant_lock_waitlist: HashMap<Txid, u64>,
    blocks_processed: u64,
}

impl TransactionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a matched transaction.
    ///
    /// Idempotent by txid: a second add of the same transaction changes
    /// nothing, and in particular never resurrects an already-drained entry.
    /// The txid also enters the instant-lock waitlist at the current block
    /// count, first sighting only.
    pub fn add_transaction(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();

        self.instant_lock_waitlist.entry(txid).or_insert(self.blocks_processed);

        if self.transactions.contains_key(&txid) {
            return;
        }
        self.transactions
            .insert(txid, TxEntry { tx: tx.clone(), delivered: false, block_hash: None });
        self.transaction_order.push(txid);
    }

    /// Records a confirmed block.
    ///
    /// Always advances the block count and expires stale instant-lock
    /// waiters. If any of the block's transactions were previously matched,
    /// a merkle block proving exactly those is built and retained; a block
    /// containing none of them leaves the proof window untouched.
    pub fn add_block(&mut self, block: &Block) {
        self.blocks_processed += 1;
        let cutoff = self.blocks_processed;
        self.instant_lock_waitlist
            .retain(|_, first_seen| *first_seen + INSTANT_LOCK_HORIZON >= cutoff);

        let txids: Vec<Txid> = block.txdata.iter().map(Transaction::compute_txid).collect();
        let matched: Vec<bool> =
            txids.iter().map(|txid| self.transactions.contains_key(txid)).collect();

        if !matched.iter().any(|m| *m) {
            return;
        }

        let block_hash = block.block_hash();
        for (txid, is_match) in txids.iter().zip(&matched) {
            if *is_match {
                if let Some(entry) = self.transactions.get_mut(txid) {
                    entry.block_hash = Some(block_hash);
                }
            }
        }

        let merkle_block = MerkleBlock::from_header_txids(block.header, &txids, &matched);
        self.merkle_blocks.insert(block_hash, MerkleEntry { merkle_block, delivered: false });
        self.block_window.push_back(block_hash);

        if self.block_window.len() > CACHE_SIZE {
            if let Some(oldest) = self.block_window.pop_front() {
                debug!(block_hash = %oldest, "Evicting oldest cached block");
                self.evict_block_state(oldest);
            }
        }
    }

    /// Drops a block's proof and every transaction tied to it, typically
    /// because the historical replay already delivered that block.
    pub fn remove_by_block_hash(&mut self, block_hash: BlockHash) {
        self.block_window.retain(|hash| *hash != block_hash);
        self.evict_block_state(block_hash);
    }

    /// Marks transactions as delivered without emitting them, for matches
    /// that reached the client through the historical replay.
    pub fn mark_transactions_delivered(&mut self, txids: &[Txid]) {
        for txid in txids {
            if let Some(entry) = self.transactions.get_mut(txid) {
                entry.delivered = true;
            }
        }
    }

    /// Takes every not-yet-delivered transaction, in arrival order, marking
    /// each as delivered. Delivery marks are monotonic: once drained, an
    /// entry is never returned again.
    pub fn drain_undelivered_transactions(&mut self) -> Vec<Transaction> {
        let mut drained = Vec::new();
        for txid in &self.transaction_order {
            if let Some(entry) = self.transactions.get_mut(txid) {
                if !entry.delivered {
                    entry.delivered = true;
                    drained.push(entry.tx.clone());
                }
            }
        }
        drained
    }

    /// Takes every not-yet-delivered merkle block, oldest block first,
    /// marking each as delivered.
    pub fn drain_undelivered_merkle_blocks(&mut self) -> Vec<MerkleBlock> {
        let mut drained = Vec::new();
        for hash in &self.block_window {
            if let Some(entry) = self.merkle_blocks.get_mut(hash) {
                if !entry.delivered {
                    entry.delivered = true;
                    drained.push(entry.merkle_block.clone());
                }
            }
        }
        drained
    }

    /// True while `txid` was matched recently enough that an instant lock
    /// for it should still be forwarded.
    #[must_use]
    pub fn is_awaiting_instant_lock(&self, txid: &Txid) -> bool {
        self.instant_lock_waitlist.contains_key(txid)
    }

    /// Stops waiting for an instant lock on `txid`; each lock is forwarded
    /// at most once.
    pub fn mark_instant_lock_delivered(&mut self, txid: &Txid) {
        self.instant_lock_waitlist.remove(txid);
    }

    fn evict_block_state(&mut self, block_hash: BlockHash) {
        self.merkle_blocks.remove(&block_hash);
        self.transactions.retain(|_, entry| entry.block_hash != Some(block_hash));
        let retained = &self.transactions;
        self.transaction_order.retain(|txid| retained.contains_key(txid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_block, make_tx};

    #[test]
    fn add_transaction_is_idempotent() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);

        cache.add_transaction(&tx);
        cache.add_transaction(&tx);

        assert_eq!(cache.drain_undelivered_transactions().len(), 1);
    }

    #[test]
    fn drained_transactions_are_never_resurrected() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);

        cache.add_transaction(&tx);
        assert_eq!(cache.drain_undelivered_transactions().len(), 1);

        cache.add_transaction(&tx);
        assert!(cache.drain_undelivered_transactions().is_empty());
    }

    #[test]
    fn block_without_matched_transactions_produces_no_proof() {
        let mut cache = TransactionCache::new();
        cache.add_transaction(&make_tx(1));

        cache.add_block(&make_block(7, vec![make_tx(2), make_tx(3)]));

        assert!(cache.drain_undelivered_merkle_blocks().is_empty());
    }

    #[test]
    fn block_with_matched_transaction_produces_one_proof() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);
        cache.add_transaction(&tx);

        let block = make_block(7, vec![tx.clone(), make_tx(2)]);
        cache.add_block(&block);

        let proofs = cache.drain_undelivered_merkle_blocks();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].block_hash(), block.block_hash());

        let mut matches = Vec::new();
        let mut indexes = Vec::new();
        proofs[0].tree.extract_matches(&mut matches, &mut indexes).unwrap();
        assert_eq!(matches, vec![tx.compute_txid()]);

        // Drain is once-only for proofs as well.
        assert!(cache.drain_undelivered_merkle_blocks().is_empty());
    }

    #[test]
    fn proofs_follow_block_transaction_order() {
        let (a, b, c) = (make_tx(1), make_tx(2), make_tx(3));
        let (d, e) = (make_tx(4), make_tx(5));

        let mut cache = TransactionCache::new();
        cache.add_transaction(&a);
        cache.add_transaction(&b);
        cache.add_transaction(&d);

        cache.add_block(&make_block(10, vec![a.clone(), b.clone(), c]));
        cache.add_block(&make_block(11, vec![d.clone(), e]));

        let proofs = cache.drain_undelivered_merkle_blocks();
        assert_eq!(proofs.len(), 2);

        let mut matches = Vec::new();
        let mut indexes = Vec::new();
        proofs[0].tree.extract_matches(&mut matches, &mut indexes).unwrap();
        assert_eq!(matches, vec![a.compute_txid(), b.compute_txid()]);
        assert_eq!(indexes, vec![0, 1]);

        matches.clear();
        indexes.clear();
        proofs[1].tree.extract_matches(&mut matches, &mut indexes).unwrap();
        assert_eq!(matches, vec![d.compute_txid()]);
        assert_eq!(indexes, vec![0]);
    }

    #[test]
    fn window_holds_at_most_ten_blocks_and_evicts_their_transactions() {
        let mut cache = TransactionCache::new();

        let mut blocks = Vec::new();
        for i in 0..=CACHE_SIZE as u8 {
            let tx = make_tx(i + 1);
            cache.add_transaction(&tx);
            let block = make_block(i + 100, vec![tx]);
            cache.add_block(&block);
            blocks.push(block);
        }

        let proofs = cache.drain_undelivered_merkle_blocks();
        assert_eq!(proofs.len(), CACHE_SIZE);
        // The very first block fell out of the window.
        assert!(proofs.iter().all(|proof| proof.block_hash() != blocks[0].block_hash()));

        // Its transaction was evicted with it.
        let drained = cache.drain_undelivered_transactions();
        assert_eq!(drained.len(), CACHE_SIZE);
        let evicted_txid = make_tx(1).compute_txid();
        assert!(drained.iter().all(|tx| tx.compute_txid() != evicted_txid));
    }

    #[test]
    fn remove_by_block_hash_drops_proof_and_transactions() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);
        cache.add_transaction(&tx);

        let block = make_block(7, vec![tx]);
        cache.add_block(&block);

        cache.remove_by_block_hash(block.block_hash());

        assert!(cache.drain_undelivered_merkle_blocks().is_empty());
        assert!(cache.drain_undelivered_transactions().is_empty());
    }

    #[test]
    fn unconfirmed_transactions_survive_eviction() {
        let mut cache = TransactionCache::new();
        let mempool_only = make_tx(200);
        cache.add_transaction(&mempool_only);

        for i in 0..=CACHE_SIZE as u8 {
            let tx = make_tx(i + 1);
            cache.add_transaction(&tx);
            cache.add_block(&make_block(i + 100, vec![tx]));
        }

        let drained = cache.drain_undelivered_transactions();
        assert!(drained.iter().any(|tx| tx.compute_txid() == mempool_only.compute_txid()));
    }

    #[test]
    fn instant_lock_horizon_spans_ten_blocks_inclusive() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);
        let txid = tx.compute_txid();
        cache.add_transaction(&tx);

        for i in 0..INSTANT_LOCK_HORIZON as u8 {
            cache.add_block(&make_block(i + 100, vec![make_tx(i + 50)]));
            assert!(cache.is_awaiting_instant_lock(&txid), "block {i}");
        }

        // The eleventh block after first sighting expires the wait.
        cache.add_block(&make_block(250, vec![make_tx(99)]));
        assert!(!cache.is_awaiting_instant_lock(&txid));
    }

    #[test]
    fn instant_lock_is_forwarded_at_most_once() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);
        let txid = tx.compute_txid();
        cache.add_transaction(&tx);

        assert!(cache.is_awaiting_instant_lock(&txid));
        cache.mark_instant_lock_delivered(&txid);
        assert!(!cache.is_awaiting_instant_lock(&txid));
    }

    #[test]
    fn waitlist_registration_is_first_seen_only() {
        let mut cache = TransactionCache::new();
        let tx = make_tx(1);
        let txid = tx.compute_txid();

        cache.add_transaction(&tx);
        for i in 0..INSTANT_LOCK_HORIZON as u8 {
            cache.add_block(&make_block(i + 100, vec![make_tx(i + 50)]));
        }
        // Re-adding at a later block count must not reset the horizon.
        cache.add_transaction(&tx);
        cache.add_block(&make_block(250, vec![make_tx(99)]));

        assert!(!cache.is_awaiting_instant_lock(&txid));
    }
}
