//! Reconciler for transactions-with-proofs subscriptions.

use std::collections::HashSet;

use bitcoin::{consensus::serialize, BlockHash, Txid};
use tracing::trace;

use crate::{
    bloom::BloomFilter,
    cache::TransactionCache,
    filter_matcher::matches_transaction,
    mediator::Reconciler,
    types::{ChainEvent, TransactionsWithProofsItem},
};

/// Owns the subscription's bloom filter and reconciliation cache.
///
/// The registry forwards every chain event to every subscription; relevance
/// is decided here, against this subscription's filter alone. The filter is
/// mutable because BIP37 matching grows it (see
/// [`matches_transaction`]).
pub struct TransactionReconciler {
    filter: BloomFilter,
    cache: TransactionCache,
    pending_instant_locks: Vec<Vec<u8>>,
    /// Blocks the replay already delivered; arriving live copies are
    /// suppressed whichever side the mediator happens to process first.
    replayed_blocks: HashSet<BlockHash>,
}

impl TransactionReconciler {
    #[must_use]
    pub fn new(filter: BloomFilter) -> Self {
        TransactionReconciler {
            filter,
            cache: TransactionCache::new(),
            pending_instant_locks: Vec::new(),
            replayed_blocks: HashSet::new(),
        }
    }
}

impl Reconciler for TransactionReconciler {
    type Item = TransactionsWithProofsItem;

    fn observe(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::Transaction(tx) => {
                if matches_transaction(&mut self.filter, &tx) {
                    trace!(txid = %tx.compute_txid(), "Matched mempool transaction");
                    self.cache.add_transaction(&tx);
                }
            }
            ChainEvent::Block(block) => {
                if self.replayed_blocks.contains(&block.block_hash()) {
                    // The replay already proved this block; just make sure
                    // its transactions are never re-sent as mempool items.
                    let txids: Vec<Txid> =
                        block.txdata.iter().map(|tx| tx.compute_txid()).collect();
                    self.cache.mark_transactions_delivered(&txids);
                    return;
                }
                for tx in &block.txdata {
                    if matches_transaction(&mut self.filter, tx) {
                        self.cache.add_transaction(tx);
                    }
                }
                self.cache.add_block(&block);
            }
            ChainEvent::InstantLock(lock) => {
                if self.cache.is_awaiting_instant_lock(&lock.txid) {
                    self.cache.mark_instant_lock_delivered(&lock.txid);
                    self.pending_instant_locks.push(lock.raw);
                }
            }
            // Chain locks belong to the header stream.
            ChainEvent::ChainLock(_) => {}
        }
    }

    fn purge_delivered(&mut self, block_hashes: &[BlockHash]) {
        for hash in block_hashes {
            self.replayed_blocks.insert(*hash);
            self.cache.remove_by_block_hash(*hash);
        }
    }

    fn drain(&mut self) -> Vec<TransactionsWithProofsItem> {
        let mut items = Vec::new();

        let transactions = self.cache.drain_undelivered_transactions();
        if !transactions.is_empty() {
            items.push(TransactionsWithProofsItem::RawTransactions(
                transactions.iter().map(serialize).collect(),
            ));
        }

        // Proofs follow the raw transactions they prove.
        for merkle_block in self.cache.drain_undelivered_merkle_blocks() {
            items.push(TransactionsWithProofsItem::RawMerkleBlock(merkle_block.to_bytes()));
        }

        if !self.pending_instant_locks.is_empty() {
            items.push(TransactionsWithProofsItem::InstantLockMessages(std::mem::take(
                &mut self.pending_instant_locks,
            )));
        }

        items
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        bloom::BloomFlags,
        test_utils::{make_block, make_tx, make_tx_paying},
        types::InstantLockMessage,
    };

    const WATCHED: [u8; 20] = [0x42; 20];

    fn watching_filter() -> BloomFilter {
        let mut filter = BloomFilter::new(vec![0u8; 256], 11, 0, BloomFlags::All).unwrap();
        filter.insert(&WATCHED);
        filter
    }

    #[test]
    fn irrelevant_events_leave_nothing_pending() {
        let mut reconciler = TransactionReconciler::new(watching_filter());

        reconciler.observe(ChainEvent::Transaction(make_tx(1)));
        reconciler.observe(ChainEvent::Block(Arc::new(make_block(2, vec![make_tx(3)]))));

        assert!(reconciler.drain().is_empty());
    }

    #[test]
    fn matched_block_yields_transactions_then_proof() {
        let mut reconciler = TransactionReconciler::new(watching_filter());
        let tx = make_tx_paying(1, WATCHED);

        reconciler
            .observe(ChainEvent::Block(Arc::new(make_block(2, vec![make_tx(3), tx.clone()]))));

        let items = reconciler.drain();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            TransactionsWithProofsItem::RawTransactions(vec![serialize(&tx)])
        );
        assert!(matches!(items[1], TransactionsWithProofsItem::RawMerkleBlock(_)));

        assert!(reconciler.drain().is_empty());
    }

    #[test]
    fn instant_lock_forwarded_only_for_matched_txids() {
        let mut reconciler = TransactionReconciler::new(watching_filter());
        let matched = make_tx_paying(1, WATCHED);
        reconciler.observe(ChainEvent::Transaction(matched.clone()));
        reconciler.drain();

        reconciler.observe(ChainEvent::InstantLock(InstantLockMessage {
            txid: make_tx(9).compute_txid(),
            raw: vec![1],
        }));
        reconciler.observe(ChainEvent::InstantLock(InstantLockMessage {
            txid: matched.compute_txid(),
            raw: vec![2],
        }));
        // A second lock for the same txid is not forwarded again.
        reconciler.observe(ChainEvent::InstantLock(InstantLockMessage {
            txid: matched.compute_txid(),
            raw: vec![3],
        }));

        assert_eq!(
            reconciler.drain(),
            vec![TransactionsWithProofsItem::InstantLockMessages(vec![vec![2]])]
        );
    }

    #[test]
    fn block_purged_before_being_observed_is_suppressed() {
        let mut reconciler = TransactionReconciler::new(watching_filter());
        let tx = make_tx_paying(1, WATCHED);
        let block = make_block(2, vec![tx]);

        // Replay reported the block as sent before the live copy was seen.
        reconciler.purge_delivered(&[block.block_hash()]);
        reconciler.observe(ChainEvent::Block(Arc::new(block)));

        assert!(reconciler.drain().is_empty());
    }

    #[test]
    fn spend_of_matched_output_matches_after_filter_growth() {
        let mut reconciler = TransactionReconciler::new(watching_filter());
        let funding = make_tx_paying(1, WATCHED);

        let spend = bitcoin::Transaction {
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint { txid: funding.compute_txid(), vout: 0 },
                ..funding.input[0].clone()
            }],
            ..make_tx(7)
        };

        reconciler.observe(ChainEvent::Transaction(funding));
        reconciler.observe(ChainEvent::Transaction(spend.clone()));

        let items = reconciler.drain();
        let TransactionsWithProofsItem::RawTransactions(raw) = &items[0] else {
            panic!("expected raw transactions");
        };
        assert!(raw.contains(&serialize(&spend)));
    }
}
