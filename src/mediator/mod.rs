//! Merging the historical replay with the live event feed.
//!
//! Every open-ended subscription runs one [`StreamMediator`] task. While the
//! replay is in flight the mediator only buffers live events into its
//! [`Reconciler`] and purges whatever the replay reports as already sent;
//! once the replay completes it switches to draining the reconciler into the
//! client channel on a fixed interval. Each item therefore reaches the
//! client exactly once, whichever side saw it first.

pub mod headers;
pub mod transactions;

use std::{fmt::Debug, time::Duration};

use bitcoin::BlockHash;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{ChainEvent, StreamResult, TryStream};

pub use headers::HeaderReconciler;
pub use transactions::TransactionReconciler;

/// Interval at which buffered live items are flushed to the client once the
/// historical replay has completed.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Progress reports from the historical replay task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    /// These blocks were just delivered historically; anything the live side
    /// buffered for them must be dropped.
    BatchSent(Vec<BlockHash>),
    /// Mempool transactions fetched at the end of the replay; they go
    /// through the same matching path as live ones.
    MempoolTransactions(Vec<bitcoin::Transaction>),
    /// The replay reached the chain tip; switch to live delivery.
    Completed,
}

/// Subscription-kind-specific state carried by a [`StreamMediator`].
///
/// The mediator owns the reconciler exclusively, so implementations need no
/// internal locking even when they hold a mutable bloom filter.
pub trait Reconciler: Send + 'static {
    type Item: Debug + Send + 'static;

    /// Folds a live event into the pending state.
    fn observe(&mut self, event: ChainEvent);

    /// Drops pending state for blocks the replay already delivered.
    fn purge_delivered(&mut self, block_hashes: &[BlockHash]);

    /// Takes everything pending, in delivery order. Never returns the same
    /// item twice.
    fn drain(&mut self) -> Vec<Self::Item>;
}

pub struct StreamMediator<R: Reconciler> {
    reconciler: R,
    live_events: mpsc::Receiver<ChainEvent>,
    replay_events: mpsc::Receiver<ReplayEvent>,
    output: mpsc::Sender<StreamResult<R::Item>>,
    drain_interval: Duration,
    cancellation: CancellationToken,
}

impl<R: Reconciler> StreamMediator<R> {
    pub fn new(
        reconciler: R,
        live_events: mpsc::Receiver<ChainEvent>,
        replay_events: mpsc::Receiver<ReplayEvent>,
        output: mpsc::Sender<StreamResult<R::Item>>,
        cancellation: CancellationToken,
    ) -> Self {
        StreamMediator {
            reconciler,
            live_events,
            replay_events,
            output,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            cancellation,
        }
    }

    #[must_use]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Runs until cancellation, the live feed closing, or the client going
    /// away. Closing the output channel (by returning) is what ends the
    /// client-facing stream.
    pub async fn run(mut self) {
        if !self.buffer_until_replay_completes().await {
            return;
        }
        debug!("Historical replay complete, switching to live delivery");
        self.drain_live().await;
    }

    /// Phase one. Returns `false` when the mediator should stop instead of
    /// going live.
    async fn buffer_until_replay_completes(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => return false,
                replay = self.replay_events.recv() => match replay {
                    Some(ReplayEvent::BatchSent(hashes)) => {
                        self.reconciler.purge_delivered(&hashes);
                    }
                    Some(ReplayEvent::MempoolTransactions(transactions)) => {
                        for tx in transactions {
                            self.reconciler.observe(ChainEvent::Transaction(tx));
                        }
                    }
                    Some(ReplayEvent::Completed) => return true,
                    // Replay task ended without completing; it already put
                    // an error on the output, so just close.
                    None => return false,
                },
                live = self.live_events.recv() => match live {
                    Some(event) => self.reconciler.observe(event),
                    None => return false,
                },
            }
        }
    }

    /// Phase two.
    async fn drain_live(&mut self) {
        let mut ticker = tokio::time::interval(self.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => return,
                live = self.live_events.recv() => match live {
                    Some(event) => self.reconciler.observe(event),
                    None => return,
                },
                _ = ticker.tick() => {
                    for item in self.reconciler.drain() {
                        if !self.output.try_stream(Ok(item)).await {
                            self.cancellation.cancel();
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        bloom::{BloomFilter, BloomFlags},
        test_utils::{make_block, make_tx},
        types::TransactionsWithProofsItem,
    };

    fn match_all_filter() -> BloomFilter {
        // Every bit set: matches anything.
        BloomFilter::new(vec![0xFF; 32], 1, 0, BloomFlags::All).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_block_purged_by_replay_is_never_delivered() {
        let (live_tx, live_rx) = mpsc::channel(16);
        let (replay_tx, replay_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancellation = CancellationToken::new();

        let mediator = StreamMediator::new(
            TransactionReconciler::new(match_all_filter()),
            live_rx,
            replay_rx,
            out_tx,
            cancellation.clone(),
        );
        let task = tokio::spawn(mediator.run());

        // A block arrives live while the replay is still walking history.
        let block = make_block(1, vec![make_tx(1)]);
        let hash = block.block_hash();
        live_tx.send(ChainEvent::Block(Arc::new(block))).await.unwrap();

        // The replay then reports that very block as already sent.
        replay_tx.send(ReplayEvent::BatchSent(vec![hash])).await.unwrap();
        replay_tx.send(ReplayEvent::Completed).await.unwrap();

        // A later live transaction still flows.
        live_tx.send(ChainEvent::Transaction(make_tx(2))).await.unwrap();

        let item = out_rx.recv().await.unwrap().unwrap();
        let TransactionsWithProofsItem::RawTransactions(raw) = item else {
            panic!("expected raw transactions, got {item:?}");
        };
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0], bitcoin::consensus::serialize(&make_tx(2)));

        cancellation.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_delivered_before_replay_completes() {
        let (live_tx, live_rx) = mpsc::channel(16);
        let (_replay_tx, replay_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancellation = CancellationToken::new();

        let mediator = StreamMediator::new(
            TransactionReconciler::new(match_all_filter()),
            live_rx,
            replay_rx,
            out_tx,
            cancellation.clone(),
        );
        let task = tokio::spawn(mediator.run());

        live_tx.send(ChainEvent::Transaction(make_tx(1))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(out_rx.try_recv().is_err(), "item leaked during buffering phase");

        cancellation.cancel();
        task.await.unwrap();
    }
}
