//! The transactions-with-proofs subscription.

use std::sync::Arc;

use bitcoin::{consensus::deserialize, Transaction};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bloom::{BloomFilter, BloomFlags},
    core_rpc::CoreRpc,
    mediator::{ReplayEvent, StreamMediator, TransactionReconciler},
    registry::FilterSubscriptionRegistry,
    replay::HistoricalTransactionReplay,
    streams::{resolve_range, ReplayRange, StartPoint, StreamHandle, STREAM_BUFFER_CAPACITY},
    types::{StreamResult, TransactionsWithProofsItem, TryStream},
    GatewayError,
};

/// A client request for filter-matched transactions and their proofs.
#[derive(Debug, Clone)]
pub struct TransactionStreamRequest {
    pub filter_data: Vec<u8>,
    pub n_hash_funcs: u32,
    pub n_tweak: u32,
    /// BIP37 nFlags byte.
    pub flags: u8,
    pub start: Option<StartPoint>,
    /// `0` keeps the subscription open for live events after the replay.
    pub count: u32,
}

/// Opens a transaction subscription.
///
/// Historical blocks from the start point are replayed first; with
/// `count == 0` the subscription is registered for live events *before* the
/// replay begins, so nothing falls in the gap between the two. Items for any
/// one block always arrive as the raw transactions followed by the merkle
/// block proving them.
///
/// # Errors
///
/// Fails without side effects on a malformed filter, a missing or
/// unresolvable start point, or a `count` reaching past the chain tip.
pub async fn subscribe_to_transactions_with_proofs<C: CoreRpc>(
    core: Arc<C>,
    registry: Arc<FilterSubscriptionRegistry>,
    request: TransactionStreamRequest,
) -> Result<
    (ReceiverStream<StreamResult<TransactionsWithProofsItem>>, StreamHandle),
    GatewayError,
> {
    let flags = BloomFlags::from_consensus(request.flags)?;
    let filter =
        BloomFilter::new(request.filter_data, request.n_hash_funcs, request.n_tweak, flags)?;
    let range = resolve_range(&*core, request.start, request.count).await?;

    info!(
        from_height = range.from_height,
        count = range.count,
        live = range.live,
        "Opening transactions-with-proofs stream"
    );

    let (out_tx, out_rx) = mpsc::channel(STREAM_BUFFER_CAPACITY);
    let cancellation = CancellationToken::new();
    let filter_bytes = filter.to_bytes();

    if range.live {
        let (guard, live_rx) = registry.attach();
        let (replay_tx, replay_rx) = mpsc::channel(STREAM_BUFFER_CAPACITY);

        let mediator = StreamMediator::new(
            TransactionReconciler::new(filter),
            live_rx,
            replay_rx,
            out_tx.clone(),
            cancellation.clone(),
        );
        tokio::spawn(async move {
            // The guard lives exactly as long as the mediator task.
            let _guard = guard;
            mediator.run().await;
        });
        tokio::spawn(run_replay(core, filter_bytes, range, out_tx, Some(replay_tx), cancellation.clone()));
    } else {
        tokio::spawn(run_replay(core, filter_bytes, range, out_tx, None, cancellation.clone()));
    }

    Ok((ReceiverStream::new(out_rx), StreamHandle::new(cancellation)))
}

async fn run_replay<C: CoreRpc>(
    core: Arc<C>,
    filter_bytes: Vec<u8>,
    range: ReplayRange,
    out: mpsc::Sender<StreamResult<TransactionsWithProofsItem>>,
    replay_events: Option<mpsc::Sender<ReplayEvent>>,
    cancellation: CancellationToken,
) {
    let mut replay = HistoricalTransactionReplay::new(
        Arc::clone(&core),
        filter_bytes,
        range.from_height,
        range.count,
    );

    loop {
        let batch = tokio::select! {
            biased;
            () = cancellation.cancelled() => return,
            batch = replay.next() => batch,
        };
        match batch {
            Ok(Some(batch)) => {
                if !batch.transactions.is_empty()
                    && !out
                        .try_stream(Ok(TransactionsWithProofsItem::RawTransactions(
                            batch.transactions,
                        )))
                        .await
                {
                    cancellation.cancel();
                    return;
                }
                if !out
                    .try_stream(Ok(TransactionsWithProofsItem::RawMerkleBlock(
                        batch.merkle_block,
                    )))
                    .await
                {
                    cancellation.cancel();
                    return;
                }
                if let Some(events) = &replay_events {
                    if events.send(ReplayEvent::BatchSent(vec![batch.block_hash])).await.is_err()
                    {
                        return;
                    }
                }
                tokio::select! {
                    biased;
                    () = cancellation.cancelled() => return,
                    () = tokio::time::sleep(super::REPLAY_BATCH_DELAY) => {}
                }
            }
            Ok(None) => break,
            Err(error) => {
                let _ = out.try_stream(Err(error)).await;
                cancellation.cancel();
                return;
            }
        }
    }

    if let Some(events) = replay_events {
        match fetch_mempool(&*core).await {
            Ok(transactions) => {
                if !transactions.is_empty() {
                    let _ = events.send(ReplayEvent::MempoolTransactions(transactions)).await;
                }
            }
            Err(error) => {
                let _ = out.try_stream(Err(error)).await;
                cancellation.cancel();
                return;
            }
        }
        let _ = events.send(ReplayEvent::Completed).await;
    }
    // Historical-only: returning drops `out`, which closes the stream.
}

/// Current mempool contents, decoded. A txid that vanishes or fails to
/// decode mid-fetch is skipped; mempool churn is not an error.
async fn fetch_mempool<C: CoreRpc>(core: &C) -> Result<Vec<Transaction>, GatewayError> {
    let txids = core.get_mempool_transaction_ids().await?;
    let mut transactions = Vec::with_capacity(txids.len());
    for txid in txids {
        let raw = match core.get_raw_transaction(txid).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(%txid, %error, "Skipping mempool transaction that failed to fetch");
                continue;
            }
        };
        match deserialize::<Transaction>(&raw) {
            Ok(tx) => transactions.push(tx),
            Err(_) => warn!(%txid, "Skipping undecodable mempool transaction"),
        }
    }
    Ok(transactions)
}
