//! The block-headers-with-chain-locks subscription.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cache::HeaderCache,
    core_rpc::CoreRpc,
    mediator::{HeaderReconciler, ReplayEvent, StreamMediator},
    registry::FilterSubscriptionRegistry,
    replay::HistoricalHeaderReplay,
    streams::{resolve_range, ReplayRange, StartPoint, StreamHandle, STREAM_BUFFER_CAPACITY},
    types::{BlockHeadersItem, StreamResult, TryStream},
    GatewayError,
};

/// A client request for raw block headers and chain locks.
#[derive(Debug, Clone, Copy)]
pub struct HeaderStreamRequest {
    pub start: Option<StartPoint>,
    /// `0` keeps the subscription open for live headers after the replay.
    pub count: u32,
}

/// Opens a header subscription.
///
/// The node's current chain lock, when one exists, is the first item on the
/// stream; header batches follow in chain order. Open-ended subscriptions
/// then keep delivering live headers and newly arriving chain locks.
///
/// # Errors
///
/// Fails without side effects on a missing or unresolvable start point or a
/// `count` reaching past the chain tip.
pub async fn subscribe_to_block_headers_with_chain_locks<C: CoreRpc>(
    core: Arc<C>,
    registry: Arc<FilterSubscriptionRegistry>,
    header_cache: Arc<HeaderCache>,
    request: HeaderStreamRequest,
) -> Result<(ReceiverStream<StreamResult<BlockHeadersItem>>, StreamHandle), GatewayError> {
    // Fetched before the range is resolved: once the chain tip has been
    // sampled, registration must follow without further node round trips,
    // or a block mined in between is neither replayed nor seen live.
    let best_chain_lock = core.get_best_chain_lock().await?;
    let range = resolve_range(&*core, request.start, request.count).await?;

    info!(
        from_height = range.from_height,
        count = range.count,
        live = range.live,
        "Opening block-headers stream"
    );

    let (out_tx, out_rx) = mpsc::channel(STREAM_BUFFER_CAPACITY);
    let cancellation = CancellationToken::new();

    // Greet the subscriber with the current finality point before any
    // headers.
    if let Some(lock) = &best_chain_lock {
        if !out_tx.try_stream(Ok(BlockHeadersItem::ChainLock(lock.to_bytes()))).await {
            return Err(GatewayError::ServiceShutdown);
        }
    }

    if range.live {
        let (guard, live_rx) = registry.attach();
        let (replay_tx, replay_rx) = mpsc::channel(STREAM_BUFFER_CAPACITY);

        let mediator = StreamMediator::new(
            HeaderReconciler::with_delivered_chain_lock(best_chain_lock),
            live_rx,
            replay_rx,
            out_tx.clone(),
            cancellation.clone(),
        );
        tokio::spawn(async move {
            let _guard = guard;
            mediator.run().await;
        });
        tokio::spawn(run_replay(
            core,
            header_cache,
            range,
            out_tx,
            Some(replay_tx),
            cancellation.clone(),
        ));
    } else {
        tokio::spawn(run_replay(core, header_cache, range, out_tx, None, cancellation.clone()));
    }

    Ok((ReceiverStream::new(out_rx), StreamHandle::new(cancellation)))
}

async fn run_replay<C: CoreRpc>(
    core: Arc<C>,
    header_cache: Arc<HeaderCache>,
    range: ReplayRange,
    out: mpsc::Sender<StreamResult<BlockHeadersItem>>,
    replay_events: Option<mpsc::Sender<ReplayEvent>>,
    cancellation: CancellationToken,
) {
    let mut replay =
        HistoricalHeaderReplay::new(core, header_cache, range.from_height, range.count);

    loop {
        let batch = tokio::select! {
            biased;
            () = cancellation.cancelled() => return,
            batch = replay.next() => batch,
        };
        match batch {
            Ok(Some(batch)) => {
                if !out.try_stream(Ok(BlockHeadersItem::BlockHeaders(batch.headers))).await {
                    cancellation.cancel();
                    return;
                }
                if let Some(events) = &replay_events {
                    if events.send(ReplayEvent::BatchSent(batch.block_hashes)).await.is_err() {
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
        let _ = events.send(ReplayEvent::Completed).await;
    }
}
