//! Subscription entry points.
//!
//! Each `subscribe_*` operation validates its request up front, then wires
//! together a historical replay task and (for open-ended requests) a
//! [`StreamMediator`](crate::mediator::StreamMediator) fed from the live
//! registry. The caller gets a [`ReceiverStream`] of items and a
//! [`StreamHandle`]; dropping the handle tears the whole subscription down.

pub mod headers;
pub mod transactions;

use std::time::Duration;

use bitcoin::BlockHash;
use tokio_util::sync::CancellationToken;

use crate::{
    core_rpc::{BlockRef, CoreRpc},
    GatewayError,
};

pub use headers::{subscribe_to_block_headers_with_chain_locks, HeaderStreamRequest};
pub use transactions::{subscribe_to_transactions_with_proofs, TransactionStreamRequest};

/// Buffered items per client stream before producers await.
pub const STREAM_BUFFER_CAPACITY: usize = 128;

/// Delay between historical batches, keeping a long replay from starving
/// the runtime or flooding a slow client.
pub const REPLAY_BATCH_DELAY: Duration = Duration::from_millis(50);

/// Where a subscription starts reading the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    Hash(BlockHash),
    Height(u32),
}

/// Cancels the subscription when dropped.
///
/// Cancellation stops the replay task and the mediator; the mediator's exit
/// drops its registry guard, so no live fan-out slot outlives the client.
#[derive(Debug)]
pub struct StreamHandle {
    cancellation: CancellationToken,
}

impl StreamHandle {
    fn new(cancellation: CancellationToken) -> Self {
        StreamHandle { cancellation }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// The validated shape of a replay range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplayRange {
    from_height: u32,
    /// Blocks to replay; for open-ended requests this reaches the tip at
    /// validation time.
    count: u32,
    /// Whether the subscription stays registered for live events.
    live: bool,
}

/// Resolves and bounds-checks the requested range. Runs before any state is
/// registered, so a validation failure leaves nothing to clean up.
async fn resolve_range<C: CoreRpc>(
    core: &C,
    start: Option<StartPoint>,
    count: u32,
) -> Result<ReplayRange, GatewayError> {
    let from_height = match start {
        None | Some(StartPoint::Height(0)) => return Err(GatewayError::MissingStartPoint),
        Some(StartPoint::Height(height)) => {
            // Confirm the height exists before promising a stream.
            core.get_block_hash(height).await?;
            height
        }
        Some(StartPoint::Hash(hash)) => core.get_block(BlockRef::Hash(hash)).await?.height,
    };

    let best = core.get_best_block_height().await?;
    if count > 0 && u64::from(from_height) + u64::from(count) > u64::from(best) + 1 {
        return Err(GatewayError::CountExceedsChainTip { from: from_height, count, best });
    }

    let replay_count =
        if count == 0 { best.saturating_sub(from_height) + 1 } else { count };
    Ok(ReplayRange { from_height, count: replay_count, live: count == 0 })
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;
    use crate::test_utils::{make_chain, MockChainNode};

    #[tokio::test]
    async fn missing_start_point_is_rejected() {
        let node = MockChainNode::with_blocks(make_chain(5));

        assert_eq!(
            resolve_range(&node, None, 0).await,
            Err(GatewayError::MissingStartPoint)
        );
        assert_eq!(
            resolve_range(&node, Some(StartPoint::Height(0)), 0).await,
            Err(GatewayError::MissingStartPoint)
        );
    }

    #[tokio::test]
    async fn unknown_start_block_is_not_found() {
        let node = MockChainNode::with_blocks(make_chain(5));

        let missing = BlockHash::from_byte_array([0xAB; 32]);
        assert!(matches!(
            resolve_range(&node, Some(StartPoint::Hash(missing)), 0).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            resolve_range(&node, Some(StartPoint::Height(9)), 0).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn count_past_the_tip_is_rejected() {
        let node = MockChainNode::with_blocks(make_chain(5));

        assert_eq!(
            resolve_range(&node, Some(StartPoint::Height(3)), 4).await,
            Err(GatewayError::CountExceedsChainTip { from: 3, count: 4, best: 5 })
        );
        // Exactly up to the tip is fine.
        assert_eq!(
            resolve_range(&node, Some(StartPoint::Height(3)), 3).await,
            Ok(ReplayRange { from_height: 3, count: 3, live: false })
        );
    }

    #[tokio::test]
    async fn open_ended_request_replays_to_the_tip() {
        let node = MockChainNode::with_blocks(make_chain(5));
        let hash = make_chain(5)[1].block_hash();

        assert_eq!(
            resolve_range(&node, Some(StartPoint::Hash(hash)), 0).await,
            Ok(ReplayRange { from_height: 2, count: 4, live: true })
        );
    }
}
