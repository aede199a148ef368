use std::{sync::Arc, time::Duration};

use bitcoin::consensus::serialize;
use spv_gateway::{
    assert_closed, assert_next,
    cache::HeaderCache,
    registry::FilterSubscriptionRegistry,
    subscribe_to_block_headers_with_chain_locks,
    test_utils::{make_block, make_tx, MockChainNode},
    BlockHeadersItem, ChainEvent, ChainLock, GatewayError, HeaderStreamRequest, StartPoint,
};

fn chain_lock(height: u32, block: &bitcoin::Block) -> ChainLock {
    ChainLock { height, block_hash: block.block_hash(), signature: vec![0xCC; 96] }
}

fn header_cache() -> Arc<HeaderCache> {
    Arc::new(HeaderCache::new(1000, Duration::from_secs(60)))
}

fn three_blocks() -> Vec<bitcoin::Block> {
    vec![
        make_block(10, vec![make_tx(1)]),
        make_block(11, vec![make_tx(2)]),
        make_block(12, vec![make_tx(3)]),
    ]
}

#[tokio::test]
async fn chain_lock_precedes_the_first_header_batch() -> anyhow::Result<()> {
    let blocks = three_blocks();
    let node = Arc::new(MockChainNode::with_blocks(blocks.clone()));
    let lock = chain_lock(3, &blocks[2]);
    node.set_chain_lock(lock.clone());
    let registry = Arc::new(FilterSubscriptionRegistry::new());

    let (mut stream, _handle) = subscribe_to_block_headers_with_chain_locks(
        node,
        registry,
        header_cache(),
        HeaderStreamRequest { start: Some(StartPoint::Height(1)), count: 3 },
    )
    .await?;

    assert_next!(stream, BlockHeadersItem::ChainLock(lock.to_bytes()));
    assert_next!(
        stream,
        BlockHeadersItem::BlockHeaders(blocks.iter().map(|b| serialize(&b.header)).collect())
    );
    assert_closed!(stream);
    Ok(())
}

#[tokio::test]
async fn historical_only_stream_closes_after_the_replay() -> anyhow::Result<()> {
    let blocks = three_blocks();
    let node = Arc::new(MockChainNode::with_blocks(blocks.clone()));
    let registry = Arc::new(FilterSubscriptionRegistry::new());

    let (mut stream, _handle) = subscribe_to_block_headers_with_chain_locks(
        node,
        registry,
        header_cache(),
        HeaderStreamRequest { start: Some(StartPoint::Hash(blocks[1].block_hash())), count: 2 },
    )
    .await?;

    // No chain lock known: headers are first, from the requested hash.
    assert_next!(
        stream,
        BlockHeadersItem::BlockHeaders(
            blocks[1..].iter().map(|b| serialize(&b.header)).collect()
        )
    );
    assert_closed!(stream);
    Ok(())
}

#[tokio::test]
async fn live_headers_are_deduplicated_against_the_replay() -> anyhow::Result<()> {
    let blocks = three_blocks();
    let node = Arc::new(MockChainNode::with_blocks(blocks.clone()));
    let registry = Arc::new(FilterSubscriptionRegistry::new());

    let (mut stream, handle) = subscribe_to_block_headers_with_chain_locks(
        node,
        Arc::clone(&registry),
        header_cache(),
        HeaderStreamRequest { start: Some(StartPoint::Height(1)), count: 0 },
    )
    .await?;

    // Block 2 also arrives live while the replay is running.
    registry.broadcast(ChainEvent::Block(Arc::new(blocks[1].clone())));

    assert_next!(
        stream,
        BlockHeadersItem::BlockHeaders(blocks.iter().map(|b| serialize(&b.header)).collect())
    );

    // A genuinely new block comes through once.
    let new_block = make_block(99, vec![make_tx(9)]);
    registry.broadcast(ChainEvent::Block(Arc::new(new_block.clone())));
    assert_next!(
        stream,
        BlockHeadersItem::BlockHeaders(vec![serialize(&new_block.header)])
    );

    // A repeat of it is suppressed; the next item is the chain lock.
    registry.broadcast(ChainEvent::Block(Arc::new(new_block.clone())));
    let lock = chain_lock(4, &new_block);
    registry.broadcast(ChainEvent::ChainLock(lock.clone()));
    assert_next!(stream, BlockHeadersItem::ChainLock(lock.to_bytes()));

    drop(handle);
    assert_closed!(stream);
    Ok(())
}

#[tokio::test]
async fn validation_errors_surface_before_streaming() {
    let node = Arc::new(MockChainNode::with_blocks(three_blocks()));
    let registry = Arc::new(FilterSubscriptionRegistry::new());

    let result = subscribe_to_block_headers_with_chain_locks(
        Arc::clone(&node),
        Arc::clone(&registry),
        header_cache(),
        HeaderStreamRequest { start: None, count: 0 },
    )
    .await;
    assert!(matches!(result, Err(GatewayError::MissingStartPoint)));

    let result = subscribe_to_block_headers_with_chain_locks(
        node,
        registry,
        header_cache(),
        HeaderStreamRequest { start: Some(StartPoint::Height(2)), count: 3 },
    )
    .await;
    assert!(matches!(result, Err(GatewayError::CountExceedsChainTip { .. })));
}
