//! Fan-out of live chain events to active subscriptions.
//!
//! The registry is the only shared structure between the event pump and the
//! per-subscription mediator tasks. Events are cheap to clone (`Block` rides
//! behind an `Arc`), so broadcast is a plain clone-per-subscriber loop over a
//! snapshot of the current senders.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{types::ChainEvent, GatewayError};

/// Buffered live events per subscription before the broadcast loop awaits.
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct FilterSubscriptionRegistry {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<ChainEvent>>>,
    next_id: AtomicU64,
}

impl FilterSubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscription and returns its live-event receiver.
    ///
    /// The subscription stays registered for exactly as long as the returned
    /// guard lives; dropping it detaches, so an aborted subscription task can
    /// never leak its registry slot.
    #[must_use]
    pub fn attach(self: &Arc<Self>) -> (SubscriptionGuard, mpsc::Receiver<ChainEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, sender);
        debug!(subscription_id = id, "Subscription attached");
        (SubscriptionGuard { registry: Arc::clone(self), id }, receiver)
    }

    /// Delivers `event` to every currently attached subscription.
    ///
    /// Never waits on any one subscriber: a subscription whose channel is
    /// full has stopped draining live events and is detached on the spot,
    /// like one whose receiver is gone. Detaching closes the subscription's
    /// live channel, which ends its stream.
    pub fn broadcast(&self, event: ChainEvent) {
        let subscribers: Vec<(u64, mpsc::Sender<ChainEvent>)> =
            self.lock().iter().map(|(id, sender)| (*id, sender.clone())).collect();

        for (id, sender) in subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscription_id = id,
                        "Dropping subscription that stopped draining live events"
                    );
                    self.lock().remove(&id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription_id = id, "Dropping subscription with closed channel");
                    self.lock().remove(&id);
                }
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn detach(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(subscription_id = id, "Subscription detached");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<ChainEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Detaches its subscription from the registry on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    registry: Arc<FilterSubscriptionRegistry>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry.detach(self.id);
    }
}

/// The external live feed (in production a ZMQ socket on the chain node).
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Waits for the next event; `None` means the feed dropped.
    async fn next_event(&mut self) -> Option<ChainEvent>;

    /// Tries to re-establish a dropped feed.
    async fn reconnect(&mut self) -> bool;
}

/// Forwards the live feed into the registry until shutdown.
///
/// A dropped feed is retried up to `retry_budget` times with a fixed delay;
/// exhausting the budget is fatal for the whole gateway, since without live
/// events every open-ended stream would silently stall.
pub async fn run_event_pump<S: EventSource>(
    mut source: S,
    registry: Arc<FilterSubscriptionRegistry>,
    retry_budget: u32,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    info!("Live event pump started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("Live event pump shutting down");
                return Ok(());
            }
            event = source.next_event() => match event {
                Some(event) => registry.broadcast(event),
                None => {
                    warn!("Live event feed dropped, reconnecting");
                    reconnect_with_budget(&mut source, retry_budget, &shutdown).await?;
                }
            }
        }
    }
}

async fn reconnect_with_budget<S: EventSource>(
    source: &mut S,
    retry_budget: u32,
    shutdown: &CancellationToken,
) -> Result<(), GatewayError> {
    for attempt in 1..=retry_budget {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
        if source.reconnect().await {
            info!(attempt, "Live event feed re-established");
            return Ok(());
        }
        warn!(attempt, retry_budget, "Reconnect attempt failed");
    }
    Err(GatewayError::EventSourceUnavailable { attempts: retry_budget })
}
