//! In-process event bus with a hard subscriber cap.
//!
//! Each subscriber owns a bounded mpsc receiver; `publish` fans out to
//! every live subscriber and awaits all deliveries before returning, so
//! events for one UPS reach each subscriber in publish order.
//!
//! Dead-client detection is lazy: nobody probes a subscriber, but a send
//! into a channel whose receiver is gone fails immediately and the
//! subscription is pruned on the spot.
//!
//! The subscriber map is serialized under one async mutex; `unsubscribe`
//! and `publish` take the same lock, so once `unsubscribe` returns no
//! further event can reach that subscription.

pub mod rate;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::join_all;
use futures_util::Stream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;
use vlt_schemas::BusEvent;

pub use rate::{GlobalMetricsLimiter, MetricsRateLimiter};

/// Hard cap on concurrent subscriptions (one per SSE connection).
pub const MAX_SUBSCRIBERS: usize = 100;

/// Queue depth per subscriber before publish exerts backpressure.
const SUBSCRIBER_QUEUE: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberLimitExceeded;

impl fmt::Display for SubscriberLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber limit ({MAX_SUBSCRIBERS}) exceeded")
    }
}

impl std::error::Error for SubscriberLimitExceeded {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<BusEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    ///
    /// Closed subscriptions are pruned first, so capacity freed by dead
    /// clients is reusable even before a publish notices them.
    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, SubscriberLimitExceeded> {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|_, tx| !tx.is_closed());
        if subs.len() >= MAX_SUBSCRIBERS {
            return Err(SubscriberLimitExceeded);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        subs.insert(id, tx);
        debug!(subscription = %id, total = subs.len(), "bus subscribe");

        Ok(Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        })
    }

    /// Remove a subscription; idempotent. Returns only after the
    /// subscription can receive no further events.
    pub async fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscribers.lock().await;
        if subs.remove(&id).is_some() {
            debug!(subscription = %id, total = subs.len(), "bus unsubscribe");
        }
    }

    /// Deliver `event` to every live subscriber, awaiting all deliveries.
    /// Subscribers whose receiver is gone are dropped from the map.
    pub async fn publish(&self, event: &BusEvent) {
        let mut subs = self.subscribers.lock().await;

        let sends = subs.iter().map(|(id, tx)| {
            let id = *id;
            let tx = tx.clone();
            let event = event.clone();
            async move { (id, tx.send(event).await.is_ok()) }
        });

        for (id, delivered) in join_all(sends).await {
            if !delivered {
                subs.remove(&id);
                debug!(subscription = %id, "bus pruned dead subscriber");
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|_, tx| !tx.is_closed());
        subs.len()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live bus subscription. Dropping it unsubscribes (promptly via a
/// spawned task when a runtime is available; otherwise the closed channel
/// is pruned on the next publish).
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<BusEvent>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = BusEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        let bus = Arc::clone(&self.bus);
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { bus.unsubscribe(id).await });
        }
    }
}
