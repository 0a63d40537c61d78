//! Generic one-to-many event fan-out with per-subscriber filtering.
//!
//! Every subscriber owns a bounded delivery queue. A publish evaluates each
//! subscriber's predicate and hands the event to every accepting queue from
//! its own task, so one slow consumer does not hold up the others. The
//! publish itself completes only once all those tasks are done, which means
//! a subscriber that never drains its queue stalls the publish indefinitely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Queue capacity used by [`Broadcaster::new`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Decides whether a subscriber wants an event.
pub type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Receiving end of a subscriber's delivery queue.
///
/// Cloning yields another handle to the same queue; each event is received
/// by exactly one of the clones.
pub struct Subscription<E> {
    id: String,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<E>>>,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<E> Subscription<E> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event. `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<E> {
        self.queue.lock().await.recv().await
    }

    /// Whether both handles refer to the same queue.
    pub fn same_queue(&self, other: &Subscription<E>) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

struct Subscriber<E> {
    sender: mpsc::Sender<E>,
    predicate: Option<Predicate<E>>,
    subscription: Subscription<E>,
}

type Registry<E> = HashMap<String, Subscriber<E>>;

/// Fan-out hub. Cheap to clone; clones share subscribers.
pub struct Broadcaster<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    capacity: usize,
    subscribers: Mutex<Option<Registry<E>>>,
}

impl<E> Clone for Broadcaster<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Broadcaster<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Broadcaster<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// A broadcaster whose delivery queues hold up to `capacity` pending events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(None),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Option<Registry<E>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` with an acceptance predicate.
    ///
    /// Subscribing an id that is already registered returns its existing
    /// queue; the predicate is left as it was.
    pub fn subscribe(&self, id: &str, predicate: Option<Predicate<E>>) -> Subscription<E> {
        let mut guard = self.registry();
        let registry = guard.get_or_insert_with(HashMap::new);
        if let Some(existing) = registry.get(id) {
            debug!(subscriber = %id, "Already subscribed, returning existing queue");
            return existing.subscription.clone();
        }

        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let subscription = Subscription {
            id: id.to_string(),
            queue: Arc::new(tokio::sync::Mutex::new(receiver)),
        };
        registry.insert(
            id.to_string(),
            Subscriber {
                sender,
                predicate,
                subscription: subscription.clone(),
            },
        );
        debug!(subscriber = %id, "Subscribed");
        subscription
    }

    /// Close and remove the queue of `id`. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        if let Some(registry) = self.registry().as_mut() {
            if registry.remove(id).is_some() {
                debug!(subscriber = %id, "Unsubscribed");
            }
        }
    }

    /// Close every queue.
    pub fn close(&self) {
        if let Some(registry) = self.registry().take() {
            debug!(subscribers = registry.len(), "Broadcaster closed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().as_ref().map_or(0, HashMap::len)
    }

    /// Deliver `event` to every accepting subscriber and wait until each
    /// delivery has been handed to its queue.
    pub async fn publish(&self, event: E) {
        let targets: Vec<(String, mpsc::Sender<E>)> = {
            let guard = self.registry();
            let Some(registry) = guard.as_ref() else {
                return;
            };
            registry
                .iter()
                .filter(|(id, subscriber)| match &subscriber.predicate {
                    Some(accepts) => accepts(&event),
                    None => {
                        warn!(subscriber = %id, "Subscriber has no predicate, delivering everything");
                        true
                    }
                })
                .map(|(id, subscriber)| (id.clone(), subscriber.sender.clone()))
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let mut workers = JoinSet::new();
        for (id, sender) in targets {
            let event = event.clone();
            workers.spawn(async move {
                if sender.send(event).await.is_err() {
                    debug!(subscriber = %id, "Subscriber queue closed, event dropped");
                }
            });
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Delivery worker failed");
            }
        }
    }

    /// Same as [`Broadcaster::publish`] without blocking the caller.
    pub fn publish_async(&self, event: E) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move { broadcaster.publish(event).await })
    }
}
