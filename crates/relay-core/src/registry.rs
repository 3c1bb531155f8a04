//! Broadcast registry for Relay.
//!
//! The registry owns one bounded queue per subscriber and fans every
//! published envelope out to all of them. Fan-out never waits on a
//! subscriber: a full queue loses the new envelope and the drop is counted.

use crate::envelope::{Envelope, Payload};
use crate::id::IdGenerator;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// A subscriber identifier, drawn from the same generator as message ids.
pub type SubscriberId = String;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Envelopes buffered per subscriber before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// State shared by the registry and every unsubscribe handle.
struct Shared {
    /// Live subscriber queues.
    subscribers: DashMap<SubscriberId, mpsc::Sender<Arc<Envelope>>>,
    /// Announced subscriber count.
    subscriber_count: AtomicUsize,
    ids: IdGenerator,
    published: AtomicU64,
    published_by_kind: [AtomicU64; Payload::KINDS.len()],
    delivered: AtomicU64,
    dropped: AtomicU64,
    config: RegistryConfig,
}

impl Shared {
    fn publish(&self, envelope: Envelope) -> usize {
        let envelope = Arc::new(envelope);
        let mut delivered = 0;

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&envelope)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = %entry.key(),
                        message = %envelope.id(),
                        "Subscriber queue full, dropping envelope"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(subscriber = %entry.key(), "Subscriber queue already closed");
                }
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        self.published_by_kind[envelope.payload().kind_index()].fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        trace!(
            message = %envelope.id(),
            kind = envelope.kind(),
            recipients = delivered,
            "Published envelope"
        );
        delivered
    }

    fn announce(&self, text: String) {
        let envelope = Envelope::new(&self.ids, Payload::system(text));
        self.publish(envelope);
    }

    fn remove(&self, id: &str) -> bool {
        if self.subscribers.remove(id).is_none() {
            return false;
        }

        let count = self.subscriber_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(subscriber = %id, subscribers = count, "Unsubscribed");
        self.announce(format!("total subscribers -1 = {count}"));
        true
    }
}

/// The process-wide set of subscribers.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct BroadcastRegistry {
    shared: Arc<Shared>,
}

impl BroadcastRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating broadcast registry with config: {:?}", config);
        Self {
            shared: Arc::new(Shared {
                subscribers: DashMap::new(),
                subscriber_count: AtomicUsize::new(0),
                ids: IdGenerator::new(),
                published: AtomicU64::new(0),
                published_by_kind: Default::default(),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// The generator used for message and subscriber ids.
    #[must_use]
    pub fn ids(&self) -> &IdGenerator {
        &self.shared.ids
    }

    /// Stamp a payload with a fresh id and the current time.
    #[must_use]
    pub fn envelope(&self, payload: Payload) -> Envelope {
        Envelope::new(&self.shared.ids, payload)
    }

    /// Register a new subscriber.
    ///
    /// The subscriber is inserted before its join notice is published, so
    /// the notice is the first thing in its queue unless another publish
    /// races in between.
    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.ids.next_id();
        let (sender, receiver) = mpsc::channel(self.shared.config.queue_capacity.max(1));

        self.shared.subscribers.insert(id.clone(), sender);
        let count = self.shared.subscriber_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(subscriber = %id, subscribers = count, "Subscribed");
        self.shared.announce(format!("total subscribers +1 = {count}"));

        let handle = UnsubscribeHandle {
            inner: Arc::new(HandleInner {
                shared: Arc::clone(&self.shared),
                id: id.clone(),
                closed: AtomicBool::new(false),
            }),
        };

        Subscription {
            id,
            receiver,
            handle,
        }
    }

    /// Deliver an envelope to every registered subscriber.
    ///
    /// Returns the number of queues that accepted it.
    pub fn publish(&self, envelope: Envelope) -> usize {
        self.shared.publish(envelope)
    }

    /// Stamp and publish a payload, returning the assigned message id.
    pub fn publish_payload(&self, payload: Payload) -> String {
        let envelope = self.envelope(payload);
        let id = envelope.id().to_string();
        self.publish(envelope);
        id
    }

    /// Current announced subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count.load(Ordering::Acquire)
    }

    /// Check if a subscriber is registered.
    #[must_use]
    pub fn is_subscribed(&self, id: &str) -> bool {
        self.shared.subscribers.contains_key(id)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            subscriber_count: self.subscriber_count(),
            published: self.shared.published.load(Ordering::Relaxed),
            published_by_kind: std::array::from_fn(|i| {
                self.shared.published_by_kind[i].load(Ordering::Relaxed)
            }),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

impl RegistryStats {
    /// Published counts paired with their payload kind.
    pub fn published_kinds(&self) -> impl Iterator<Item = (&'static str, u64)> {
        Payload::KINDS.into_iter().zip(self.published_by_kind)
    }
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered subscribers.
    pub subscriber_count: usize,
    /// Publish calls since creation.
    pub published: u64,
    /// Publish calls per payload kind, indexed like [`Payload::KINDS`].
    pub published_by_kind: [u64; Payload::KINDS.len()],
    /// Envelopes accepted by subscriber queues.
    pub delivered: u64,
    /// Envelopes dropped because a queue was full.
    pub dropped: u64,
}

struct HandleInner {
    shared: Arc<Shared>,
    id: SubscriberId,
    closed: AtomicBool,
}

impl HandleInner {
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.remove(&self.id)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes a subscriber from the registry.
///
/// Closing is idempotent. When the last clone is dropped the subscriber is
/// closed automatically.
#[derive(Clone)]
pub struct UnsubscribeHandle {
    inner: Arc<HandleInner>,
}

impl UnsubscribeHandle {
    /// Unsubscribe. Returns `true` only for the call that did the work.
    pub fn close(&self) -> bool {
        self.inner.close()
    }

    /// Check if this handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The subscriber this handle belongs to.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.inner.id
    }
}

/// A registered subscriber: its id, the read side of its queue and its
/// unsubscribe handle.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<Envelope>>,
    handle: UnsubscribeHandle,
}

impl Subscription {
    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next queued envelope.
    ///
    /// Returns `None` once the subscription is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.recv().await
    }

    /// Take the next queued envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is empty or closed and drained.
    pub fn try_recv(&mut self) -> Result<Arc<Envelope>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Unsubscribe. Safe to call any number of times.
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    /// Check if this subscription has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// A clone of the unsubscribe handle.
    #[must_use]
    pub fn handle(&self) -> UnsubscribeHandle {
        self.handle.clone()
    }

    /// Split into id, queue receiver and unsubscribe handle.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        SubscriberId,
        mpsc::Receiver<Arc<Envelope>>,
        UnsubscribeHandle,
    ) {
        (self.id, self.receiver, self.handle)
    }
}
