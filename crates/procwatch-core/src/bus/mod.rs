//! Topic-addressed broadcast event bus.
//!
//! Publishers dispatch [`Event`]s to zero or more topics; every event is also
//! delivered to the default topic, so a subscriber without topics sees all
//! traffic. Delivery to each subscriber runs on its own task so a slow or
//! crashed subscriber never blocks the dispatcher or its peers. Shutdown is
//! cooperative: the bus closes every subscriber stream, then waits for each
//! subscriber to acknowledge completion through its handle.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Buffered events per subscriber stream before deliveries await capacity.
const SUBSCRIBER_BUFFER: usize = 64;

const DEFAULT_TOPIC: &str = "__default__";
const ERROR_TOPIC: &str = "__error__";

/// Event bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The shutdown deadline elapsed before all subscribers acknowledged.
    #[error("shutdown deadline elapsed before all subscribers exited")]
    ShutdownTimeout,

    /// An event payload could not be encoded.
    #[error("failed to encode event payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// An event payload could not be decoded as the requested type.
    #[error("failed to decode event payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A named delivery group on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Create a topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The default topic, which receives every dispatched event.
    #[must_use]
    pub fn default_topic() -> Self {
        Self(DEFAULT_TOPIC.to_string())
    }

    /// The error topic, carrying contained runtime failures.
    #[must_use]
    pub fn error_topic() -> Self {
        Self(ERROR_TOPIC.to_string())
    }

    /// Topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An event on the bus: a string tag plus a self-describing encoded payload.
///
/// Subscribers decode the payload by declaring the target type; a mismatched
/// decode fails locally without affecting the bus.
#[derive(Debug, Clone)]
pub struct Event {
    kind: String,
    payload: Vec<u8>,
    at: DateTime<Utc>,
}

impl Event {
    /// Create an event with an encoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Encode`] when the payload cannot be serialized.
    pub fn new<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self, BusError> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_vec(payload).map_err(BusError::Encode)?,
            at: Utc::now(),
        })
    }

    /// Create an event with no payload (timer ticks and similar signals).
    #[must_use]
    pub fn empty(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Vec::new(),
            at: Utc::now(),
        }
    }

    /// The event's type tag.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// When the event was created.
    #[must_use]
    pub const fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Decode the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Decode`] when the payload is empty or does not
    /// deserialize as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_slice(&self.payload).map_err(BusError::Decode)
    }
}

/// Completion handle held by a subscriber.
///
/// When the subscriber's event stream closes it should finish in-flight work
/// and then call [`SubscriptionHandle::finished`]; dropping the handle
/// acknowledges completion as well.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    done: Option<oneshot::Sender<()>>,
}

impl SubscriptionHandle {
    /// Acknowledge that this subscriber has finished all work.
    pub fn finished(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<Topic, Vec<Subscriber>>,
    done: Vec<(u64, oneshot::Receiver<()>)>,
    next_id: u64,
    shutting_down: bool,
}

/// Topic-addressed broadcast publish/subscribe.
#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    /// Create a new bus with only the default topic.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    ///
    /// With no topics the subscriber joins the default topic and therefore
    /// sees every event; with topics it sees those topics and nothing else.
    /// Returns the event stream and the completion handle for shutdown
    /// acknowledgment.
    pub fn subscribe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> (mpsc::Receiver<Event>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();

        let mut registry = self.registry.write().expect("lock poisoned");
        let id = registry.next_id;
        registry.next_id += 1;

        let mut topics: Vec<Topic> = topics.into_iter().collect();
        if topics.is_empty() {
            topics.push(Topic::default_topic());
        }
        for topic in topics {
            registry
                .subscribers
                .entry(topic)
                .or_default()
                .push(Subscriber { id, tx: tx.clone() });
        }
        registry.done.push((id, done_rx));

        (
            rx,
            SubscriptionHandle {
                id,
                done: Some(done_tx),
            },
        )
    }

    /// Remove a subscriber, closing its event stream.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut registry = self.registry.write().expect("lock poisoned");
        for subscribers in registry.subscribers.values_mut() {
            subscribers.retain(|s| s.id != handle.id);
        }
        registry.done.retain(|(id, _)| *id != handle.id);
    }

    /// Dispatch an event to the given topics plus the default topic.
    ///
    /// Delivery is asynchronous; this method never blocks on slow
    /// subscribers. Events dispatched while the bus is shutting down are
    /// silently dropped.
    pub fn dispatch(&self, event: Event, topics: impl IntoIterator<Item = Topic>) {
        let registry = self.registry.read().expect("lock poisoned");
        if registry.shutting_down {
            return;
        }

        let mut targets: Vec<Topic> = topics.into_iter().collect();
        targets.push(Topic::default_topic());

        for topic in targets {
            let Some(subscribers) = registry.subscribers.get(&topic) else {
                // No subscribers on a specialized topic is routine; drop.
                continue;
            };
            let senders: Vec<mpsc::Sender<Event>> =
                subscribers.iter().map(|s| s.tx.clone()).collect();
            let event = event.clone();
            tokio::spawn(async move {
                for tx in senders {
                    // A closed receiver means the subscriber is gone.
                    let _ = tx.send(event.clone()).await;
                }
            });
        }
    }

    /// Dispatch a contained runtime failure on the error topic.
    pub fn dispatch_error(&self, error: &impl std::fmt::Display) {
        if let Ok(event) = Event::new("error", &error.to_string()) {
            self.dispatch(event, [Topic::error_topic()]);
        }
    }

    /// Signal every subscriber to stop and wait for their acknowledgments.
    ///
    /// Closes every subscriber stream, then waits up to `deadline` for every
    /// subscriber to complete through its [`SubscriptionHandle`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutdownTimeout`] when the deadline elapses first.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), BusError> {
        let done = {
            let mut registry = self.registry.write().expect("lock poisoned");
            registry.shutting_down = true;
            // Dropping the senders closes every subscriber stream.
            registry.subscribers.clear();
            std::mem::take(&mut registry.done)
        };

        let wait_all = async {
            for (_, rx) in done {
                // Completion is either an explicit finished() or a dropped
                // handle; both resolve the receiver.
                let _ = rx.await;
            }
        };
        tokio::time::timeout(deadline, wait_all)
            .await
            .map_err(|_| BusError::ShutdownTimeout)
    }
}
