//! Event Bus
//!
//! In-process publish/subscribe dispatcher that decouples producers from
//! consumers.
//!
//! # Architecture
//!
//! `publish` appends to an unbounded FIFO channel and returns immediately.
//! A single drain loop pops events in publication order and, for each,
//! runs every matching handler on its own task. The loop waits for all
//! handlers of one event before taking the next, so handlers observe
//! events on a topic in publish order. A handler error or panic is logged
//! and never stops the other handlers or the loop.
//!
//! The bus keeps the most recent events in a bounded history for
//! late-joining diagnostics.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::event::{Event, WILDCARD_TOPIC, is_error_topic};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Event bus configuration.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Number of recent events retained for diagnostics.
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1_000,
        }
    }
}

impl From<&crate::BusSettings> for BusConfig {
    fn from(settings: &crate::BusSettings) -> Self {
        Self {
            history_capacity: settings.history_capacity,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Error returned by an event handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from any displayable value.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Receives events from the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

/// Optional predicate applied after topic matching.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusSubscription(u64);

struct Registration {
    token: BusSubscription,
    subscriber_id: String,
    topics: HashSet<String>,
    handler: Arc<dyn EventHandler>,
    filter: Option<EventFilter>,
}

impl Registration {
    fn matches(&self, event: &Event) -> bool {
        let topic_match =
            self.topics.contains(WILDCARD_TOPIC) || self.topics.contains(event.topic.as_str());
        topic_match && self.filter.as_ref().is_none_or(|f| f(event))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Bus delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Events published on an error topic.
    pub error_events: u64,
    /// Registered handlers.
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    error_events: AtomicU64,
}

// =============================================================================
// Event Bus
// =============================================================================

struct BusShared {
    registrations: RwLock<Vec<Arc<Registration>>>,
    counters: BusCounters,
}

impl BusShared {
    fn matching(&self, event: &Event) -> Vec<Arc<Registration>> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.matches(event))
            .cloned()
            .collect()
    }
}

/// The event bus.
///
/// # Example
///
/// ```rust
/// use market_sync::infrastructure::bus::{BusConfig, EventBus, handler_fn};
/// use market_sync::domain::event::Event;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
/// let _token = bus.subscribe(
///     "logger",
///     ["AAPL.update"],
///     handler_fn(|event| async move {
///         println!("{}", event.topic);
///         Ok(())
///     }),
///     None,
/// );
/// bus.publish(Event::new("AAPL.update", "example", serde_json::json!({"price": 1})));
/// # }
/// ```
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    shared: Arc<BusShared>,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    next_token: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("history_capacity", &self.history_capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus and its drain loop.
    ///
    /// The drain loop must be run (see [`BusDrain::run`]) for handlers to
    /// receive events.
    #[must_use]
    pub fn new(config: BusConfig) -> (Self, BusDrain) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BusShared {
            registrations: RwLock::new(Vec::new()),
            counters: BusCounters::default(),
        });

        let bus = Self {
            tx,
            shared: Arc::clone(&shared),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1_024))),
            history_capacity: config.history_capacity,
            next_token: AtomicU64::new(1),
        };

        (bus, BusDrain { rx, shared })
    }

    /// Create a bus and spawn its drain loop until `cancel` fires.
    #[must_use]
    pub fn spawn(config: BusConfig, cancel: CancellationToken) -> Arc<Self> {
        let (bus, drain) = Self::new(config);
        tokio::spawn(drain.run(cancel));
        Arc::new(bus)
    }

    /// Publish an event. Never blocks on handler execution.
    pub fn publish(&self, event: Event) {
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
        if is_error_topic(&event.topic) {
            self.shared
                .counters
                .error_events
                .fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_event_published(&event.topic);

        self.remember(&event);

        if self.tx.send(event).is_err() {
            tracing::debug!("Event bus drain loop stopped, event kept in history only");
        }
    }

    /// Register a handler for a set of topics.
    ///
    /// The topic set may contain `*` to receive every event.
    pub fn subscribe<I, T>(
        &self,
        subscriber_id: impl Into<String>,
        topics: I,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
    ) -> BusSubscription
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let token = BusSubscription(self.next_token.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            token,
            subscriber_id: subscriber_id.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            handler,
            filter,
        };

        tracing::debug!(
            subscriber_id = %registration.subscriber_id,
            topics = registration.topics.len(),
            "Bus handler registered"
        );

        self.shared.registrations.write().push(Arc::new(registration));
        token
    }

    /// Remove a handler. Returns `false` if the token is unknown.
    pub fn unsubscribe(&self, token: BusSubscription) -> bool {
        let mut registrations = self.shared.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.token != token);
        registrations.len() != before
    }

    /// Snapshot of recent events, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Event> {
        self.history.lock().iter().cloned().collect()
    }

    /// Delivery statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let counters = &self.shared.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            error_events: counters.error_events.load(Ordering::Relaxed),
            subscribers: self.shared.registrations.read().len(),
        }
    }

    fn remember(&self, event: &Event) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }
}

// =============================================================================
// Drain Loop
// =============================================================================

/// The bus drain loop.
pub struct BusDrain {
    rx: mpsc::UnboundedReceiver<Event>,
    shared: Arc<BusShared>,
}

impl BusDrain {
    /// Run until cancelled or every bus handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Event bus drain loop cancelled");
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.dispatch(event).await;
        }
    }

    async fn dispatch(&self, event: Event) {
        let registrations = self.shared.matching(&event);
        if registrations.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let tasks: Vec<(String, JoinHandle<Result<(), HandlerError>>)> = registrations
            .into_iter()
            .map(|registration| {
                let event = Arc::clone(&event);
                let subscriber_id = registration.subscriber_id.clone();
                let handle =
                    tokio::spawn(async move { registration.handler.handle(&event).await });
                (subscriber_id, handle)
            })
            .collect();

        for (subscriber_id, task) in tasks {
            let failure = match task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) if e.is_panic() => Some("handler panicked".to_string()),
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Some(error) => {
                    self.shared
                        .counters
                        .handler_failures
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::record_handler_failure();
                    tracing::warn!(
                        subscriber_id = %subscriber_id,
                        topic = %event.topic,
                        event_id = %event.id,
                        error = %error,
                        "Event handler failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn collector() -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = handler_fn(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event);
                Ok(())
            }
        });
        (handler, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn delivers_matching_topics_only() {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let (handler, seen) = collector();
        bus.subscribe("a", ["AAPL.update"], handler, None);

        bus.publish(Event::new("AAPL.update", "test", json!(1)));
        bus.publish(Event::new("MSFT.update", "test", json!(2)));
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "AAPL.update");
    }

    #[tokio::test]
    async fn wildcard_receives_everything() {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let (handler, seen) = collector();
        bus.subscribe("diag", [WILDCARD_TOPIC], handler, None);

        bus.publish(Event::new("AAPL.update", "test", json!(1)));
        bus.publish(Event::new("sync.error", "test", json!(2)));
        settle().await;

        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn filter_is_applied() {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let (handler, seen) = collector();
        let filter: EventFilter = Arc::new(|event| event.payload["price"].as_i64() > Some(10));
        bus.subscribe("a", ["AAPL.update"], handler, Some(filter));

        bus.publish(Event::new("AAPL.update", "test", json!({"price": 5})));
        bus.publish(Event::new("AAPL.update", "test", json!({"price": 15})));
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload["price"], 15);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        bus.subscribe(
            "broken",
            ["t"],
            handler_fn(|_| async { Err(HandlerError::new("boom")) }),
            None,
        );
        bus.subscribe("panics", ["t"], handler_fn(|_| async { panic!("handler bug") }), None);
        let (handler, seen) = collector();
        bus.subscribe("ok", ["t"], handler, None);

        bus.publish(Event::new("t", "test", json!(1)));
        bus.publish(Event::new("t", "test", json!(2)));
        settle().await;

        assert_eq!(seen.lock().len(), 2);
        let stats = bus.stats();
        assert_eq!(stats.handler_failures, 4);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let (handler, seen) = collector();
        let token = bus.subscribe("a", ["t"], handler, None);

        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));

        bus.publish(Event::new("t", "test", json!(1)));
        settle().await;
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn history_evicts_oldest() {
        let (bus, _drain) = EventBus::new(BusConfig {
            history_capacity: 3,
        });
        for i in 0..5 {
            bus.publish(Event::new("t", "test", json!(i)));
        }

        let history = bus.history();
        let values: Vec<_> = history.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(values, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn publish_counts_error_events() {
        let (bus, _drain) = EventBus::new(BusConfig::default());
        bus.publish(Event::new("stream.error", "test", json!(null)));
        bus.publish(Event::new("AAPL.update", "test", json!(null)));

        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.error_events, 1);
    }
}
