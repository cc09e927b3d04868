//! Streaming Source Adapter
//!
//! Runs one poll loop per active topic. Feeds are started and stopped by
//! the subscription registry through [`FeedController`], so a topic has a
//! feed exactly while it has subscribers.
//!
//! Each loop fetches the topic from the upstream provider on a fixed
//! interval and publishes `<topic>.update` only when the value differs
//! from the last one published. Fetch failures publish a `stream.error`
//! event and the loop carries on at its next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedController, UpstreamError, UpstreamProvider, UpstreamSample};
use crate::domain::event::{Event, Priority, STREAM_ERROR_TOPIC, update_topic};
use crate::domain::subscription::Topic;
use crate::infrastructure::bus::EventBus;
use crate::infrastructure::metrics;

const EVENT_SOURCE: &str = "streaming";

// =============================================================================
// Configuration
// =============================================================================

/// Streaming adapter configuration.
#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    /// Interval between fetches of one topic.
    pub poll_interval: Duration,
    /// Deadline for a single fetch.
    pub fetch_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&crate::StreamingSettings> for StreamingConfig {
    fn from(settings: &crate::StreamingSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            fetch_timeout: settings.fetch_timeout,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Streaming adapter statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingStats {
    /// Topics with a running feed.
    pub active_feeds: usize,
    /// Update events published.
    pub published: u64,
    /// Samples identical to the last published value.
    pub suppressed: u64,
    /// Failed fetches.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    suppressed: AtomicU64,
    errors: AtomicU64,
}

// =============================================================================
// Adapter
// =============================================================================

/// One running feed; a restarted topic gets a new one.
struct Feed {
    cancel: CancellationToken,
    last: Mutex<Option<Value>>,
}

impl Feed {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            last: Mutex::new(None),
        })
    }
}

struct Shared {
    provider: Arc<dyn UpstreamProvider>,
    bus: Arc<EventBus>,
    config: StreamingConfig,
    counters: Counters,
}

impl Shared {
    /// Publish a sample if it differs from the feed's last published value.
    fn observe(&self, topic: &str, feed: &Feed, sample: UpstreamSample) -> bool {
        {
            let mut last = feed.last.lock();
            if last.as_ref() == Some(&sample.value) {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            *last = Some(sample.value.clone());
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(Event::new(
            update_topic(topic),
            EVENT_SOURCE,
            json!({
                "topic": topic,
                "value": sample.value,
                "timestamp": sample.timestamp,
            }),
        ));
        true
    }

    fn report(&self, topic: &str, error: &UpstreamError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_feed_error(error.kind());
        tracing::warn!(topic = %topic, error = %error, "Upstream fetch failed");

        self.bus.publish(
            Event::new(
                STREAM_ERROR_TOPIC,
                EVENT_SOURCE,
                json!({
                    "topic": topic,
                    "kind": error.kind(),
                    "error": error.to_string(),
                }),
            )
            .with_priority(Priority::High),
        );
    }
}

/// Streaming source adapter.
pub struct StreamingAdapter {
    shared: Arc<Shared>,
    feeds: DashMap<Topic, Arc<Feed>>,
    runtime: Handle,
}

impl std::fmt::Debug for StreamingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAdapter")
            .field("config", &self.shared.config)
            .field("active_feeds", &self.feeds.len())
            .finish_non_exhaustive()
    }
}

impl StreamingAdapter {
    /// Create an adapter that spawns its feeds on `runtime`.
    #[must_use]
    pub fn new(
        provider: Arc<dyn UpstreamProvider>,
        bus: Arc<EventBus>,
        config: StreamingConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                bus,
                config,
                counters: Counters::default(),
            }),
            feeds: DashMap::new(),
            runtime,
        }
    }

    /// Accept a pushed sample for an active topic.
    ///
    /// Returns `true` if an update was published. Samples for topics
    /// without a feed are ignored.
    pub fn ingest(&self, topic: &str, sample: UpstreamSample) -> bool {
        let Some(feed) = self.feeds.get(topic).map(|f| Arc::clone(f.value())) else {
            tracing::debug!(topic = %topic, "Ignoring sample for inactive topic");
            return false;
        };
        self.shared.observe(topic, &feed, sample)
    }

    /// Whether a topic has a running feed.
    #[must_use]
    pub fn is_active(&self, topic: &str) -> bool {
        self.feeds.contains_key(topic)
    }

    /// Topics with a running feed.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.feeds.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StreamingStats {
        let counters = &self.shared.counters;
        StreamingStats {
            active_feeds: self.feeds.len(),
            published: counters.published.load(Ordering::Relaxed),
            suppressed: counters.suppressed.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Stop every feed.
    pub fn shutdown(&self) {
        for entry in &self.feeds {
            entry.value().cancel.cancel();
        }
        self.feeds.clear();
        metrics::set_active_feeds(0);
    }
}

impl FeedController for StreamingAdapter {
    fn start_feed(&self, topic: &str) {
        let Entry::Vacant(slot) = self.feeds.entry(topic.to_string()) else {
            return;
        };
        let feed = Feed::new();
        drop(slot.insert(Arc::clone(&feed)));
        metrics::set_active_feeds(self.feeds.len());
        tracing::info!(topic = %topic, "Starting upstream feed");

        self.runtime
            .spawn(poll_topic(Arc::clone(&self.shared), topic.to_string(), feed));
    }

    fn stop_feed(&self, topic: &str) {
        if let Some((_, feed)) = self.feeds.remove(topic) {
            feed.cancel.cancel();
            metrics::set_active_feeds(self.feeds.len());
            tracing::info!(topic = %topic, "Stopped upstream feed");
        }
    }
}

async fn poll_topic(shared: Arc<Shared>, topic: Topic, feed: Arc<Feed>) {
    let cancel = &feed.cancel;
    let mut interval = tokio::time::interval(shared.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let fetched = tokio::select! {
            () = cancel.cancelled() => break,
            result = tokio::time::timeout(
                shared.config.fetch_timeout,
                shared.provider.fetch(&topic),
            ) => result.unwrap_or(Err(UpstreamError::Timeout(shared.config.fetch_timeout))),
        };

        // A late result must not publish for a feed that was stopped mid-fetch.
        if cancel.is_cancelled() {
            break;
        }

        match fetched {
            Ok(sample) => {
                shared.observe(&topic, &feed, sample);
            }
            Err(error) => shared.report(&topic, &error),
        }
    }

    tracing::debug!(topic = %topic, "Feed loop exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::MockUpstreamProvider;
    use crate::infrastructure::bus::{BusConfig, handler_fn};

    /// Returns scripted values, repeating the last one.
    struct Scripted {
        values: Mutex<Vec<Result<Value, UpstreamError>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl UpstreamProvider for Scripted {
        async fn fetch(&self, _topic: &str) -> Result<UpstreamSample, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut values = self.values.lock();
            let next = if values.len() > 1 {
                values.remove(0)
            } else {
                values[0].clone()
            };
            next.map(|value| UpstreamSample {
                value,
                timestamp: 1,
            })
        }
    }

    fn adapter(provider: Arc<dyn UpstreamProvider>) -> (StreamingAdapter, mpsc::UnboundedReceiver<Event>) {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "test",
            ["*"],
            handler_fn(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
            None,
        );
        let config = StreamingConfig {
            poll_interval: Duration::from_millis(100),
            fetch_timeout: Duration::from_millis(50),
        };
        (StreamingAdapter::new(provider, bus, config, Handle::current()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_only_on_change() {
        let provider = Arc::new(Scripted {
            values: Mutex::new(vec![Ok(json!(1)), Ok(json!(1)), Ok(json!(2))]),
            calls: AtomicU32::new(0),
        });
        let (adapter, mut events) = adapter(provider.clone());

        adapter.start_feed("AAPL");
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();

        assert_eq!(first.topic, "AAPL.update");
        assert_eq!(first.payload["value"], json!(1));
        assert_eq!(second.payload["value"], json!(2));
        assert!(provider.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(adapter.stats().suppressed, 1);

        adapter.stop_feed("AAPL");
        assert!(!adapter.is_active("AAPL"));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_published_and_loop_continues() {
        let provider = Arc::new(Scripted {
            values: Mutex::new(vec![
                Err(UpstreamError::Malformed {
                    message: "bad".into(),
                }),
                Ok(json!(5)),
            ]),
            calls: AtomicU32::new(0),
        });
        let (adapter, mut events) = adapter(provider);

        adapter.start_feed("TSLA");
        let error = events.recv().await.unwrap();
        assert_eq!(error.topic, STREAM_ERROR_TOPIC);
        assert_eq!(error.priority, Priority::High);
        assert_eq!(error.payload["topic"], "TSLA");
        assert_eq!(error.payload["kind"], "malformed");

        let update = events.recv().await.unwrap();
        assert_eq!(update.topic, "TSLA.update");
        assert_eq!(adapter.stats().errors, 1);
        adapter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn mocked_provider_errors_are_classified() {
        let mut mock = MockUpstreamProvider::new();
        mock.expect_fetch().returning(|_| {
            Err(UpstreamError::Unavailable {
                message: "down".into(),
            })
        });
        let (adapter, mut events) = adapter(Arc::new(mock));

        adapter.start_feed("MSFT");
        let error = events.recv().await.unwrap();
        assert_eq!(error.payload["kind"], "unavailable");
        adapter.shutdown();
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_of_unknown_is_noop() {
        let provider = Arc::new(Scripted {
            values: Mutex::new(vec![Ok(json!(1))]),
            calls: AtomicU32::new(0),
        });
        let (adapter, _events) = adapter(provider);

        adapter.start_feed("AAPL");
        adapter.start_feed("AAPL");
        adapter.stop_feed("MSFT");

        assert_eq!(adapter.active_feeds(), vec!["AAPL".to_string()]);
        assert_eq!(adapter.stats().active_feeds, 1);
        adapter.shutdown();
        assert!(adapter.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn ingest_requires_active_feed() {
        let provider = Arc::new(Scripted {
            values: Mutex::new(vec![Ok(json!(1))]),
            calls: AtomicU32::new(0),
        });
        let (adapter, _events) = adapter(provider);
        let sample = || UpstreamSample {
            value: json!({"score": 0.7}),
            timestamp: 2,
        };

        assert!(!adapter.ingest("sentiment", sample()));
        adapter.start_feed("sentiment");
        assert!(adapter.ingest("sentiment", sample()));
        assert!(!adapter.ingest("sentiment", sample()));
        adapter.shutdown();
    }

    #[tokio::test]
    async fn restarted_feed_publishes_its_first_sample() {
        struct Silent;

        #[async_trait]
        impl UpstreamProvider for Silent {
            async fn fetch(&self, _topic: &str) -> Result<UpstreamSample, UpstreamError> {
                std::future::pending().await
            }
        }

        let (adapter, _events) = adapter(Arc::new(Silent));
        let sample = || UpstreamSample {
            value: json!({"price": 10}),
            timestamp: 3,
        };

        adapter.start_feed("AAPL");
        let stopped = Arc::clone(adapter.feeds.get("AAPL").unwrap().value());
        adapter.stop_feed("AAPL");

        // A fetch that completes after the stop still lands on the old feed.
        adapter.shared.observe("AAPL", &stopped, sample());

        adapter.start_feed("AAPL");
        assert!(adapter.ingest("AAPL", sample()));
        adapter.shutdown();
    }
}
