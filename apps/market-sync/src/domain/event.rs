//! Event Model
//!
//! The unit of data flowing through the event bus. Events are immutable
//! once published; the `id` identifies one event instance and is used for
//! de-duplication and audit.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Reserved Topics
// =============================================================================

/// Connection state changes of a transport connection.
pub const CONNECTION_STATE_TOPIC: &str = "connection.state";

/// A queued mutation was written to the server.
pub const SYNC_SUCCESS_TOPIC: &str = "sync.success";

/// A queued mutation failed to sync.
pub const SYNC_ERROR_TOPIC: &str = "sync.error";

/// A queued mutation hit a conflict, resolved or awaiting a manual decision.
pub const SYNC_CONFLICT_TOPIC: &str = "sync.conflict";

/// An upstream feed failed for one topic.
pub const STREAM_ERROR_TOPIC: &str = "stream.error";

/// A monitored metric crossed its threshold.
pub const MONITOR_ALERT_TOPIC: &str = "monitor.alert";

/// Suffix appended to a logical topic for its update notifications.
pub const UPDATE_SUFFIX: &str = ".update";

/// Topic pattern matching every topic on the bus.
pub const WILDCARD_TOPIC: &str = "*";

/// Build the update topic name for a logical topic (`AAPL` → `AAPL.update`).
#[must_use]
pub fn update_topic(topic: &str) -> String {
    format!("{topic}{UPDATE_SUFFIX}")
}

/// Whether a topic is published only by components of this process.
#[must_use]
pub fn is_reserved_topic(topic: &str) -> bool {
    matches!(
        topic,
        CONNECTION_STATE_TOPIC
            | SYNC_SUCCESS_TOPIC
            | SYNC_ERROR_TOPIC
            | SYNC_CONFLICT_TOPIC
            | STREAM_ERROR_TOPIC
            | MONITOR_ALERT_TOPIC
    )
}

/// Whether a topic carries error reports.
#[must_use]
pub fn is_error_topic(topic: &str) -> bool {
    topic == STREAM_ERROR_TOPIC || topic == SYNC_ERROR_TOPIC
}

// =============================================================================
// Clock
// =============================================================================

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Milliseconds since the Unix epoch, never lower than an earlier call.
///
/// A wall clock stepped backwards repeats the last value until it catches
/// up.
#[must_use]
pub fn monotonic_millis() -> i64 {
    advance(&LAST_TIMESTAMP, Utc::now().timestamp_millis())
}

fn advance(last: &AtomicI64, now: i64) -> i64 {
    last.fetch_max(now, Ordering::Relaxed).max(now)
}

// =============================================================================
// Priority
// =============================================================================

/// Advisory priority carried on every event.
///
/// The bus does not schedule by priority; downstream consumers may.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background information.
    Low,
    /// Regular updates.
    #[default]
    Medium,
    /// Errors and state changes.
    High,
    /// Requires immediate attention.
    Critical,
}

// =============================================================================
// Event
// =============================================================================

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique per event instance.
    pub id: String,
    /// Topic the event is published on.
    pub topic: String,
    /// Milliseconds since the Unix epoch at creation, from
    /// [`monotonic_millis`].
    pub timestamp: i64,
    /// Component or peer that produced the event.
    pub source: String,
    /// Arbitrary structured payload.
    pub payload: Value,
    /// Advisory priority.
    pub priority: Priority,
    /// Number of times delivery of this event was retried upstream.
    pub retry_count: u32,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(topic: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            timestamp: monotonic_millis(),
            source: source.into(),
            payload,
            priority: Priority::default(),
            retry_count: 0,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry count.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// The logical topic this event concerns.
    ///
    /// Update notifications are published on `<topic>.update`; routing to
    /// peers uses the topic without the suffix.
    #[must_use]
    pub fn logical_topic(&self) -> &str {
        self.topic
            .strip_suffix(UPDATE_SUFFIX)
            .unwrap_or(&self.topic)
    }

    /// Whether this is an update notification for a logical topic.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.topic.ends_with(UPDATE_SUFFIX) && self.topic.len() > UPDATE_SUFFIX.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_event_has_unique_id() {
        let a = Event::new("AAPL.update", "test", json!({}));
        let b = Event::new("AAPL.update", "test", json!({}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.priority, Priority::Medium);
        assert_eq!(a.retry_count, 0);
    }

    #[test]
    fn logical_topic_strips_update_suffix() {
        let event = Event::new(update_topic("AAPL"), "test", json!(null));
        assert_eq!(event.topic, "AAPL.update");
        assert_eq!(event.logical_topic(), "AAPL");
        assert!(event.is_update());

        let event = Event::new(CONNECTION_STATE_TOPIC, "test", json!(null));
        assert_eq!(event.logical_topic(), CONNECTION_STATE_TOPIC);
        assert!(!event.is_update());
    }

    #[test]
    fn bare_suffix_is_not_an_update() {
        let event = Event::new(".update", "test", json!(null));
        assert!(!event.is_update());
    }

    #[test]
    fn priority_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Priority::Critical).unwrap(),
            "\"critical\""
        );
        assert!(Priority::Critical > Priority::Low);
    }

    #[test]
    fn error_topics() {
        assert!(is_error_topic(STREAM_ERROR_TOPIC));
        assert!(is_error_topic(SYNC_ERROR_TOPIC));
        assert!(!is_error_topic(SYNC_SUCCESS_TOPIC));
    }

    #[test]
    fn reserved_topics() {
        assert!(is_reserved_topic(CONNECTION_STATE_TOPIC));
        assert!(is_reserved_topic(SYNC_SUCCESS_TOPIC));
        assert!(is_reserved_topic(MONITOR_ALERT_TOPIC));
        assert!(!is_reserved_topic("AAPL.update"));
        assert!(!is_reserved_topic("sync.successful"));
    }

    #[test]
    fn clock_holds_when_wall_clock_steps_back() {
        let last = AtomicI64::new(0);
        assert_eq!(advance(&last, 1_000), 1_000);
        assert_eq!(advance(&last, 400), 1_000);
        assert_eq!(advance(&last, 1_000), 1_000);
        assert_eq!(advance(&last, 1_250), 1_250);
    }

    #[test]
    fn event_timestamps_never_decrease() {
        let mut previous = 0;
        for _ in 0..1_000 {
            let event = Event::new("AAPL.update", "test", json!(null));
            assert!(event.timestamp >= previous);
            previous = event.timestamp;
        }
    }

    #[test]
    fn event_serializes_camel_case() {
        let event = Event::new("t", "s", json!(1)).with_retry_count(2);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["retryCount"], 2);
        assert_eq!(value["priority"], "medium");
    }
}
