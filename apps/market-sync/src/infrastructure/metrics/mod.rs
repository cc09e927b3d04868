//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Bus**: events published and handler failures
//! - **Transport**: frames sent/received/dropped, reconnects, heartbeat RTT
//! - **Streaming**: active feeds and fetch errors
//! - **Offline queue**: depth per status and sync outcomes
//! - **Monitor**: threshold alerts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;
use crate::domain::event::{UPDATE_SUFFIX, is_error_topic};
use crate::domain::mutation::QueueStats;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Bus
    describe_counter!(
        "market_sync_events_published_total",
        "Total events published on the event bus"
    );
    describe_counter!(
        "market_sync_handler_failures_total",
        "Total event handler invocations that failed or panicked"
    );

    // Transport
    describe_counter!(
        "market_sync_frames_sent_total",
        "Total frames written to the peer"
    );
    describe_counter!(
        "market_sync_frames_received_total",
        "Total frames read from the peer"
    );
    describe_counter!(
        "market_sync_frames_dropped_total",
        "Total outbound frames dropped on queue overflow"
    );
    describe_counter!(
        "market_sync_malformed_frames_total",
        "Total inbound frames that failed to decode"
    );
    describe_counter!(
        "market_sync_reserved_frames_total",
        "Total inbound frames dropped for claiming a reserved topic"
    );
    describe_counter!(
        "market_sync_reconnects_total",
        "Total reconnection attempts"
    );
    describe_gauge!(
        "market_sync_connection_state",
        "Transport state (0 disconnected, 1 connecting, 2 connected, 3 reconnecting)"
    );
    describe_histogram!(
        "market_sync_heartbeat_rtt_seconds",
        "Heartbeat round-trip time"
    );

    // Streaming
    describe_gauge!("market_sync_active_feeds", "Number of active upstream feeds");
    describe_counter!(
        "market_sync_feed_errors_total",
        "Total upstream fetch errors by type"
    );

    // Offline queue
    describe_gauge!(
        "market_sync_queue_depth",
        "Queued mutations by sync status"
    );
    describe_counter!(
        "market_sync_sync_outcomes_total",
        "Total mutation sync attempts by outcome"
    );

    // Monitor
    describe_counter!(
        "market_sync_monitor_alerts_total",
        "Total threshold alerts raised by metric"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Write applied.
    Synced,
    /// Write failed and will be retried.
    Retried,
    /// Retries exhausted.
    Failed,
    /// Server diverged and the resolver produced a value.
    Resolved,
    /// Server diverged and needs a human decision.
    Manual,
    /// Write abandoned by cancellation.
    Abandoned,
}

impl SyncOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Resolved => "resolved",
            Self::Manual => "manual",
            Self::Abandoned => "abandoned",
        }
    }
}

fn topic_kind(topic: &str) -> &'static str {
    if is_error_topic(topic) {
        "error"
    } else if topic.ends_with(UPDATE_SUFFIX) {
        "update"
    } else {
        "system"
    }
}

/// Record an event published on the bus.
pub fn record_event_published(topic: &str) {
    counter!(
        "market_sync_events_published_total",
        "kind" => topic_kind(topic)
    )
    .increment(1);
}

/// Record a failed handler invocation.
pub fn record_handler_failure() {
    counter!("market_sync_handler_failures_total").increment(1);
}

/// Record frames written to the peer.
pub fn record_frames_sent(count: u64) {
    counter!("market_sync_frames_sent_total").increment(count);
}

/// Record a frame read from the peer.
pub fn record_frame_received() {
    counter!("market_sync_frames_received_total").increment(1);
}

/// Record an outbound frame dropped on overflow.
pub fn record_frame_dropped() {
    counter!("market_sync_frames_dropped_total").increment(1);
}

/// Record an inbound frame that failed to decode.
pub fn record_malformed_frame() {
    counter!("market_sync_malformed_frames_total").increment(1);
}

/// Record an inbound frame dropped for claiming a reserved topic.
pub fn record_reserved_frame() {
    counter!("market_sync_reserved_frames_total").increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("market_sync_reconnects_total").increment(1);
}

/// Update the transport state gauge.
pub fn set_connection_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Reconnecting => 3.0,
    };
    gauge!("market_sync_connection_state").set(value);
}

/// Record a heartbeat round trip.
pub fn record_heartbeat_rtt(rtt: Duration) {
    histogram!("market_sync_heartbeat_rtt_seconds").record(rtt.as_secs_f64());
}

/// Update the active feed count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_feeds(count: usize) {
    gauge!("market_sync_active_feeds").set(count as f64);
}

/// Record an upstream fetch error.
pub fn record_feed_error(error_type: &'static str) {
    counter!(
        "market_sync_feed_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Update the queue depth gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(stats: QueueStats) {
    gauge!("market_sync_queue_depth", "status" => "pending").set(stats.pending as f64);
    gauge!("market_sync_queue_depth", "status" => "syncing").set(stats.syncing as f64);
    gauge!("market_sync_queue_depth", "status" => "failed").set(stats.failed as f64);
}

/// Record the outcome of one sync attempt.
pub fn record_sync_outcome(outcome: SyncOutcome) {
    counter!(
        "market_sync_sync_outcomes_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a monitor alert.
pub fn record_alert(metric: &'static str) {
    counter!(
        "market_sync_monitor_alerts_total",
        "metric" => metric
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
