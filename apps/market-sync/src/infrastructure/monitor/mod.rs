//! Performance and Health Monitor
//!
//! Samples connection count, bus message rate, heartbeat latency and error
//! rate, and raises alerts when a sample crosses a configured threshold.
//!
//! Alerts are edge-triggered: a threshold fires once when it is first
//! breached and re-arms only after a sample falls back inside it.
//!
//! # Metrics
//!
//! | Metric             | Unit       | Source                                  |
//! |--------------------|------------|-----------------------------------------|
//! | `connection_count` | count      | tracked links currently connected       |
//! | `message_rate`     | events/sec | bus publications since the last sample  |
//! | `latency_ms`       | ms         | mean heartbeat round trip of live links |
//! | `error_rate`       | ratio      | error-topic events / all events         |

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::connection::ConnectionState;
use crate::domain::event::{Event, MONITOR_ALERT_TOPIC, Priority};
use crate::infrastructure::bus::EventBus;
use crate::infrastructure::metrics;
use crate::infrastructure::transport::Connection;

const EVENT_SOURCE: &str = "monitor";

// =============================================================================
// Metrics and Thresholds
// =============================================================================

/// A sampled metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Connected links.
    ConnectionCount,
    /// Bus events per second.
    MessageRate,
    /// Mean heartbeat round trip in milliseconds.
    LatencyMs,
    /// Share of bus events published on error topics.
    ErrorRate,
}

impl Metric {
    /// Get the metric name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionCount => "connection_count",
            Self::MessageRate => "message_rate",
            Self::LatencyMs => "latency_ms",
            Self::ErrorRate => "error_rate",
        }
    }
}

impl FromStr for Metric {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "connection_count" => Ok(Self::ConnectionCount),
            "message_rate" => Ok(Self::MessageRate),
            "latency_ms" | "latency" => Ok(Self::LatencyMs),
            "error_rate" => Ok(Self::ErrorRate),
            other => Err(MonitorError::UnknownMetric(other.to_string())),
        }
    }
}

/// Direction of a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    /// Breached when the value exceeds the limit.
    Above,
    /// Breached when the value falls below the limit.
    Below,
}

/// A threshold on one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Threshold {
    /// Watched metric.
    pub metric: Metric,
    /// Breach direction.
    pub comparator: Comparator,
    /// Limit.
    pub limit: f64,
}

impl Threshold {
    /// Breached when `metric` exceeds `limit`.
    #[must_use]
    pub const fn above(metric: Metric, limit: f64) -> Self {
        Self {
            metric,
            comparator: Comparator::Above,
            limit,
        }
    }

    /// Breached when `metric` falls below `limit`.
    #[must_use]
    pub const fn below(metric: Metric, limit: f64) -> Self {
        Self {
            metric,
            comparator: Comparator::Below,
            limit,
        }
    }

    /// Whether `value` is outside the threshold.
    #[must_use]
    pub fn is_breached(&self, value: f64) -> bool {
        match self.comparator {
            Comparator::Above => value > self.limit,
            Comparator::Below => value < self.limit,
        }
    }

    /// Parse comma-separated rules such as `latency_ms>500,connection_count<1`.
    ///
    /// # Errors
    ///
    /// Returns an error for a rule without `>`/`<`, an unknown metric or a
    /// non-numeric limit.
    pub fn parse_list(rules: &str) -> Result<Vec<Self>, MonitorError> {
        rules
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|rule| {
                let (metric, comparator, limit) = if let Some((m, l)) = rule.split_once('>') {
                    (m, Comparator::Above, l)
                } else if let Some((m, l)) = rule.split_once('<') {
                    (m, Comparator::Below, l)
                } else {
                    return Err(MonitorError::InvalidThreshold(rule.to_string()));
                };
                let limit = limit
                    .trim()
                    .parse()
                    .map_err(|_| MonitorError::InvalidThreshold(rule.to_string()))?;
                Ok(Self {
                    metric: metric.parse()?,
                    comparator,
                    limit,
                })
            })
            .collect()
    }
}

/// Monitor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Metric name not recognised.
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    /// Threshold rule could not be parsed.
    #[error("invalid threshold rule: {0}")]
    InvalidThreshold(String),
}

// =============================================================================
// Snapshots and Alerts
// =============================================================================

/// One sample of all metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Connected links.
    pub connection_count: usize,
    /// Bus events per second.
    pub message_rate: f64,
    /// Mean heartbeat round trip of connected links, if measured.
    pub latency_ms: Option<f64>,
    /// Share of bus events published on error topics.
    pub error_rate: f64,
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            connection_count: 0,
            message_rate: 0.0,
            latency_ms: None,
            error_rate: 0.0,
            sampled_at: Utc::now(),
        }
    }
}

impl MetricsSnapshot {
    /// Value of one metric. `None` when latency has not been measured.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::ConnectionCount => Some(self.connection_count as f64),
            Metric::MessageRate => Some(self.message_rate),
            Metric::LatencyMs => self.latency_ms,
            Metric::ErrorRate => Some(self.error_rate),
        }
    }
}

/// A threshold crossing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// The breached threshold.
    pub threshold: Threshold,
    /// Observed value.
    pub value: f64,
    /// When the breach was observed.
    pub timestamp: DateTime<Utc>,
}

/// Alert callback.
pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

/// Handle returned by [`Monitor::on_alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertRegistration(u64);

// =============================================================================
// Link Health
// =============================================================================

/// A link whose liveness and latency the monitor samples.
pub trait LinkHealth: Send + Sync {
    /// Whether the link is connected.
    fn is_connected(&self) -> bool;

    /// Most recent round trip.
    fn latency(&self) -> Option<Duration>;
}

impl LinkHealth for Connection {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn latency(&self) -> Option<Duration> {
        Self::latency(self)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between samples.
    pub sample_interval: Duration,
    /// Initial thresholds.
    pub thresholds: Vec<Threshold>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            thresholds: Vec::new(),
        }
    }
}

impl From<&crate::MonitorSettings> for MonitorConfig {
    fn from(settings: &crate::MonitorSettings) -> Self {
        Self {
            sample_interval: settings.sample_interval,
            thresholds: settings.thresholds.clone(),
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

struct Baseline {
    at: Instant,
    published: u64,
    error_events: u64,
}

struct Rule {
    threshold: Threshold,
    breached: bool,
}

/// The performance and health monitor.
pub struct Monitor {
    bus: Arc<EventBus>,
    links: RwLock<Vec<Arc<dyn LinkHealth>>>,
    rules: Mutex<Vec<Rule>>,
    callbacks: RwLock<Vec<(AlertRegistration, AlertCallback)>>,
    baseline: Mutex<Baseline>,
    latest: Mutex<MetricsSnapshot>,
    sample_interval: Duration,
    next_registration: AtomicU64,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("sample_interval", &self.sample_interval)
            .field("links", &self.links.read().len())
            .field("latest", &*self.latest.lock())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create a monitor over `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, config: MonitorConfig) -> Self {
        let stats = bus.stats();
        Self {
            bus,
            links: RwLock::new(Vec::new()),
            rules: Mutex::new(
                config
                    .thresholds
                    .into_iter()
                    .map(|threshold| Rule {
                        threshold,
                        breached: false,
                    })
                    .collect(),
            ),
            callbacks: RwLock::new(Vec::new()),
            baseline: Mutex::new(Baseline {
                at: Instant::now(),
                published: stats.published,
                error_events: stats.error_events,
            }),
            latest: Mutex::new(MetricsSnapshot::default()),
            sample_interval: config.sample_interval,
            next_registration: AtomicU64::new(1),
        }
    }

    /// Include a link in connection count and latency.
    pub fn track(&self, link: Arc<dyn LinkHealth>) {
        self.links.write().push(link);
    }

    /// Add a threshold.
    pub fn add_threshold(&self, threshold: Threshold) {
        self.rules.lock().push(Rule {
            threshold,
            breached: false,
        });
    }

    /// Register an alert callback.
    pub fn on_alert<F>(&self, callback: F) -> AlertRegistration
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        let registration = AlertRegistration(self.next_registration.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((registration, Arc::new(callback)));
        registration
    }

    /// Remove an alert callback. Returns `false` if it was not registered.
    pub fn remove_alert(&self, registration: AlertRegistration) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(r, _)| *r != registration);
        callbacks.len() != before
    }

    /// The most recent committed sample.
    #[must_use]
    pub fn latest(&self) -> MetricsSnapshot {
        *self.latest.lock()
    }

    /// Metrics since the last sample, without committing a new window.
    #[must_use]
    pub fn current(&self) -> MetricsSnapshot {
        let baseline = self.baseline.lock();
        self.measure(&baseline)
    }

    /// Take a sample, evaluate thresholds and start a new window.
    pub fn sample(&self) -> MetricsSnapshot {
        let snapshot = {
            let mut baseline = self.baseline.lock();
            let snapshot = self.measure(&baseline);
            let stats = self.bus.stats();
            *baseline = Baseline {
                at: Instant::now(),
                published: stats.published,
                error_events: stats.error_events,
            };
            snapshot
        };

        *self.latest.lock() = snapshot;
        for alert in self.evaluate(&snapshot) {
            self.raise(&alert);
        }
        snapshot
    }

    /// Sample every interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = Instant::now() + self.sample_interval;
        let mut ticker = tokio::time::interval_at(start, self.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(interval_ms = self.sample_interval.as_millis(), "Monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sample();
                }
            }
        }
        tracing::debug!("Monitor stopped");
    }

    #[allow(clippy::cast_precision_loss)]
    fn measure(&self, baseline: &Baseline) -> MetricsSnapshot {
        let stats = self.bus.stats();
        let published = stats.published.saturating_sub(baseline.published);
        let errors = stats.error_events.saturating_sub(baseline.error_events);
        let elapsed = baseline.at.elapsed().as_secs_f64();

        let message_rate = if elapsed > 0.0 {
            published as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if published > 0 {
            errors as f64 / published as f64
        } else {
            0.0
        };

        let links = self.links.read();
        let live: Vec<&Arc<dyn LinkHealth>> = links.iter().filter(|l| l.is_connected()).collect();
        let rtts: Vec<f64> = live
            .iter()
            .filter_map(|l| l.latency())
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let latency_ms = (!rtts.is_empty()).then(|| rtts.iter().sum::<f64>() / rtts.len() as f64);

        MetricsSnapshot {
            connection_count: live.len(),
            message_rate,
            latency_ms,
            error_rate,
            sampled_at: Utc::now(),
        }
    }

    fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for rule in self.rules.lock().iter_mut() {
            let Some(value) = snapshot.value(rule.threshold.metric) else {
                continue;
            };
            let breached = rule.threshold.is_breached(value);
            if breached && !rule.breached {
                alerts.push(Alert {
                    threshold: rule.threshold,
                    value,
                    timestamp: snapshot.sampled_at,
                });
            }
            rule.breached = breached;
        }
        alerts
    }

    fn raise(&self, alert: &Alert) {
        tracing::warn!(
            metric = alert.threshold.metric.as_str(),
            value = alert.value,
            limit = alert.threshold.limit,
            "Threshold crossed"
        );
        metrics::record_alert(alert.threshold.metric.as_str());

        let callbacks: Vec<(AlertRegistration, AlertCallback)> = self
            .callbacks
            .read()
            .iter()
            .map(|(registration, cb)| (*registration, Arc::clone(cb)))
            .collect();
        for (registration, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(alert))).is_err() {
                tracing::error!(
                    registration = registration.0,
                    metric = alert.threshold.metric.as_str(),
                    "Alert callback panicked"
                );
            }
        }

        self.bus.publish(
            Event::new(
                MONITOR_ALERT_TOPIC,
                EVENT_SOURCE,
                json!({
                    "metric": alert.threshold.metric,
                    "comparator": alert.threshold.comparator,
                    "limit": alert.threshold.limit,
                    "value": alert.value,
                }),
            )
            .with_priority(Priority::High),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
