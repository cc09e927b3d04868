//! Sync Configuration Settings
//!
//! Configuration types for the sync core, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::conflict::{ConflictPolicy, ResolutionStrategy};
use crate::infrastructure::monitor::{Metric, Threshold};
use crate::infrastructure::transport::WireFormat;

/// Transport connection settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Peer WebSocket URL. Required by the binary.
    pub peer_url: Option<String>,
    /// Deadline for one dial attempt.
    pub connect_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Time to wait for a pong before forcing a reconnect.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Jitter factor applied to reconnection delays.
    pub reconnect_jitter: f64,
    /// Reconnection attempts before the connection gives up.
    pub max_reconnect_attempts: u32,
    /// Frames held while disconnected; the oldest are dropped beyond this.
    pub outbound_queue_capacity: usize,
    /// Outbound frame encoding.
    pub wire_format: WireFormat,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            peer_url: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 10,
            outbound_queue_capacity: 100,
            wire_format: WireFormat::Json,
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Recent events retained for diagnostics.
    pub history_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

/// Upstream streaming settings.
#[derive(Debug, Clone)]
pub struct StreamingSettings {
    /// Base URL of the upstream data provider.
    pub upstream_url: Option<String>,
    /// Interval between polls of one topic.
    pub poll_interval: Duration,
    /// Deadline for one upstream fetch.
    pub fetch_timeout: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            upstream_url: None,
            poll_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Offline mutation queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Directory holding persisted mutations.
    pub storage_dir: PathBuf,
    /// Mutations written concurrently per batch.
    pub batch_size: usize,
    /// Base retry delay.
    pub retry_base: Duration,
    /// Retries after the first attempt before a mutation is left failed.
    pub max_retries: u32,
    /// Deadline for one remote write.
    pub write_deadline: Duration,
    /// Conflict strategy per mutation type.
    pub conflict_policy: ConflictPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data/mutations"),
            batch_size: 10,
            retry_base: Duration::from_secs(1),
            max_retries: 5,
            write_deadline: Duration::from_secs(10),
            conflict_policy: ConflictPolicy::new(ResolutionStrategy::ServerWins),
        }
    }
}

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Interval between samples.
    pub sample_interval: Duration,
    /// Alert thresholds.
    pub thresholds: Vec<Threshold>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            thresholds: vec![
                Threshold::below(Metric::ConnectionCount, 1.0),
                Threshold::above(Metric::LatencyMs, 1000.0),
                Threshold::above(Metric::ErrorRate, 0.1),
            ],
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete sync configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Transport settings.
    pub transport: TransportSettings,
    /// Event bus settings.
    pub bus: BusSettings,
    /// Streaming settings.
    pub streaming: StreamingSettings,
    /// Offline queue settings.
    pub queue: QueueSettings,
    /// Monitor settings.
    pub monitor: MonitorSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Topics the console peer subscribes to.
    pub topics: Vec<String>,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a structured value (conflict policy, thresholds)
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a structured value (conflict policy, thresholds)
    /// cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let transport = TransportSettings {
            peer_url: env.non_empty("SYNC_PEER_URL"),
            connect_timeout: env.secs("SYNC_CONNECT_TIMEOUT_SECS", defaults.transport.connect_timeout),
            heartbeat_interval: env.secs(
                "SYNC_HEARTBEAT_INTERVAL_SECS",
                defaults.transport.heartbeat_interval,
            ),
            heartbeat_timeout: env.secs(
                "SYNC_HEARTBEAT_TIMEOUT_SECS",
                defaults.transport.heartbeat_timeout,
            ),
            reconnect_delay_initial: env.millis(
                "SYNC_RECONNECT_DELAY_INITIAL_MS",
                defaults.transport.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "SYNC_RECONNECT_DELAY_MAX_SECS",
                defaults.transport.reconnect_delay_max,
            ),
            reconnect_jitter: env.parse("SYNC_RECONNECT_JITTER", defaults.transport.reconnect_jitter),
            max_reconnect_attempts: env.parse(
                "SYNC_MAX_RECONNECT_ATTEMPTS",
                defaults.transport.max_reconnect_attempts,
            ),
            outbound_queue_capacity: env.parse(
                "SYNC_OUTBOUND_QUEUE_CAPACITY",
                defaults.transport.outbound_queue_capacity,
            ),
            wire_format: env.parse("SYNC_WIRE_FORMAT", defaults.transport.wire_format),
        };

        let bus = BusSettings {
            history_capacity: env.parse("SYNC_BUS_HISTORY_CAPACITY", defaults.bus.history_capacity),
        };

        let streaming = StreamingSettings {
            upstream_url: env.non_empty("SYNC_UPSTREAM_URL"),
            poll_interval: env.millis("SYNC_POLL_INTERVAL_MS", defaults.streaming.poll_interval),
            fetch_timeout: env.millis("SYNC_FETCH_TIMEOUT_MS", defaults.streaming.fetch_timeout),
        };

        let default_strategy = env.parse(
            "SYNC_DEFAULT_STRATEGY",
            defaults.queue.conflict_policy.default_strategy(),
        );
        let conflict_policy = match env.non_empty("SYNC_CONFLICT_STRATEGIES") {
            Some(pairs) => ConflictPolicy::parse(default_strategy, &pairs).map_err(|e| {
                ConfigError::InvalidValue("SYNC_CONFLICT_STRATEGIES".to_string(), e.to_string())
            })?,
            None => ConflictPolicy::new(default_strategy),
        };

        let queue = QueueSettings {
            storage_dir: env
                .non_empty("SYNC_STORAGE_DIR")
                .map_or(defaults.queue.storage_dir, PathBuf::from),
            batch_size: env.parse("SYNC_QUEUE_BATCH_SIZE", defaults.queue.batch_size),
            retry_base: env.millis("SYNC_RETRY_BASE_MS", defaults.queue.retry_base),
            max_retries: env.parse("SYNC_MAX_RETRIES", defaults.queue.max_retries),
            write_deadline: env.secs("SYNC_WRITE_DEADLINE_SECS", defaults.queue.write_deadline),
            conflict_policy,
        };

        let thresholds = match env.non_empty("SYNC_MONITOR_THRESHOLDS") {
            Some(rules) => Threshold::parse_list(&rules).map_err(|e| {
                ConfigError::InvalidValue("SYNC_MONITOR_THRESHOLDS".to_string(), e.to_string())
            })?,
            None => defaults.monitor.thresholds,
        };

        let monitor = MonitorSettings {
            sample_interval: env.secs(
                "SYNC_MONITOR_INTERVAL_SECS",
                defaults.monitor.sample_interval,
            ),
            thresholds,
        };

        let server = ServerSettings {
            health_port: env.parse("SYNC_HEALTH_PORT", defaults.server.health_port),
        };

        let topics = env
            .non_empty("SYNC_TOPICS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            transport,
            bus,
            streaming,
            queue,
            monitor,
            server,
            topics,
        })
    }

    /// The peer URL, which the binary cannot run without.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `SYNC_PEER_URL` was not set.
    pub fn require_peer_url(&self) -> Result<&str, ConfigError> {
        self.transport
            .peer_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("SYNC_PEER_URL".to_string()))
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.non_empty(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.non_empty(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.non_empty(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
