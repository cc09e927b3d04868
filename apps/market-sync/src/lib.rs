#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Sync - Real-time Market Data Sync Core
//!
//! Pushes live market updates to subscribed peers, keeps the link to a
//! remote peer alive across network loss, and queues mutations written
//! while offline until they can be reconciled with the server.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core sync types with no I/O
//!   - `event`: Events, priorities and reserved topics
//!   - `subscription`: Per-peer subscriptions and topic routing
//!   - `mutation`: Queued offline mutations
//!   - `conflict`: Conflict detection and resolution strategies
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream data, transport, storage, remote writes, peer sinks
//!   - `services`: The sync engine
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `bus`: In-process publish/subscribe with history
//!   - `transport`: Connection state machine, heartbeat, reconnect, codecs
//!   - `streaming`: Upstream poll loops per active topic
//!   - `offline`: Durable mutation queue and stores
//!   - `monitor`: Sampled metrics and threshold alerts
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Upstream ──► StreamingAdapter ──┐
//!                                 ├──► EventBus ──► SubscriptionRegistry ──► Peer 1
//! Remote peer ──► Connection ─────┘                                      └─► Peer N
//!
//! Mutation ──► OfflineQueue ──► RemoteWriter ──► ConflictResolver
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core sync types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::conflict::{
    ConflictError, ConflictPolicy, ConflictResolver, ManualResolution, MergeRules, Resolution,
    ResolutionStrategy,
};
pub use domain::connection::ConnectionState;
pub use domain::event::{Event, Priority};
pub use domain::mutation::{QueueStats, QueuedMutation, SyncStatus};
pub use domain::subscription::{PeerId, SubscriptionChanges, SubscriptionRegistry, Topic};

// Sync engine
pub use application::services::{EngineError, SyncEngine, SyncEngineBuilder};

// Infrastructure config
pub use infrastructure::config::{
    BusSettings, ConfigError, MonitorSettings, QueueSettings, ServerSettings, StreamingSettings,
    SyncConfig, TransportSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
