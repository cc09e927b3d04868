//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the core runtime components and the concrete
//! implementations of the port interfaces defined in the application layer.

/// In-process event bus.
pub mod bus;

/// Transport connection, heartbeat, reconnect and dialers.
pub mod transport;

/// Streaming source adapter and upstream providers.
pub mod streaming;

/// Offline mutation queue and durable stores.
pub mod offline;

/// Performance and health monitor.
pub mod monitor;

/// Configuration and dependency injection.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
