//! Domain Layer - Core sync types and business logic.
//!
//! This layer contains the event model, connection states, subscription
//! tracking, queued mutations and conflict resolution. Nothing here
//! performs I/O.

/// Event model and reserved topic names.
pub mod event;

/// Transport connection states.
pub mod connection;

/// Subscription tracking and topic routing.
pub mod subscription;

/// Offline mutation records.
pub mod mutation;

/// Conflict detection and resolution strategies.
pub mod conflict;
