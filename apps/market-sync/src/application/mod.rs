//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the sync engine service and the port interfaces
//! that define how the core talks to external collaborators.

/// Port interfaces for external systems (upstream data, transport, storage).
pub mod ports;

/// Application services composing the core components.
pub mod services;
