//! Application Services
//!
//! Services that orchestrate the core components and coordinate between ports.
//!
//! - `SyncEngine`: Owns the bus, registry, transport, queue and monitor, and
//!   exposes the public sync API

mod sync_engine;

pub use sync_engine::{EngineError, SyncEngine, SyncEngineBuilder};
