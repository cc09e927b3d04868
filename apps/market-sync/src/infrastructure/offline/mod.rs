//! Offline Persistence
//!
//! Durable storage adapters and the mutation queue that replays writes
//! once the peer is reachable.

pub mod queue;
pub mod store;

pub use queue::{DrainReport, OfflineQueue, QueueConfig, QueueError};
pub use store::{FileStore, InMemoryStore};
