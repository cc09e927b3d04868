//! Remote Writer Port (Driven Port)
//!
//! Writes a queued mutation to the authoritative server.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::mutation::QueuedMutation;

/// Server response to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server applied the mutation.
    Applied,
    /// The server holds a diverged value.
    Conflict {
        /// The authoritative server value.
        server_value: Value,
    },
}

/// Remote write error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteWriteError {
    /// Transient network failure; retried with backoff.
    #[error("transient write failure: {0}")]
    Transient(String),

    /// The server refused the mutation.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// No answer within the write deadline.
    #[error("write timed out")]
    Timeout,
}

/// Port for writing mutations to the server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Write one mutation.
    async fn write(&self, mutation: &QueuedMutation) -> Result<WriteOutcome, RemoteWriteError>;
}
