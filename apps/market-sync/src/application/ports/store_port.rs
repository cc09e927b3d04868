//! Durable Store Port (Driven Port)
//!
//! Key-value storage used to persist the offline mutation queue across
//! restarts. The core treats it as opaque and only requires that a
//! completed `put` is durable.

use async_trait::async_trait;

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A stored value could not be decoded.
    #[error("corrupt stored value for key {key}: {message}")]
    Corrupt { key: String, message: String },

    /// The key cannot be represented by this store.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Port for durable key-value storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Store a value, replacing any previous one.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Load a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a value. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
