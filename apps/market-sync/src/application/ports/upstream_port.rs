//! Upstream Provider Port (Driven Port)
//!
//! Interface to the stock/sentiment data provider. This is the only place
//! the core depends on an external data format; samples are normalized
//! into event payloads as soon as they arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observation of a topic's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSample {
    /// Observed value.
    pub value: Value,
    /// Provider timestamp in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Upstream fetch error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// The provider did not answer within the fetch deadline.
    #[error("upstream fetch timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The provider could not be reached or returned an error status.
    #[error("upstream unavailable: {message}")]
    Unavailable { message: String },

    /// The provider answered with data that could not be parsed.
    #[error("malformed upstream payload: {message}")]
    Malformed { message: String },

    /// The provider does not know this topic.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

impl UpstreamError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::Malformed { .. } => "malformed",
            Self::UnknownTopic(_) => "unknown_topic",
        }
    }
}

/// Port for fetching the current value of a topic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Fetch the latest sample for a topic.
    async fn fetch(&self, topic: &str) -> Result<UpstreamSample, UpstreamError>;
}
