//! HTTP upstream provider.
//!
//! `GET {base_url}/{topic}` returning `{"value": .., "timestamp": ..}`.
//! A missing timestamp is filled with the receive time.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::application::ports::{UpstreamError, UpstreamProvider, UpstreamSample};

#[derive(Debug, Deserialize)]
struct SampleResponse {
    value: Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Upstream provider backed by a JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpUpstreamProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpUpstreamProvider {
    /// Create a provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Unavailable {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url_for(&self, topic: &str) -> String {
        format!("{}/{}", self.base_url, topic)
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstreamProvider {
    async fn fetch(&self, topic: &str) -> Result<UpstreamSample, UpstreamError> {
        let response = self
            .client
            .get(self.url_for(topic))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(self.timeout)
                } else {
                    UpstreamError::Unavailable {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UpstreamError::UnknownTopic(topic.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Unavailable {
                message: format!("{}: {body}", status.as_u16()),
            });
        }

        let sample: SampleResponse =
            response
                .json()
                .await
                .map_err(|e| UpstreamError::Malformed {
                    message: e.to_string(),
                })?;

        Ok(UpstreamSample {
            value: sample.value,
            timestamp: sample
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }
}
