//! Streaming Source Adapters
//!
//! - **Adapter**: one independent poll loop per active topic, publishing
//!   `<topic>.update` events on change and `stream.error` on failure
//! - **HTTP provider**: fetch-by-topic against a JSON HTTP API

pub mod adapter;
pub mod http;

pub use adapter::{StreamingAdapter, StreamingConfig, StreamingStats};
pub use http::HttpUpstreamProvider;
