//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamProvider`: fetch-by-topic from a stock/sentiment data provider
//! - `Dialer`: opens a message-framed, bidirectional channel to a peer
//! - `DurableStore`: key-value storage for the offline mutation queue
//! - `RemoteWriter`: writes a queued mutation to the server
//! - `PeerSink`: delivers routed events to one connected peer
//! - `FeedController`: starts/stops upstream feeds as topic demand changes

mod peer_sink_port;
mod remote_writer_port;
mod store_port;
mod transport_port;
mod upstream_port;

pub use crate::domain::subscription::{FeedController, NoFeeds};
pub use peer_sink_port::{DeliveryError, PeerSink};
pub use remote_writer_port::{RemoteWriteError, RemoteWriter, WriteOutcome};
pub use store_port::{DurableStore, StoreError};
pub use transport_port::{Dialer, FrameChannel, RawFrame, TransportError};
pub use upstream_port::{UpstreamError, UpstreamProvider, UpstreamSample};

#[cfg(test)]
pub use remote_writer_port::MockRemoteWriter;
#[cfg(test)]
pub use upstream_port::MockUpstreamProvider;
