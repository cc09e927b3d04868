//! Transport Port (Driven Port)
//!
//! A message-framed, bidirectional channel to a remote peer. Adapters
//! (WebSocket, in-memory) pump frames between the wire and a pair of
//! channels so the connection state machine never touches socket types.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A frame as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// UTF-8 text frame (JSON).
    Text(String),
    /// Binary frame (`MessagePack`).
    Binary(Vec<u8>),
    /// The peer closed the channel cleanly.
    Close,
}

/// Transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Dialing the peer failed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Dialing did not finish within the connect deadline.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The channel failed after it was established.
    #[error("connection reset: {0}")]
    Reset(String),

    /// No heartbeat response within the timeout.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    /// The peer closed the channel without a close frame.
    #[error("connection closed unexpectedly")]
    ClosedUnexpectedly,

    /// Reconnection attempts exhausted; `connect()` must be called again.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),

    /// The connection was shut down by the caller.
    #[error("connection shut down")]
    Shutdown,

    /// The operation needs a connected transport.
    #[error("not connected")]
    NotConnected,
}

/// An established channel.
///
/// Dropping `outbound` asks the adapter to close the wire; the adapter
/// ends `inbound` when the wire closes.
#[derive(Debug)]
pub struct FrameChannel {
    /// Frames to write to the peer.
    pub outbound: mpsc::UnboundedSender<RawFrame>,
    /// Frames read from the peer.
    pub inbound: mpsc::UnboundedReceiver<Result<RawFrame, TransportError>>,
}

/// Port for opening channels to a peer.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new channel.
    async fn dial(&self) -> Result<FrameChannel, TransportError>;
}
