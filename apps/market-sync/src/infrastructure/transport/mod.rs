//! Transport Adapters
//!
//! Bidirectional, message-framed connections to a remote peer:
//!
//! - **Connection**: state machine, outbound queue, supervisor task
//! - **Heartbeat**: liveness pings and half-open detection
//! - **Reconnect**: bounded exponential backoff
//! - **Codec**: JSON text and `MessagePack` binary frames
//! - **Dialers**: WebSocket and in-process
//! - **Writer**: remote mutation writes over the connection

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod memory;
pub mod reconnect;
pub mod websocket;
pub mod writer;

pub use codec::{CodecError, Frame, FrameCodec, WireFormat, frame_type};
pub use connection::{Connection, ConnectionConfig, ConnectionStats, SendStatus};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use memory::{MemoryDialer, MemoryPeer};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use websocket::WebSocketDialer;
pub use writer::{LateReply, TransportWriter};
