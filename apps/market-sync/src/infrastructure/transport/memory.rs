//! In-process transport.
//!
//! `MemoryDialer` hands out channel pairs instead of sockets. Each
//! successful dial yields a [`MemoryPeer`] on the dialer's peer receiver,
//! which plays the remote side.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::ports::{Dialer, FrameChannel, RawFrame, TransportError};

/// The remote end of an in-process channel.
#[derive(Debug)]
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Result<RawFrame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<RawFrame>,
}

impl MemoryPeer {
    /// Receive the next frame written by the client.
    pub async fn recv(&mut self) -> Option<RawFrame> {
        self.from_client.recv().await
    }

    /// Receive a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<RawFrame> {
        self.from_client.try_recv().ok()
    }

    /// Send a frame to the client.
    pub fn send(&self, frame: RawFrame) -> bool {
        self.to_client.send(Ok(frame)).is_ok()
    }

    /// Send a text frame to the client.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(RawFrame::Text(text.to_string()))
    }

    /// Fail the channel with a transport error.
    pub fn fail(&self, error: TransportError) -> bool {
        self.to_client.send(Err(error)).is_ok()
    }

    /// Close the channel cleanly.
    pub fn close(self) {
        let _ = self.to_client.send(Ok(RawFrame::Close));
    }
}

/// Dialer producing in-process channels.
#[derive(Debug)]
pub struct MemoryDialer {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    accepting: AtomicBool,
    dials: AtomicU32,
}

impl MemoryDialer {
    /// Create a dialer and the receiver of accepted peers.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let dialer = Self {
            peers,
            accepting: AtomicBool::new(true),
            dials: AtomicU32::new(0),
        };
        (dialer, peers_rx)
    }

    /// Accept or refuse subsequent dials.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of dial attempts so far.
    #[must_use]
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<FrameChannel, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("peer refused".to_string()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();

        self.peers
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::ConnectFailed("no listener".to_string()))?;

        Ok(FrameChannel { outbound, inbound })
    }
}
