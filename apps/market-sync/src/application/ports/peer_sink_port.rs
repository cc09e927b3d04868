//! Peer Sink Port (Driven Port)
//!
//! Delivers events routed by the subscription registry to one peer.

use tokio::sync::mpsc;

use crate::domain::event::Event;

/// Delivery error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// The peer has gone away.
    #[error("peer sink closed, dropped {0}")]
    Closed(String),

    /// The event could not be framed for the peer.
    #[error("peer sink rejected {0}")]
    Rejected(String),
}

/// Port for delivering events to a peer.
///
/// Delivery must not block; sinks queue or drop.
pub trait PeerSink: Send + Sync {
    /// Deliver one event.
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;
}

impl PeerSink for mpsc::UnboundedSender<Event> {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        self.send(event.clone())
            .map_err(|e| DeliveryError::Closed(e.0.topic))
    }
}
