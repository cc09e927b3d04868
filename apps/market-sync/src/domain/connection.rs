//! Connection States
//!
//! ```text
//! disconnected → connecting → connected → disconnected   (clean close)
//!                                       → reconnecting   (unclean close)
//! reconnecting → connecting → …
//! reconnecting → disconnected                            (attempts exhausted)
//! ```

use serde::{Deserialize, Serialize};

/// State of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected; outbound messages are written immediately.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether a `connect()` call waiting on this state can return.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Connected | Self::Disconnected)
    }

    /// Whether a connection attempt is underway or established.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (
                    Self::Connecting,
                    Self::Connected | Self::Reconnecting | Self::Disconnected
                )
                | (Self::Connected, Self::Disconnected | Self::Reconnecting)
                | (Self::Reconnecting, Self::Connecting | Self::Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
