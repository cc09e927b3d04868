//! WebSocket Dialer
//!
//! Opens a WebSocket to the peer and pumps frames between the socket and
//! the channel pair handed to the connection.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{Dialer, FrameChannel, RawFrame, TransportError};

/// Dialer for `ws://` and `wss://` peers.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    /// Create a dialer for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The peer URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<FrameChannel, TransportError> {
        tracing::info!(url = %self.url, "Connecting to peer");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RawFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // Writer: ends when the connection drops its sender.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    RawFrame::Text(text) => Message::Text(text.into()),
                    RawFrame::Binary(bytes) => Message::Binary(bytes.into()),
                    RawFrame::Close => break,
                };
                if let Err(e) = write.send(message).await {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Reader: ends on close, error, or when the connection stops listening.
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Ok(RawFrame::Text(text.to_string())),
                    Ok(Message::Binary(bytes)) => Ok(RawFrame::Binary(bytes.to_vec())),
                    Ok(Message::Close(_)) => Ok(RawFrame::Close),
                    Ok(_) => continue,
                    Err(e) => Err(TransportError::Reset(e.to_string())),
                };
                let terminal = !matches!(frame, Ok(RawFrame::Text(_) | RawFrame::Binary(_)));
                if inbound_tx.send(frame).is_err() || terminal {
                    return;
                }
            }
        });

        Ok(FrameChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_failure_is_connect_failed() {
        let dialer = WebSocketDialer::new("ws://127.0.0.1:1/unreachable");
        assert_eq!(dialer.url(), "ws://127.0.0.1:1/unreachable");

        let result = dialer.dial().await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
