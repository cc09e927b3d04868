//! Transport Connection
//!
//! Manages one bidirectional, message-framed connection to a peer.
//!
//! # State Machine
//!
//! ```text
//! disconnected -> connecting -> connected -> disconnected   (clean close)
//!                     |             |
//!                     +-------------+-----> reconnecting    (unclean close)
//!                                               |
//!                                               +-> connecting -> ...
//!                                               +-> disconnected (attempts exhausted)
//! ```
//!
//! A supervisor task owns the dial/read loop. It is started by
//! [`Connection::connect`] and stopped by [`Connection::disconnect`], which
//! cancels the heartbeat and any pending backoff sleep.
//!
//! Outbound frames sent while not connected wait in a bounded FIFO queue
//! (oldest dropped on overflow) and are flushed in order on connect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, FrameCodec, WireFormat, frame_type};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    DeliveryError, Dialer, FrameChannel, PeerSink, RawFrame, TransportError,
};
use crate::domain::connection::ConnectionState;
use crate::domain::event::{CONNECTION_STATE_TOPIC, Event, Priority};
use crate::infrastructure::bus::EventBus;
use crate::infrastructure::metrics;

const EVENT_SOURCE: &str = "transport";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for a single dial.
    pub connect_timeout: Duration,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Capacity of the outbound queue used while not connected.
    pub outbound_capacity: usize,
    /// Outbound wire encoding.
    pub wire_format: WireFormat,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            outbound_capacity: 100,
            wire_format: WireFormat::Json,
        }
    }
}

impl ConnectionConfig {
    /// Create configuration from `TransportSettings`.
    #[must_use]
    pub const fn from_transport_settings(settings: &crate::TransportSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            heartbeat: HeartbeatConfig::from_transport_settings(settings),
            reconnect: ReconnectConfig::from_transport_settings(settings),
            outbound_capacity: settings.outbound_queue_capacity,
            wire_format: settings.wire_format,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Connection statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Current state.
    pub state: ConnectionState,
    /// Frames written to the peer.
    pub frames_sent: u64,
    /// Frames read from the peer.
    pub frames_received: u64,
    /// Outbound frames dropped on queue overflow.
    pub frames_dropped: u64,
    /// Inbound frames that failed to decode.
    pub malformed_frames: u64,
    /// Reconnection attempts.
    pub reconnects: u64,
    /// Frames waiting in the outbound queue.
    pub pending: usize,
    /// Most recent heartbeat round trip.
    pub latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    malformed_frames: AtomicU64,
    reconnects: AtomicU64,
}

// =============================================================================
// Outbound Queue
// =============================================================================

#[derive(Debug)]
struct Outbound {
    pending: VecDeque<Frame>,
    live: Option<mpsc::UnboundedSender<RawFrame>>,
}

/// Result of pushing a frame into the outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the live channel.
    Sent,
    /// Queued until the connection is established.
    Queued,
    /// Queued and the oldest queued frame was dropped.
    QueuedWithDrop,
    /// The frame could not be encoded.
    Dropped,
}

// =============================================================================
// Connection
// =============================================================================

enum SessionEnd {
    Cancelled,
    Clean,
    Unclean(TransportError),
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A transport connection to one peer.
///
/// # Example
///
/// ```rust,no_run
/// use market_sync::infrastructure::transport::{Connection, ConnectionConfig, MemoryDialer};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let (dialer, _peers) = MemoryDialer::new();
/// let (connection, mut inbound) =
///     Connection::new(Arc::new(dialer), ConnectionConfig::default(), None);
///
/// connection.connect().await.ok();
/// while let Some(frame) = inbound.recv().await {
///     println!("{}", frame.frame_type);
/// }
/// # }
/// ```
pub struct Connection {
    dialer: Arc<dyn Dialer>,
    config: ConnectionConfig,
    codec: FrameCodec,
    bus: Option<Arc<EventBus>>,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Mutex<Outbound>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    heartbeat: Arc<HeartbeatState>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
    last_error: Mutex<Option<TransportError>>,
    counters: ConnectionCounters,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a disconnected connection.
    ///
    /// Returns the connection and the receiver of decoded inbound frames.
    /// Heartbeat frames are handled internally and never forwarded.
    #[must_use]
    pub fn new(
        dialer: Arc<dyn Dialer>,
        config: ConnectionConfig,
        bus: Option<Arc<EventBus>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let connection = Arc::new(Self {
            dialer,
            codec: FrameCodec::new(config.wire_format),
            config,
            bus,
            state_tx,
            outbound: Mutex::new(Outbound {
                pending: VecDeque::new(),
                live: None,
            }),
            inbound_tx,
            heartbeat: Arc::new(HeartbeatState::new()),
            supervisor: tokio::sync::Mutex::new(None),
            last_error: Mutex::new(None),
            counters: ConnectionCounters::default(),
        });

        (connection, inbound_rx)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect to the peer.
    ///
    /// Idempotent: while a connection is connecting, reconnecting or
    /// connected this starts nothing and resolves once the existing attempt
    /// settles.
    ///
    /// # Errors
    ///
    /// Returns the last transport error if the connection settles in
    /// `disconnected`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut state_rx = self.state_tx.subscribe();

        {
            let mut supervisor = self.supervisor.lock().await;
            if !self.state().is_active() {
                if let Some(previous) = supervisor.take() {
                    previous.cancel.cancel();
                    let _ = previous.handle.await;
                }

                *self.last_error.lock() = None;
                self.set_state(ConnectionState::Connecting);

                let cancel = CancellationToken::new();
                let handle = tokio::spawn(Arc::clone(self).supervise(cancel.clone()));
                *supervisor = Some(Supervisor { cancel, handle });
            }
        }

        let settled = state_rx
            .wait_for(|state| state.is_settled())
            .await
            .map(|state| *state)
            .map_err(|_| TransportError::Shutdown)?;

        match settled {
            ConnectionState::Connected => Ok(()),
            _ => Err(self
                .last_error
                .lock()
                .clone()
                .unwrap_or(TransportError::Shutdown)),
        }
    }

    /// Close the connection and cancel all of its timers.
    ///
    /// Waits for the supervisor task to finish. Queued outbound frames are
    /// kept for the next `connect()`.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await {
                tracing::warn!(error = %e, "Connection supervisor ended abnormally");
            }
        }

        self.detach_writer();
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Transport disconnected");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Most recent heartbeat round trip.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.last_rtt()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            malformed_frames: self.counters.malformed_frames.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            pending: self.outbound.lock().pending.len(),
            latency: self.latency(),
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send a frame, queueing it while not connected.
    ///
    /// An id and timestamp are assigned when absent.
    pub fn send(&self, mut frame: Frame) -> SendStatus {
        frame.ensure_envelope();

        let mut outbound = self.outbound.lock();

        if let Some(live) = outbound.live.as_ref() {
            match self.codec.encode(&frame) {
                Ok(raw) => {
                    if live.send(raw).is_ok() {
                        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                        metrics::record_frames_sent(1);
                        return SendStatus::Sent;
                    }
                    outbound.live = None;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        frame_type = %frame.frame_type,
                        "Failed to encode frame"
                    );
                    return SendStatus::Dropped;
                }
            }
        }

        let mut status = SendStatus::Queued;
        outbound.pending.push_back(frame);
        while outbound.pending.len() > self.config.outbound_capacity {
            outbound.pending.pop_front();
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_frame_dropped();
            status = SendStatus::QueuedWithDrop;
        }

        if status == SendStatus::QueuedWithDrop {
            tracing::warn!(
                capacity = self.config.outbound_capacity,
                "Outbound queue full, dropped oldest frame"
            );
        }
        status
    }

    /// Flush the queue into a fresh channel and make it the live writer.
    fn attach_writer(&self, writer: &mpsc::UnboundedSender<RawFrame>) {
        let mut outbound = self.outbound.lock();
        let mut flushed = 0_u64;

        while let Some(frame) = outbound.pending.pop_front() {
            let raw = match self.codec.encode(&frame) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::error!(error = %e, "Dropping queued frame that failed to encode");
                    continue;
                }
            };
            if writer.send(raw).is_err() {
                outbound.pending.push_front(frame);
                break;
            }
            flushed += 1;
        }

        self.counters.frames_sent.fetch_add(flushed, Ordering::Relaxed);
        metrics::record_frames_sent(flushed);
        if flushed > 0 {
            tracing::info!(flushed, "Flushed queued outbound frames");
        }

        outbound.live = Some(writer.clone());
    }

    fn detach_writer(&self) {
        self.outbound.lock().live = None;
    }

    fn send_direct(&self, writer: &mpsc::UnboundedSender<RawFrame>, frame: &Frame) -> bool {
        match self.codec.encode(frame) {
            Ok(raw) => {
                let ok = writer.send(raw).is_ok();
                if ok {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    metrics::record_frames_sent(1);
                }
                ok
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode control frame");
                false
            }
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                tracing::warn!(from = %state, to = %next, "Ignoring invalid state transition");
                return false;
            }
            previous = *state;
            *state = next;
            true
        });

        if !changed {
            return;
        }

        tracing::info!(from = %previous, to = %next, "Connection state changed");
        metrics::set_connection_state(next);

        if let Some(bus) = &self.bus {
            let mut payload = json!({
                "state": next.as_str(),
                "previous": previous.as_str(),
            });
            if let Some(error) = self.last_error.lock().as_ref() {
                payload["error"] = json!(error.to_string());
            }
            let priority = match next {
                ConnectionState::Disconnected | ConnectionState::Reconnecting => Priority::High,
                _ => Priority::Medium,
            };
            bus.publish(
                Event::new(CONNECTION_STATE_TOPIC, EVENT_SOURCE, payload).with_priority(priority),
            );
        }
    }

    // =========================================================================
    // Supervisor
    // =========================================================================

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            self.set_state(ConnectionState::Connecting);

            let dialed = tokio::select! {
                () = cancel.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout, self.dialer.dial()) => {
                    result.unwrap_or(Err(TransportError::ConnectTimeout))
                }
            };

            let error = match dialed {
                Ok(channel) => {
                    policy.reset();
                    match self.run_session(channel, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Clean => {
                            tracing::info!("Peer closed the connection");
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Unclean(error) => error,
                    }
                }
                Err(error) => error,
            };

            tracing::warn!(error = %error, "Transport connection lost");
            *self.last_error.lock() = Some(error);

            let Some(delay) = policy.next_delay() else {
                let attempts = policy.max_attempts();
                tracing::error!(attempts, "Reconnection attempts exhausted");
                *self.last_error.lock() = Some(TransportError::MaxAttemptsExceeded(attempts));
                self.set_state(ConnectionState::Disconnected);
                return;
            };

            let attempt = policy.attempt_count();
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();
            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis(),
                "Scheduling reconnection"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Cancelled during reconnect delay");
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.detach_writer();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(&self, channel: FrameChannel, cancel: &CancellationToken) -> SessionEnd {
        let FrameChannel {
            outbound: writer,
            mut inbound,
        } = channel;

        self.heartbeat.reset();
        self.attach_writer(&writer);
        *self.last_error.lock() = None;
        self.set_state(ConnectionState::Connected);

        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&self.heartbeat),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );
        let _heartbeat_guard = heartbeat_cancel.drop_guard();

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => break SessionEnd::Cancelled,
                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        if !self.send_direct(&writer, &Frame::ping()) {
                            break SessionEnd::Unclean(TransportError::ClosedUnexpectedly);
                        }
                    }
                    Some(HeartbeatEvent::Timeout) => {
                        break SessionEnd::Unclean(TransportError::HeartbeatTimeout(
                            self.config.heartbeat.pong_timeout,
                        ));
                    }
                    None => {}
                },
                frame = inbound.recv() => match frame {
                    Some(Ok(RawFrame::Close)) => break SessionEnd::Clean,
                    Some(Ok(raw)) => self.handle_inbound(&writer, &raw),
                    Some(Err(error)) => break SessionEnd::Unclean(error),
                    None => break SessionEnd::Unclean(TransportError::ClosedUnexpectedly),
                },
            }
        };

        self.detach_writer();
        end
    }

    fn handle_inbound(&self, writer: &mpsc::UnboundedSender<RawFrame>, raw: &RawFrame) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_received();
        self.heartbeat.record_activity();

        let frame = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                metrics::record_malformed_frame();
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame.frame_type.as_str() {
            frame_type::PING => {
                self.send_direct(writer, &Frame::pong_for(&frame));
            }
            frame_type::PONG => {
                if let Some(rtt) = self.heartbeat.record_pong() {
                    metrics::record_heartbeat_rtt(rtt);
                    tracing::trace!(rtt_ms = rtt.as_millis(), "Heartbeat round trip");
                }
            }
            _ => {
                if self.inbound_tx.send(frame).is_err() {
                    tracing::debug!("Inbound frame receiver dropped");
                }
            }
        }
    }
}

// =============================================================================
// Peer Sink
// =============================================================================

/// Routed events are forwarded to the remote peer as `event` frames.
impl PeerSink for Connection {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        let frame = Frame::event(event).map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        match self.send(frame) {
            SendStatus::Dropped => Err(DeliveryError::Rejected(event.topic.clone())),
            SendStatus::Sent | SendStatus::Queued | SendStatus::QueuedWithDrop => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::infrastructure::transport::memory::{MemoryDialer, MemoryPeer};

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(1),
            heartbeat: HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(10)),
            reconnect: ReconnectConfig::new(
                Duration::from_millis(10),
                Duration::from_millis(100),
                2.0,
                0.0,
                3,
            ),
            outbound_capacity: 100,
            wire_format: WireFormat::Json,
        }
    }

    fn decode(raw: &RawFrame) -> Frame {
        FrameCodec::default().decode(raw).unwrap()
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MemoryPeer>) -> MemoryPeer {
        tokio::time::timeout(Duration::from_secs(5), peers.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn connect_reaches_connected() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);

        connection.connect().await.unwrap();
        let _peer = next_peer(&mut peers).await;

        assert_eq!(connection.state(), ConnectionState::Connected);
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (dialer, mut peers) = MemoryDialer::new();
        let dialer = Arc::new(dialer);
        let (connection, _inbound) = Connection::new(dialer.clone(), fast_config(), None);

        let (a, b) = tokio::join!(connection.connect(), connection.connect());
        a.unwrap();
        b.unwrap();
        connection.connect().await.unwrap();

        let _peer = next_peer(&mut peers).await;
        assert_eq!(dialer.dial_count(), 1);
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn queued_frames_flush_in_order() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);

        for i in 0..3 {
            assert_eq!(connection.send(Frame::new("n", json!(i))), SendStatus::Queued);
        }
        connection.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;

        for i in 0..3 {
            let frame = decode(&peer.recv().await.unwrap());
            assert_eq!(frame.payload, json!(i));
            assert!(frame.id.is_some());
        }
        assert_eq!(connection.send(Frame::new("n", json!(3))), SendStatus::Sent);
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (dialer, mut peers) = MemoryDialer::new();
        let config = ConnectionConfig {
            outbound_capacity: 2,
            ..fast_config()
        };
        let (connection, _inbound) = Connection::new(Arc::new(dialer), config, None);

        connection.send(Frame::new("n", json!(1)));
        connection.send(Frame::new("n", json!(2)));
        assert_eq!(
            connection.send(Frame::new("n", json!(3))),
            SendStatus::QueuedWithDrop
        );
        assert_eq!(connection.stats().frames_dropped, 1);

        connection.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        assert_eq!(decode(&peer.recv().await.unwrap()).payload, json!(2));
        assert_eq!(decode(&peer.recv().await.unwrap()).payload, json!(3));
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn answers_ping_and_forwards_other_frames() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, mut inbound) = Connection::new(Arc::new(dialer), fast_config(), None);
        connection.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;

        peer.send_text(r#"{"type":"ping","id":"p1"}"#);
        let pong = decode(&peer.recv().await.unwrap());
        assert_eq!(pong.frame_type, "pong");
        assert_eq!(pong.id.as_deref(), Some("p1"));

        peer.send_text("garbage");
        peer.send_text(r#"{"type":"AAPL.update","payload":{"price":1}}"#);
        let frame = inbound.recv().await.unwrap();
        assert_eq!(frame.frame_type, "AAPL.update");
        assert_eq!(connection.stats().malformed_frames, 1);
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn clean_close_settles_disconnected() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);
        connection.connect().await.unwrap();
        let peer = next_peer(&mut peers).await;

        let mut state = connection.watch_state();
        peer.close();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(connection.stats().reconnects, 0);
    }

    #[tokio::test]
    async fn unclean_close_reconnects() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);
        connection.connect().await.unwrap();
        let peer = next_peer(&mut peers).await;

        drop(peer);
        let _second = next_peer(&mut peers).await;

        let mut state = connection.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(connection.stats().reconnects, 1);
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn exhausted_attempts_are_terminal() {
        let (dialer, _peers) = MemoryDialer::new();
        dialer.set_accepting(false);
        let dialer = Arc::new(dialer);
        let (connection, _inbound) = Connection::new(dialer.clone(), fast_config(), None);

        let result = connection.connect().await;

        assert!(matches!(result, Err(TransportError::MaxAttemptsExceeded(3))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dial_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_moves_to_reconnecting() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);
        connection.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        let mut state = connection.watch_state();

        let ping = decode(&peer.recv().await.unwrap());
        assert_eq!(ping.frame_type, "ping");

        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        assert!(connection.stats().reconnects >= 1);
        connection.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pong_records_latency() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);
        connection.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;

        let ping = decode(&peer.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.send_text(&format!(
            r#"{{"type":"pong","id":"{}"}}"#,
            ping.id.unwrap_or_default()
        ));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let latency = connection.latency().unwrap();
        assert!(latency >= Duration::from_millis(20));
        assert_eq!(connection.state(), ConnectionState::Connected);
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let (dialer, mut peers) = MemoryDialer::new();
        let config = ConnectionConfig {
            reconnect: ReconnectConfig::new(
                Duration::from_secs(60),
                Duration::from_secs(60),
                2.0,
                0.0,
                3,
            ),
            ..fast_config()
        };
        let dialer = Arc::new(dialer);
        let (connection, _inbound) = Connection::new(dialer.clone(), config, None);
        connection.connect().await.unwrap();
        drop(next_peer(&mut peers).await);

        let mut state = connection.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), connection.disconnect())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn delivers_routed_events_as_frames() {
        let (dialer, mut peers) = MemoryDialer::new();
        let (connection, _inbound) = Connection::new(Arc::new(dialer), fast_config(), None);

        let event = Event::new("AAPL.update", "test", json!({"price": 10}));
        connection.deliver(&event).unwrap();
        assert_eq!(connection.stats().pending, 1);

        connection.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        let frame = decode(&peer.recv().await.unwrap());
        assert_eq!(frame.frame_type, frame_type::EVENT);
        assert_eq!(frame.into_event("peer"), event);

        connection.disconnect().await;
    }
}
