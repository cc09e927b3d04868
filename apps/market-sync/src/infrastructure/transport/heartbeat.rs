//! Heartbeat Manager
//!
//! Detects half-open connections by sending a liveness ping at a fixed
//! interval. Any inbound frame counts as liveness; if nothing arrives
//! within the timeout after a ping, the manager reports a timeout and the
//! connection is forced closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Time allowed for a response before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `TransportSettings`.
    #[must_use]
    pub const fn from_transport_settings(settings: &crate::TransportSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping to the peer.
    SendPing,
    /// No response within the timeout; the connection should be restarted.
    Timeout,
}

/// State shared between the heartbeat manager and the connection reader.
#[derive(Debug)]
pub struct HeartbeatState {
    ping_sent_at: RwLock<Option<Instant>>,
    last_rtt: RwLock<Option<Duration>>,
    waiting_for_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ping_sent_at: RwLock::new(None),
            last_rtt: RwLock::new(None),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// Mark that a ping was sent.
    pub fn mark_ping_sent(&self) {
        *self.ping_sent_at.write() = Some(Instant::now());
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Record that the peer showed signs of life.
    pub fn record_activity(&self) {
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// Record a ping response and return the measured round trip.
    pub fn record_pong(&self) -> Option<Duration> {
        self.record_activity();
        let rtt = self.ping_sent_at.read().map(|sent| sent.elapsed())?;
        *self.last_rtt.write() = Some(rtt);
        Some(rtt)
    }

    /// Check if a ping is outstanding.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the outstanding ping was sent.
    #[must_use]
    pub fn time_since_ping(&self) -> Option<Duration> {
        if !self.is_waiting_for_pong() {
            return None;
        }
        self.ping_sent_at.read().map(|sent| sent.elapsed())
    }

    /// Most recent round-trip time.
    #[must_use]
    pub fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.read()
    }

    /// Reset state for a new connection.
    pub fn reset(&self) {
        *self.ping_sent_at.write() = None;
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }
}

/// Heartbeat manager that monitors connection health.
///
/// # Example
///
/// ```rust,no_run
/// use market_sync::infrastructure::transport::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(10);
///     let cancel = CancellationToken::new();
///
///     let manager =
///         HeartbeatManager::new(HeartbeatConfig::default(), state.clone(), event_tx, cancel);
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => { /* write a ping frame */ }
///             HeartbeatEvent::Timeout => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat loop until cancelled or a timeout is detected.
    ///
    /// The first ping goes out one interval after start.
    pub async fn run(self) {
        let start = Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let deadline = self.pong_deadline();

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                () = sleep_until_opt(deadline) => {
                    if self.check_timeout().await.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if self.check_and_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn pong_deadline(&self) -> Option<Instant> {
        if !self.state.is_waiting_for_pong() {
            return None;
        }
        self.state
            .ping_sent_at
            .read()
            .map(|sent| sent + self.config.pong_timeout)
    }

    /// Returns `Err(())` if a timeout occurred and the loop should exit.
    async fn check_timeout(&self) -> Result<(), ()> {
        let Some(elapsed) = self.state.time_since_ping() else {
            return Ok(());
        };
        if elapsed < self.config.pong_timeout {
            return Ok(());
        }

        tracing::warn!(
            elapsed_ms = elapsed.as_millis(),
            timeout_ms = self.config.pong_timeout.as_millis(),
            "Heartbeat timeout detected"
        );
        let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
        Err(())
    }

    async fn check_and_ping(&self) -> Result<(), ()> {
        self.check_timeout().await?;

        if self.state.is_waiting_for_pong() {
            // Previous ping still inside its window.
            return Ok(());
        }

        self.state.mark_ping_sent();
        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Event channel closed, stopping heartbeat");
            return Err(());
        }

        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn state_tracks_outstanding_ping() {
        let state = HeartbeatState::new();
        assert!(!state.is_waiting_for_pong());
        assert!(state.time_since_ping().is_none());

        state.mark_ping_sent();
        assert!(state.is_waiting_for_pong());

        let rtt = state.record_pong();
        assert!(rtt.is_some());
        assert!(!state.is_waiting_for_pong());
        assert_eq!(state.last_rtt(), rtt);
    }

    #[tokio::test]
    async fn state_activity_clears_wait() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        state.record_activity();
        assert!(!state.is_waiting_for_pong());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_sends_ping_after_interval() {
        let config = HeartbeatConfig::new(Duration::from_millis(50), Duration::from_secs(1));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, state, event_tx, cancel.clone()).run(),
        );

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");
        assert_eq!(event, HeartbeatEvent::SendPing);

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test(start_paused = true)]
    async fn manager_detects_timeout_within_window() {
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel).run(),
        );

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert!(state.is_waiting_for_pong());
        let sent = Instant::now();

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Timeout));
        let waited = sent.elapsed();
        assert!(waited >= Duration::from_secs(10));
        assert!(waited < Duration::from_secs(30), "timeout must not wait for next tick");

        handle.await.expect("manager exits after timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn manager_keeps_running_when_peer_answers() {
        let config = HeartbeatConfig::new(Duration::from_millis(100), Duration::from_millis(50));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        tokio::spawn(HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run());

        for _ in 0..3 {
            assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendPing));
            assert!(state.record_pong().is_some());
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn manager_cancellation() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(HeartbeatManager::new(config, state, event_tx, cancel.clone()).run());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
