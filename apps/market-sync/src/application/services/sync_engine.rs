//! Sync Engine
//!
//! The outbound surface of the sync core. Owns every component and wires
//! them together:
//!
//! ```text
//! upstream ─► StreamingAdapter ─► EventBus ─► fan-out ─► SubscriptionRegistry ─► PeerSink(s)
//!                                    ▲
//! peer ─► Connection ─► inbound pump ┴─► TransportWriter ─► OfflineQueue (late replies)
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Dialer, DurableStore, FeedController, NoFeeds, PeerSink, RemoteWriteError, RemoteWriter,
    TransportError, UpstreamProvider, WriteOutcome,
};
use crate::domain::conflict::{
    ConflictError, ConflictPolicy, ConflictResolver, MergeRules, Resolution,
};
use crate::domain::connection::ConnectionState;
use crate::domain::event::{Event, WILDCARD_TOPIC, is_reserved_topic};
use crate::domain::mutation::{MutationId, QueueStats};
use crate::domain::subscription::{
    PeerId, RegistryStats, SubscriptionChanges, SubscriptionRegistry, Topic,
};
use crate::infrastructure::bus::{
    BusConfig, BusSubscription, EventBus, EventFilter, EventHandler, HandlerError, handler_fn,
};
use crate::infrastructure::metrics;
use crate::infrastructure::monitor::{
    Alert, AlertRegistration, LinkHealth, MetricsSnapshot, Monitor, MonitorConfig,
};
use crate::infrastructure::offline::{
    DrainReport, InMemoryStore, OfflineQueue, QueueConfig, QueueError,
};
use crate::infrastructure::streaming::{StreamingAdapter, StreamingConfig};
use crate::infrastructure::transport::{
    Connection, ConnectionConfig, Frame, TransportWriter, frame_type,
};

const FAN_OUT_SUBSCRIBER: &str = "fan-out";
const PEER_EVENT_SOURCE: &str = "peer";

// =============================================================================
// Errors
// =============================================================================

/// Sync engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine was built outside a Tokio runtime.
    #[error("sync engine requires a running Tokio runtime")]
    NoRuntime,

    /// Neither a remote writer nor a dialer was configured.
    #[error("no remote writer configured: set a dialer or a remote writer")]
    NoRemoteWriter,

    /// The engine has no transport connection.
    #[error("no transport configured")]
    NoTransport,

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Offline queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Conflict resolution failure.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`SyncEngine`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use market_sync::application::services::SyncEngine;
/// use market_sync::infrastructure::transport::WebSocketDialer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = SyncEngine::builder()
///     .dialer(Arc::new(WebSocketDialer::new("ws://localhost:9000/sync")))
///     .build()
///     .await?;
/// engine.connect().await?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct SyncEngineBuilder {
    bus: BusConfig,
    streaming: StreamingConfig,
    queue: QueueConfig,
    monitor: MonitorConfig,
    connection: ConnectionConfig,
    policy: ConflictPolicy,
    rules: MergeRules,
    provider: Option<Arc<dyn UpstreamProvider>>,
    dialer: Option<Arc<dyn Dialer>>,
    store: Option<Arc<dyn DurableStore>>,
    writer: Option<Arc<dyn RemoteWriter>>,
    cancel: CancellationToken,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            streaming: StreamingConfig::default(),
            queue: QueueConfig::default(),
            monitor: MonitorConfig::default(),
            connection: ConnectionConfig::default(),
            policy: ConflictPolicy::default(),
            rules: MergeRules::default(),
            provider: None,
            dialer: None,
            store: None,
            writer: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl SyncEngineBuilder {
    /// Apply every section of a loaded configuration.
    pub fn config(mut self, config: &crate::SyncConfig) -> Self {
        self.bus = BusConfig::from(&config.bus);
        self.streaming = StreamingConfig::from(&config.streaming);
        self.queue = QueueConfig::from(&config.queue);
        self.monitor = MonitorConfig::from(&config.monitor);
        self.connection = ConnectionConfig::from_transport_settings(&config.transport);
        self.policy = config.queue.conflict_policy.clone();
        self
    }

    /// Event bus configuration.
    pub fn bus_config(mut self, config: BusConfig) -> Self {
        self.bus = config;
        self
    }

    /// Streaming adapter configuration.
    pub fn streaming_config(mut self, config: StreamingConfig) -> Self {
        self.streaming = config;
        self
    }

    /// Offline queue configuration.
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Monitor configuration.
    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    /// Transport connection configuration.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Conflict strategy per mutation type.
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Field rules for `merge` and `last_write_wins`.
    pub fn merge_rules(mut self, rules: MergeRules) -> Self {
        self.rules = rules;
        self
    }

    /// Upstream data provider. Without one, subscriptions start no feeds.
    pub fn upstream(mut self, provider: Arc<dyn UpstreamProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Dialer for the peer transport.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Durable store for the offline queue. Defaults to memory.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Remote writer for queued mutations. Defaults to writing over the
    /// transport.
    pub fn remote_writer(mut self, writer: Arc<dyn RemoteWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Token whose cancellation stops every background task.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the engine, restore persisted mutations and start its tasks.
    ///
    /// # Errors
    ///
    /// Returns an error outside a Tokio runtime, without any way to write
    /// mutations, or if persisted mutations cannot be read.
    pub async fn build(self) -> Result<Arc<SyncEngine>, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let cancel = self.cancel;

        let bus = EventBus::spawn(self.bus, cancel.child_token());

        let streaming = self.provider.map(|provider| {
            Arc::new(StreamingAdapter::new(
                provider,
                Arc::clone(&bus),
                self.streaming,
                runtime.clone(),
            ))
        });
        let feeds: Arc<dyn FeedController> = match &streaming {
            Some(adapter) => Arc::clone(adapter) as Arc<dyn FeedController>,
            None => Arc::new(NoFeeds),
        };
        let registry = Arc::new(SubscriptionRegistry::new(feeds));

        let (connection, inbound) = match self.dialer {
            Some(dialer) => {
                let (connection, inbound) =
                    Connection::new(dialer, self.connection, Some(Arc::clone(&bus)));
                (Some(connection), Some(inbound))
            }
            None => (None, None),
        };
        let transport_writer = connection
            .as_ref()
            .map(|c| Arc::new(TransportWriter::new(Arc::clone(c), self.queue.write_deadline)));

        let writer: Arc<dyn RemoteWriter> = match (self.writer, &transport_writer) {
            (Some(writer), _) => writer,
            (None, Some(transport)) => Arc::clone(transport) as Arc<dyn RemoteWriter>,
            (None, None) => return Err(EngineError::NoRemoteWriter),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn DurableStore>);

        let queue = Arc::new(OfflineQueue::new(
            store,
            writer,
            ConflictResolver::new(self.rules.clone()),
            self.policy,
            Arc::clone(&bus),
            self.queue,
        ));
        queue.restore().await?;

        let monitor = Arc::new(Monitor::new(Arc::clone(&bus), self.monitor));
        if let Some(connection) = &connection {
            monitor.track(Arc::clone(connection) as Arc<dyn LinkHealth>);
            queue.set_online(connection.state() == ConnectionState::Connected);
        }

        let peers: Arc<DashMap<PeerId, Arc<dyn PeerSink>>> = Arc::new(DashMap::new());
        let fan_out = bus.subscribe(
            FAN_OUT_SUBSCRIBER,
            [WILDCARD_TOPIC],
            fan_out_handler(Arc::clone(&registry), Arc::clone(&peers)),
            Some(Arc::new(Event::is_update) as EventFilter),
        );

        let engine = Arc::new(SyncEngine {
            bus,
            registry,
            streaming,
            queue,
            resolver: ConflictResolver::new(self.rules),
            monitor,
            connection,
            transport_writer,
            peers,
            fan_out,
            runtime,
            cancel,
        });
        engine.start(inbound);

        tracing::info!(
            transport = engine.connection.is_some(),
            upstream = engine.streaming.is_some(),
            "Sync engine started"
        );
        Ok(engine)
    }
}

fn fan_out_handler(
    registry: Arc<SubscriptionRegistry>,
    peers: Arc<DashMap<PeerId, Arc<dyn PeerSink>>>,
) -> Arc<dyn EventHandler> {
    handler_fn(move |event: Event| {
        let registry = Arc::clone(&registry);
        let peers = Arc::clone(&peers);
        async move {
            let mut failed = 0_usize;
            for peer_id in registry.route_event(&event) {
                let Some(sink) = peers.get(&peer_id).map(|s| Arc::clone(s.value())) else {
                    continue;
                };
                if let Err(e) = sink.deliver(&event) {
                    failed += 1;
                    tracing::warn!(peer_id = %peer_id, topic = %event.topic, error = %e, "Delivery failed");
                }
            }
            if failed == 0 {
                Ok(())
            } else {
                Err(HandlerError::new(format!(
                    "{failed} deliveries failed for {}",
                    event.topic
                )))
            }
        }
    })
}

// =============================================================================
// Engine
// =============================================================================

/// The sync core.
pub struct SyncEngine {
    bus: Arc<EventBus>,
    registry: Arc<SubscriptionRegistry>,
    streaming: Option<Arc<StreamingAdapter>>,
    queue: Arc<OfflineQueue>,
    resolver: ConflictResolver,
    monitor: Arc<Monitor>,
    connection: Option<Arc<Connection>>,
    transport_writer: Option<Arc<TransportWriter>>,
    peers: Arc<DashMap<PeerId, Arc<dyn PeerSink>>>,
    fan_out: BusSubscription,
    runtime: Handle,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("connection_state", &self.connection_state())
            .field("peers", &self.peers.len())
            .field("queue", &self.queue_stats())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Start assembling an engine.
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    fn start(self: &Arc<Self>, inbound: Option<mpsc::UnboundedReceiver<Frame>>) {
        self.runtime
            .spawn(Arc::clone(&self.monitor).run(self.cancel.child_token()));

        if let Some(connection) = &self.connection {
            self.runtime.spawn(
                Arc::clone(&self.queue)
                    .watch_connectivity(connection.watch_state(), self.cancel.child_token()),
            );
        }

        if let Some(inbound) = inbound {
            self.runtime.spawn(pump_inbound(
                inbound,
                Arc::clone(&self.bus),
                Arc::clone(&self.queue),
                self.transport_writer.clone(),
                self.cancel.child_token(),
            ));
        }
    }

    // =========================================================================
    // Peers and Subscriptions
    // =========================================================================

    /// Register the sink that receives a peer's routed events.
    pub fn attach_peer(&self, peer_id: impl Into<PeerId>, sink: Arc<dyn PeerSink>) {
        let peer_id = peer_id.into();
        tracing::info!(peer_id = %peer_id, "Peer attached");
        self.peers.insert(peer_id, sink);
    }

    /// Remove a peer and every subscription it holds.
    pub fn detach_peer(&self, peer_id: &str) -> SubscriptionChanges {
        self.peers.remove(peer_id);
        let changes = self.registry.remove_peer(peer_id);
        self.announce(&changes);
        tracing::info!(peer_id, stopped = changes.stopped.len(), "Peer detached");
        changes
    }

    /// Subscribe a peer to topics, starting feeds for newly demanded topics.
    pub fn subscribe<I, T>(&self, peer_id: &str, topics: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let changes = self.registry.subscribe(peer_id, topics);
        self.announce(&changes);
        changes
    }

    /// Unsubscribe a peer. Topics it never held are ignored.
    pub fn unsubscribe<I, T>(&self, peer_id: &str, topics: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let changes = self.registry.unsubscribe(peer_id, topics);
        self.announce(&changes);
        changes
    }

    /// Tell the remote peer which topics gained or lost local demand.
    fn announce(&self, changes: &SubscriptionChanges) {
        let Some(connection) = &self.connection else {
            return;
        };
        if !changes.started.is_empty() {
            let mut topics: Vec<String> = changes.started.iter().cloned().collect();
            topics.sort();
            connection.send(Frame::subscribe(&topics));
        }
        if !changes.stopped.is_empty() {
            let mut topics: Vec<String> = changes.stopped.iter().cloned().collect();
            topics.sort();
            connection.send(Frame::unsubscribe(&topics));
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Publish an event on the bus.
    pub fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Observe bus events directly, e.g. `connection.state` or `sync.error`.
    pub fn on_event<I, T>(
        &self,
        subscriber_id: &str,
        topics: I,
        handler: Arc<dyn EventHandler>,
    ) -> BusSubscription
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.bus.subscribe(subscriber_id, topics, handler, None)
    }

    /// Stop observing.
    pub fn off_event(&self, token: BusSubscription) -> bool {
        token != self.fan_out && self.bus.unsubscribe(token)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queue a mutation and, when online, start syncing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation cannot be persisted.
    pub async fn enqueue_mutation(
        &self,
        payload: Value,
        mutation_type: &str,
    ) -> Result<MutationId, EngineError> {
        let id = self.queue.enqueue(payload, mutation_type).await?;
        self.drain_if_online();
        Ok(id)
    }

    fn drain_if_online(&self) {
        if !self.queue.is_online() {
            return;
        }
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.child_token();
        self.runtime.spawn(async move {
            queue.drain_queue_until(&cancel).await;
        });
    }

    /// Drain the offline queue now.
    pub async fn drain(&self) -> DrainReport {
        self.queue.drain_queue_until(&self.cancel).await
    }

    /// Return a failed mutation to pending and, when online, sync it.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation is unknown or not failed.
    pub async fn retry_mutation(&self, id: &str) -> Result<(), EngineError> {
        self.queue.retry(id).await?;
        self.drain_if_online();
        Ok(())
    }

    /// Resolve two values with a strategy given by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy name is not recognised.
    pub fn resolve(
        &self,
        local: &Value,
        server: &Value,
        strategy: &str,
    ) -> Result<Resolution, EngineError> {
        Ok(self.resolver.resolve_named(local, server, strategy)?)
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Connect the peer transport.
    ///
    /// # Errors
    ///
    /// Returns an error without a transport or if the connection settles
    /// disconnected.
    pub async fn connect(&self) -> Result<(), EngineError> {
        let connection = self.connection.as_ref().ok_or(EngineError::NoTransport)?;
        connection.connect().await?;
        Ok(())
    }

    /// Close the peer transport cleanly.
    pub async fn disconnect(&self) {
        if let Some(connection) = &self.connection {
            connection.disconnect().await;
        }
    }

    /// Stop every background task, feed and timer.
    pub async fn shutdown(&self) {
        tracing::info!("Sync engine shutting down");
        self.disconnect().await;
        if let Some(streaming) = &self.streaming {
            streaming.shutdown();
        }
        self.queue.shutdown();
        self.cancel.cancel();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Transport state; `disconnected` without a transport.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state())
    }

    /// Watch transport state changes.
    #[must_use]
    pub fn watch_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.connection.as_ref().map(|c| c.watch_state())
    }

    /// Offline queue depth by status.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Metrics since the last monitor sample.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.monitor.current()
    }

    /// Register a threshold alert callback.
    pub fn on_alert<F>(&self, callback: F) -> AlertRegistration
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.monitor.on_alert(callback)
    }

    /// Topics with a running upstream feed.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<Topic> {
        self.streaming
            .as_ref()
            .map(|s| s.active_feeds())
            .unwrap_or_default()
    }

    /// Subscription statistics.
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Whether a transport is configured.
    #[must_use]
    pub const fn has_transport(&self) -> bool {
        self.connection.is_some()
    }

    /// The event bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The offline queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// The monitor.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// The transport connection, if configured.
    #[must_use]
    pub const fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }
}

// =============================================================================
// Inbound Pump
// =============================================================================

async fn pump_inbound(
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    bus: Arc<EventBus>,
    queue: Arc<OfflineQueue>,
    writer: Option<Arc<TransportWriter>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if TransportWriter::is_reply(&frame) {
            let Some(writer) = &writer else {
                continue;
            };
            if let Some(late) = writer.handle_reply(&frame) {
                match late.outcome {
                    Ok(WriteOutcome::Applied) => {
                        queue.mark_synced(&late.mutation_id).await;
                    }
                    Err(RemoteWriteError::Rejected(reason)) => {
                        queue.mark_failed(&late.mutation_id, &reason).await;
                    }
                    Ok(WriteOutcome::Conflict { .. }) | Err(_) => {
                        tracing::debug!(
                            mutation_id = %late.mutation_id,
                            "Late reply left for the next drain"
                        );
                    }
                }
            }
            continue;
        }

        if matches!(
            frame.frame_type.as_str(),
            frame_type::SUBSCRIBE | frame_type::UNSUBSCRIBE
        ) {
            tracing::debug!(frame_type = %frame.frame_type, "Ignoring peer subscription frame");
            continue;
        }

        let event = frame.into_event(PEER_EVENT_SOURCE);
        if is_reserved_topic(&event.topic) {
            metrics::record_reserved_frame();
            tracing::warn!(
                topic = %event.topic,
                event_id = %event.id,
                "Dropping peer event on reserved topic"
            );
            continue;
        }
        bus.publish(event);
    }

    tracing::debug!("Inbound pump stopped");
}

// =============================================================================
// Tests
// =============================================================================
