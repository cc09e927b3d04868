//! Subscription Registry
//!
//! Tracks which topics each connected peer wants and fans published
//! updates out only to interested peers.
//!
//! # Design
//!
//! The registry keeps two indexes:
//! - peer → `Subscription` (the topics that peer holds)
//! - topic → set of peer ids (the routing index)
//!
//! Both are sharded maps, so unrelated topics never contend on one lock.
//! The first subscriber to a topic starts its upstream feed and the last
//! one to leave stops it. Feed start/stop happens while the topic's index
//! entry is locked, so a topic has an active feed exactly when it has at
//! least one subscriber.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::domain::event::Event;

// =============================================================================
// Types
// =============================================================================

/// Identifier of a connected peer session.
pub type PeerId = String;

/// A logical topic name (e.g. one instrument's price feed).
pub type Topic = String;

/// Starts and stops upstream feeds as topic demand changes.
///
/// Called while the registry holds the topic's index entry, so
/// implementations must not call back into the registry.
pub trait FeedController: Send + Sync {
    /// Begin streaming a topic that gained its first subscriber.
    fn start_feed(&self, topic: &str);

    /// Stop streaming a topic that lost its last subscriber.
    fn stop_feed(&self, topic: &str);
}

/// Feed controller that does nothing, for registries without upstream feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFeeds;

impl FeedController for NoFeeds {
    fn start_feed(&self, _topic: &str) {}

    fn stop_feed(&self, _topic: &str) {}
}

/// The topics one peer holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Peer holding the subscription.
    pub peer_id: PeerId,
    /// Subscribed topics.
    pub topics: HashSet<Topic>,
    /// When the peer first subscribed.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            topics: HashSet::new(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to upstream feeds caused by one registry call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Topics whose feed was started.
    pub started: HashSet<Topic>,
    /// Topics whose feed was stopped.
    pub stopped: HashSet<Topic>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Number of peers holding at least one topic.
    pub peers: usize,
    /// Number of topics with at least one subscriber.
    pub topics: usize,
    /// Sum of topics held across all peers.
    pub subscriptions: usize,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of peer subscriptions.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_sync::domain::subscription::{NoFeeds, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new(Arc::new(NoFeeds));
///
/// // Peer 1 subscribes to AAPL - feed starts
/// let changes = registry.subscribe("peer-1", ["AAPL"]);
/// assert!(changes.started.contains("AAPL"));
///
/// // Peer 2 also subscribes - no feed change
/// let changes = registry.subscribe("peer-2", ["AAPL"]);
/// assert!(changes.is_empty());
///
/// // Peer 1 leaves - still held by peer 2
/// let changes = registry.unsubscribe("peer-1", ["AAPL"]);
/// assert!(changes.is_empty());
///
/// // Peer 2 leaves - feed stops
/// let changes = registry.unsubscribe("peer-2", ["AAPL"]);
/// assert!(changes.stopped.contains("AAPL"));
/// ```
pub struct SubscriptionRegistry {
    peers: DashMap<PeerId, Subscription>,
    topic_index: DashMap<Topic, HashSet<PeerId>>,
    feeds: Arc<dyn FeedController>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("peers", &self.peers.len())
            .field("topics", &self.topic_index.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry that drives the given feed controller.
    #[must_use]
    pub fn new(feeds: Arc<dyn FeedController>) -> Self {
        Self {
            peers: DashMap::new(),
            topic_index: DashMap::new(),
            feeds,
        }
    }

    /// Subscribe a peer to topics.
    ///
    /// Topics the peer already holds are skipped.
    pub fn subscribe<I, T>(&self, peer_id: &str, topics: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let mut changes = SubscriptionChanges::default();
        let mut peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Subscription::new(peer_id.to_string()));

        for topic in topics {
            let topic = topic.into();
            if !peer.topics.insert(topic.clone()) {
                continue;
            }

            let mut subscribers = self.topic_index.entry(topic.clone()).or_default();
            subscribers.insert(peer_id.to_string());

            // First subscriber - start the upstream feed
            if subscribers.len() == 1 {
                self.feeds.start_feed(&topic);
                tracing::debug!(topic = %topic, peer_id, "Feed started");
                changes.started.insert(topic);
            }
        }

        let now_empty = peer.topics.is_empty();
        drop(peer);
        if now_empty {
            self.peers.remove_if(peer_id, |_, sub| sub.topics.is_empty());
        }

        changes
    }

    /// Unsubscribe a peer from topics.
    ///
    /// Unknown peers and topics the peer never held are ignored.
    pub fn unsubscribe<I, T>(&self, peer_id: &str, topics: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut changes = SubscriptionChanges::default();
        let Entry::Occupied(mut peer) = self.peers.entry(peer_id.to_string()) else {
            return changes;
        };

        for topic in topics {
            let topic = topic.as_ref();
            if !peer.get_mut().topics.remove(topic) {
                continue;
            }
            if self.release_topic(peer_id, topic) {
                changes.stopped.insert(topic.to_string());
            }
        }

        // Clean up empty peer entry
        if peer.get().topics.is_empty() {
            peer.remove();
        }

        changes
    }

    /// Remove a peer and all its subscriptions.
    pub fn remove_peer(&self, peer_id: &str) -> SubscriptionChanges {
        let mut changes = SubscriptionChanges::default();
        let Entry::Occupied(peer) = self.peers.entry(peer_id.to_string()) else {
            return changes;
        };

        for topic in &peer.get().topics {
            if self.release_topic(peer_id, topic) {
                changes.stopped.insert(topic.clone());
            }
        }
        peer.remove();

        changes
    }

    /// Drop `peer_id` from a topic's index entry.
    ///
    /// Returns `true` if this was the last subscriber and the feed stopped.
    fn release_topic(&self, peer_id: &str, topic: &str) -> bool {
        let Entry::Occupied(mut subscribers) = self.topic_index.entry(topic.to_string()) else {
            return false;
        };

        subscribers.get_mut().remove(peer_id);
        if !subscribers.get().is_empty() {
            return false;
        }

        // Last subscriber removed - stop the upstream feed
        self.feeds.stop_feed(topic);
        subscribers.remove();
        tracing::debug!(topic, peer_id, "Feed stopped");
        true
    }

    /// Peers interested in an event, keyed by its logical topic.
    #[must_use]
    pub fn route_event(&self, event: &Event) -> HashSet<PeerId> {
        self.subscribers(event.logical_topic())
    }

    /// Peers subscribed to a topic.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> HashSet<PeerId> {
        self.topic_index
            .get(topic)
            .map(|peers| peers.clone())
            .unwrap_or_default()
    }

    /// Get the subscription a peer holds.
    #[must_use]
    pub fn subscription(&self, peer_id: &str) -> Option<Subscription> {
        self.peers.get(peer_id).map(|sub| sub.clone())
    }

    /// Topics with at least one subscriber.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.topic_index.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether a topic has at least one subscriber.
    #[must_use]
    pub fn is_active(&self, topic: &str) -> bool {
        self.topic_index.contains_key(topic)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            peers: self.peers.len(),
            topics: self.topic_index.len(),
            subscriptions: self.peers.iter().map(|p| p.topics.len()).sum(),
        }
    }
}
