//! Offline Mutation Queue
//!
//! Persists state-changing operations and replays them when connectivity
//! returns.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue -> pending -> syncing -> (removed)             write applied
//!                          |
//!                          +-> pending (backoff)          transient failure
//!                          +-> failed                     retries exhausted / manual conflict
//!                          +-> syncing (left as is)       drain cancelled mid-write
//! ```
//!
//! Drains are serialized. Each drain first returns entries left `syncing`
//! by an earlier cancelled drain to `pending`, then claims due entries in
//! batches and writes each batch concurrently. Every status change is
//! written to the durable store before it is acted on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    DurableStore, RemoteWriteError, RemoteWriter, StoreError, WriteOutcome,
};
use crate::domain::conflict::{
    ConflictDescriptor, ConflictPolicy, ConflictResolver, Resolution, ResolutionStrategy,
};
use crate::domain::connection::ConnectionState;
use crate::domain::event::{
    Event, Priority, SYNC_CONFLICT_TOPIC, SYNC_ERROR_TOPIC, SYNC_SUCCESS_TOPIC,
};
use crate::domain::mutation::{MutationId, QueueStats, QueuedMutation, SyncStatus};
use crate::infrastructure::bus::EventBus;
use crate::infrastructure::metrics::{self, SyncOutcome};

const EVENT_SOURCE: &str = "offline-queue";
const INDEX_KEY: &str = "mutations/index";
const RECORD_PREFIX: &str = "mutations/";

// =============================================================================
// Configuration
// =============================================================================

/// Offline queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Entries written concurrently per batch.
    pub batch_size: usize,
    /// Base retry delay; attempt `n` waits `retry_base × 2^n`.
    pub retry_base: Duration,
    /// Retries after the first attempt before an entry is left `failed`.
    pub max_retries: u32,
    /// Deadline for one remote write.
    pub write_deadline: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            retry_base: Duration::from_secs(1),
            max_retries: 5,
            write_deadline: Duration::from_secs(10),
        }
    }
}

impl From<&crate::QueueSettings> for QueueConfig {
    fn from(settings: &crate::QueueSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            retry_base: settings.retry_base,
            max_retries: settings.max_retries,
            write_deadline: settings.write_deadline,
        }
    }
}

impl QueueConfig {
    /// Backoff before the next attempt after `retry_count` failures.
    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2_u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor)
    }
}

// =============================================================================
// Errors and Reports
// =============================================================================

/// Offline queue errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The durable store failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// No entry with this id.
    #[error("mutation not found: {0}")]
    NotFound(MutationId),

    /// The entry is not in a retryable state.
    #[error("mutation {id} is {status}, only failed mutations can be retried")]
    NotRetryable {
        /// Mutation id.
        id: MutationId,
        /// Current status.
        status: &'static str,
    },
}

/// What one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries written and removed.
    pub synced: usize,
    /// Entries scheduled for another attempt.
    pub retried: usize,
    /// Entries left `failed`.
    pub failed: usize,
    /// Conflicts resolved automatically.
    pub resolved: usize,
    /// Writes abandoned by cancellation, left `syncing`.
    pub abandoned: usize,
    /// Entries reclaimed from an earlier cancelled drain.
    pub reclaimed: usize,
}

impl DrainReport {
    fn absorb(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Synced => self.synced += 1,
            SyncOutcome::Retried => self.retried += 1,
            SyncOutcome::Failed | SyncOutcome::Manual => self.failed += 1,
            SyncOutcome::Resolved => self.resolved += 1,
            SyncOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// The offline mutation queue.
pub struct OfflineQueue {
    entries: Mutex<Vec<QueuedMutation>>,
    store: Arc<dyn DurableStore>,
    writer: Arc<dyn RemoteWriter>,
    resolver: ConflictResolver,
    policy: ConflictPolicy,
    bus: Arc<EventBus>,
    config: QueueConfig,
    online: watch::Sender<bool>,
    drain_lock: tokio::sync::Mutex<()>,
    index_lock: tokio::sync::Mutex<()>,
    next_wakeup: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Create an empty queue.
    ///
    /// Call [`OfflineQueue::restore`] to load entries persisted by an
    /// earlier process.
    #[must_use]
    pub fn new(
        store: Arc<dyn DurableStore>,
        writer: Arc<dyn RemoteWriter>,
        resolver: ConflictResolver,
        policy: ConflictPolicy,
        bus: Arc<EventBus>,
        config: QueueConfig,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            store,
            writer,
            resolver,
            policy,
            bus,
            config,
            online: watch::Sender::new(true),
            drain_lock: tokio::sync::Mutex::new(()),
            index_lock: tokio::sync::Mutex::new(()),
            next_wakeup: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Queue a mutation. Returns once the entry is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted; nothing is queued.
    pub async fn enqueue(
        &self,
        payload: Value,
        mutation_type: impl Into<String>,
    ) -> Result<MutationId, QueueError> {
        let mutation = QueuedMutation::new(mutation_type, payload);
        let id = mutation.id.clone();

        self.entries.lock().push(mutation.clone());

        let persisted = match self.persist(&mutation).await {
            Ok(()) => self.persist_index().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.entries.lock().retain(|m| m.id != id);
            let _ = self.store.delete(&record_key(&id)).await;
            tracing::error!(mutation_id = %id, error = %e, "Failed to persist mutation");
            return Err(e.into());
        }

        tracing::debug!(mutation_id = %id, mutation_type = %mutation.mutation_type, "Mutation queued");
        self.publish_depth();
        Ok(id)
    }

    /// Remove an entry the server has applied.
    ///
    /// Returns `false` if the entry is not queued (already removed).
    pub async fn mark_synced(&self, id: &str) -> bool {
        let Some(mutation) = self.take(id) else {
            return false;
        };

        self.forget(id).await;
        metrics::record_sync_outcome(SyncOutcome::Synced);
        tracing::info!(mutation_id = %id, "Mutation synced");
        self.bus.publish(Event::new(
            SYNC_SUCCESS_TOPIC,
            EVENT_SOURCE,
            json!({
                "mutationId": mutation.id,
                "type": mutation.mutation_type,
            }),
        ));
        self.publish_depth();
        true
    }

    /// Mark an entry failed; it stays queued until retried.
    ///
    /// Returns `false` if the entry is not queued.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> bool {
        let updated = self.update(id, |m| {
            m.sync_status = SyncStatus::Failed;
            m.next_attempt_at = None;
            m.last_error = Some(reason.to_string());
        });
        let Some(mutation) = updated else {
            return false;
        };

        self.persist_logged(&mutation).await;
        metrics::record_sync_outcome(SyncOutcome::Failed);
        self.publish_failure(&mutation, reason);
        self.publish_depth();
        true
    }

    /// Return a failed entry to `pending` with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is unknown or not failed.
    pub async fn retry(&self, id: &str) -> Result<(), QueueError> {
        let mut status = None;
        let updated = self.update(id, |m| {
            status = Some(m.sync_status);
            if m.sync_status == SyncStatus::Failed {
                m.sync_status = SyncStatus::Pending;
                m.retry_count = 0;
                m.next_attempt_at = None;
                m.last_error = None;
            }
        });

        match (updated, status) {
            (Some(mutation), Some(SyncStatus::Failed)) => {
                self.persist(&mutation).await?;
                tracing::info!(mutation_id = %id, "Mutation queued for retry");
                self.publish_depth();
                Ok(())
            }
            (Some(_), Some(status)) => Err(QueueError::NotRetryable {
                id: id.to_string(),
                status: status.as_str(),
            }),
            _ => Err(QueueError::NotFound(id.to_string())),
        }
    }

    /// Retry every failed entry. Returns how many were reset.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; earlier entries stay reset.
    pub async fn retry_failed(&self) -> Result<usize, QueueError> {
        let failed: Vec<MutationId> = self
            .entries
            .lock()
            .iter()
            .filter(|m| m.sync_status == SyncStatus::Failed)
            .map(|m| m.id.clone())
            .collect();

        for id in &failed {
            self.retry(id).await?;
        }
        Ok(failed.len())
    }

    /// Counts by status.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.entries.lock().iter().collect()
    }

    /// Snapshot of one entry.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueuedMutation> {
        self.entries.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Snapshot of all entries in queue order.
    #[must_use]
    pub fn entries(&self) -> Vec<QueuedMutation> {
        self.entries.lock().clone()
    }

    /// Whether the queue considers the remote reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Set reachability. Returns `true` on an offline to online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.send_replace(online);
        !previous && online
    }

    /// Stop scheduled retries.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Load entries persisted by an earlier process.
    ///
    /// Entries that were `syncing` when the process stopped have an unknown
    /// result and return to `pending`. Returns the number of entries loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let Some(index) = self.store.get(INDEX_KEY).await? else {
            return Ok(0);
        };
        let ids: Vec<MutationId> =
            serde_json::from_slice(&index).map_err(|e| StoreError::Corrupt {
                key: INDEX_KEY.to_string(),
                message: e.to_string(),
            })?;

        let mut restored = Vec::with_capacity(ids.len());
        for id in ids {
            let key = record_key(&id);
            let Some(bytes) = self.store.get(&key).await? else {
                tracing::warn!(mutation_id = %id, "Indexed mutation missing from store");
                continue;
            };
            match serde_json::from_slice::<QueuedMutation>(&bytes) {
                Ok(mut mutation) => {
                    if mutation.sync_status == SyncStatus::Syncing {
                        mutation.sync_status = SyncStatus::Pending;
                    }
                    if mutation.sync_status != SyncStatus::Synced {
                        restored.push(mutation);
                    }
                }
                Err(e) => {
                    tracing::warn!(mutation_id = %id, error = %e, "Skipping corrupt mutation record");
                }
            }
        }

        let count = restored.len();
        {
            let mut entries = self.entries.lock();
            for mutation in restored {
                if !entries.iter().any(|m| m.id == mutation.id) {
                    entries.push(mutation);
                }
            }
        }

        tracing::info!(count, "Restored offline mutations");
        self.publish_depth();
        Ok(count)
    }

    // =========================================================================
    // Drain
    // =========================================================================

    /// Write every due entry to the server.
    pub async fn drain_queue(self: &Arc<Self>) -> DrainReport {
        self.drain_queue_until(&CancellationToken::new()).await
    }

    /// Write every due entry, stopping cooperatively when `cancel` fires.
    ///
    /// Writes in flight at cancellation are abandoned and their entries are
    /// left `syncing` for the next drain.
    pub async fn drain_queue_until(self: &Arc<Self>, cancel: &CancellationToken) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport {
            reclaimed: self.reclaim_stale(),
            ..DrainReport::default()
        };

        while !cancel.is_cancelled() {
            let batch = self.claim_batch();
            if batch.is_empty() {
                break;
            }

            tracing::debug!(size = batch.len(), "Draining mutation batch");
            for mutation in &batch {
                self.persist_logged(mutation).await;
            }

            let outcomes = join_all(batch.into_iter().map(|m| self.sync_one(m, cancel))).await;
            for outcome in outcomes {
                report.absorb(outcome);
            }
        }

        if report != DrainReport::default() {
            tracing::info!(
                synced = report.synced,
                retried = report.retried,
                failed = report.failed,
                resolved = report.resolved,
                abandoned = report.abandoned,
                "Drain finished"
            );
        }
        if !cancel.is_cancelled() {
            self.schedule_next_due();
        }
        self.publish_depth();
        report
    }

    /// Drain whenever `state` moves from offline to `connected`.
    pub async fn watch_connectivity(
        self: Arc<Self>,
        mut state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let initial = *state.borrow_and_update() == ConnectionState::Connected;
        self.set_online(initial);
        if initial {
            self.drain_queue_until(&cancel).await;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            if self.set_online(connected) {
                tracing::info!("Connectivity restored, draining offline queue");
                self.drain_queue_until(&cancel).await;
            }
        }
    }

    /// Return `syncing` entries to `pending`.
    ///
    /// Only called while holding the drain lock, so no write of this queue
    /// is in flight.
    fn reclaim_stale(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut reclaimed = 0;
        for m in entries.iter_mut().filter(|m| m.sync_status == SyncStatus::Syncing) {
            m.sync_status = SyncStatus::Pending;
            m.next_attempt_at = None;
            reclaimed += 1;
        }
        reclaimed
    }

    fn claim_batch(&self) -> Vec<QueuedMutation> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|m| m.is_due(now))
            .take(self.config.batch_size)
            .map(|m| {
                m.sync_status = SyncStatus::Syncing;
                m.last_attempt_at = Some(now);
                m.clone()
            })
            .collect()
    }

    async fn sync_one(&self, mutation: QueuedMutation, cancel: &CancellationToken) -> SyncOutcome {
        let result = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(mutation_id = %mutation.id, "Write abandoned, left syncing");
                metrics::record_sync_outcome(SyncOutcome::Abandoned);
                return SyncOutcome::Abandoned;
            }
            result = tokio::time::timeout(self.config.write_deadline, self.writer.write(&mutation)) => {
                result.unwrap_or(Err(RemoteWriteError::Timeout))
            }
        };

        match result {
            Ok(WriteOutcome::Applied) => {
                // A late ack may already have removed it.
                self.mark_synced(&mutation.id).await;
                SyncOutcome::Synced
            }
            Ok(WriteOutcome::Conflict { server_value }) => {
                self.reconcile(&mutation, &server_value).await
            }
            Err(RemoteWriteError::Rejected(reason)) => {
                self.mark_failed(&mutation.id, &reason).await;
                SyncOutcome::Failed
            }
            Err(error) => self.fail_attempt(&mutation.id, &error.to_string()).await,
        }
    }

    async fn reconcile(&self, mutation: &QueuedMutation, server_value: &Value) -> SyncOutcome {
        let strategy = self.policy.for_type(&mutation.mutation_type);
        let resolution = self.resolver.resolve(&mutation.payload, server_value, strategy);

        match resolution {
            Resolution::Resolved(value) if value == *server_value => {
                tracing::info!(
                    mutation_id = %mutation.id,
                    strategy = %strategy,
                    "Conflict resolved to server value"
                );
                metrics::record_sync_outcome(SyncOutcome::Resolved);
                self.publish_resolution(mutation, server_value, strategy, &value, false);
                self.mark_synced(&mutation.id).await;
                SyncOutcome::Resolved
            }
            Resolution::Resolved(value) => {
                let resolved = value.clone();
                let updated = self.update(&mutation.id, |m| {
                    m.payload = value;
                    m.sync_status = SyncStatus::Pending;
                    m.retry_count += 1;
                    m.next_attempt_at = None;
                    m.last_error = Some(format!("conflict resolved with {strategy}"));
                });
                let Some(updated) = updated else {
                    return SyncOutcome::Resolved;
                };

                if updated.retry_count > self.config.max_retries {
                    self.publish_resolution(mutation, server_value, strategy, &resolved, false);
                    self.mark_failed(&mutation.id, "conflict persisted after resolution")
                        .await;
                    return SyncOutcome::Failed;
                }

                tracing::info!(
                    mutation_id = %mutation.id,
                    strategy = %strategy,
                    "Conflict resolved, resubmitting"
                );
                metrics::record_sync_outcome(SyncOutcome::Resolved);
                self.persist_logged(&updated).await;
                self.publish_resolution(mutation, server_value, strategy, &resolved, true);
                SyncOutcome::Resolved
            }
            Resolution::Manual(marker) => {
                let updated = self.update(&mutation.id, |m| {
                    m.sync_status = SyncStatus::Failed;
                    m.next_attempt_at = None;
                    m.last_error = Some("manual resolution required".to_string());
                });
                if let Some(updated) = updated {
                    self.persist_logged(&updated).await;
                }

                tracing::warn!(mutation_id = %mutation.id, "Conflict requires manual resolution");
                metrics::record_sync_outcome(SyncOutcome::Manual);
                self.bus.publish(
                    Event::new(
                        SYNC_CONFLICT_TOPIC,
                        EVENT_SOURCE,
                        json!({
                            "mutationId": mutation.id,
                            "type": mutation.mutation_type,
                            "strategy": strategy,
                            "resolution": marker,
                        }),
                    )
                    .with_priority(Priority::High),
                );
                SyncOutcome::Manual
            }
        }
    }

    async fn fail_attempt(&self, id: &str, error: &str) -> SyncOutcome {
        let max_retries = self.config.max_retries;
        let now = Utc::now();
        let mut delay = None;

        let updated = self.update(id, |m| {
            m.retry_count += 1;
            m.last_error = Some(error.to_string());
            if m.retry_count > max_retries {
                m.sync_status = SyncStatus::Failed;
                m.next_attempt_at = None;
            } else {
                let backoff = self.config.retry_delay(m.retry_count);
                m.sync_status = SyncStatus::Pending;
                m.next_attempt_at = Some(after(now, backoff));
                delay = Some(backoff);
            }
        });

        let Some(mutation) = updated else {
            return SyncOutcome::Retried;
        };
        self.persist_logged(&mutation).await;

        match delay {
            Some(delay) => {
                tracing::warn!(
                    mutation_id = %id,
                    retry_count = mutation.retry_count,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Mutation write failed, retry scheduled"
                );
                metrics::record_sync_outcome(SyncOutcome::Retried);
                SyncOutcome::Retried
            }
            None => {
                tracing::error!(
                    mutation_id = %id,
                    retry_count = mutation.retry_count,
                    error = %error,
                    "Mutation retries exhausted"
                );
                metrics::record_sync_outcome(SyncOutcome::Failed);
                self.publish_failure(&mutation, error);
                SyncOutcome::Failed
            }
        }
    }

    /// Arm a wake-up for the earliest entry still backing off.
    fn schedule_next_due(self: &Arc<Self>) {
        let now = Utc::now();
        let earliest = self
            .entries
            .lock()
            .iter()
            .filter(|m| m.sync_status == SyncStatus::Pending)
            .filter_map(|m| m.next_attempt_at)
            .filter(|at| *at > now)
            .min();
        let Some(at) = earliest else {
            return;
        };

        {
            let mut next = self.next_wakeup.lock();
            if next.is_some_and(|existing| existing <= at && existing > now) {
                return;
            }
            *next = Some(at);
        }

        let delay = (at - now).to_std().unwrap_or_default();

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = queue.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            *queue.next_wakeup.lock() = None;
            if queue.is_online() {
                let cancel = queue.cancel.child_token();
                queue.drain_queue_until(&cancel).await;
            }
        });
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn update<F>(&self, id: &str, f: F) -> Option<QueuedMutation>
    where
        F: FnOnce(&mut QueuedMutation),
    {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|m| m.id == id)?;
        f(entry);
        Some(entry.clone())
    }

    fn take(&self, id: &str) -> Option<QueuedMutation> {
        let mut entries = self.entries.lock();
        let position = entries.iter().position(|m| m.id == id)?;
        Some(entries.remove(position))
    }

    async fn persist(&self, mutation: &QueuedMutation) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(mutation).map_err(|e| StoreError::Corrupt {
            key: record_key(&mutation.id),
            message: e.to_string(),
        })?;
        self.store.put(&record_key(&mutation.id), bytes).await
    }

    async fn persist_logged(&self, mutation: &QueuedMutation) {
        if let Err(e) = self.persist(mutation).await {
            tracing::error!(mutation_id = %mutation.id, error = %e, "Failed to persist mutation");
        }
    }

    async fn persist_index(&self) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock().await;
        let ids: Vec<MutationId> = self.entries.lock().iter().map(|m| m.id.clone()).collect();
        let bytes = serde_json::to_vec(&ids).map_err(|e| StoreError::Corrupt {
            key: INDEX_KEY.to_string(),
            message: e.to_string(),
        })?;
        self.store.put(INDEX_KEY, bytes).await
    }

    async fn forget(&self, id: &str) {
        if let Err(e) = self.persist_index().await {
            tracing::error!(mutation_id = %id, error = %e, "Failed to update mutation index");
        }
        if let Err(e) = self.store.delete(&record_key(id)).await {
            tracing::error!(mutation_id = %id, error = %e, "Failed to delete mutation record");
        }
    }

    fn publish_failure(&self, mutation: &QueuedMutation, error: &str) {
        self.bus.publish(
            Event::new(
                SYNC_ERROR_TOPIC,
                EVENT_SOURCE,
                json!({
                    "mutationId": mutation.id,
                    "type": mutation.mutation_type,
                    "error": error,
                    "retryCount": mutation.retry_count,
                }),
            )
            .with_priority(Priority::High)
            .with_retry_count(mutation.retry_count),
        );
    }

    fn publish_resolution(
        &self,
        mutation: &QueuedMutation,
        server_value: &Value,
        strategy: ResolutionStrategy,
        resolved: &Value,
        resubmitted: bool,
    ) {
        let descriptor = ConflictDescriptor::diff(&mutation.payload, server_value);
        self.bus.publish(Event::new(
            SYNC_CONFLICT_TOPIC,
            EVENT_SOURCE,
            json!({
                "mutationId": mutation.id,
                "type": mutation.mutation_type,
                "strategy": strategy,
                "conflictingFields": descriptor.conflicting_fields,
                "resolved": resolved,
                "resubmitted": resubmitted,
            }),
        ));
    }

    fn publish_depth(&self) {
        metrics::set_queue_depth(self.stats());
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn record_key(id: &str) -> String {
    format!("{RECORD_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::MockRemoteWriter;
    use crate::infrastructure::bus::{BusConfig, EventBus};
    use crate::infrastructure::offline::store::InMemoryStore;

    fn config() -> QueueConfig {
        QueueConfig {
            batch_size: 10,
            retry_base: Duration::from_millis(10),
            max_retries: 3,
            write_deadline: Duration::from_secs(1),
        }
    }

    fn queue_with(
        writer: Arc<dyn RemoteWriter>,
        store: Arc<dyn DurableStore>,
        policy: ConflictPolicy,
    ) -> Arc<OfflineQueue> {
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        queue_on(bus, writer, store, policy, config())
    }

    fn queue_on(
        bus: Arc<EventBus>,
        writer: Arc<dyn RemoteWriter>,
        store: Arc<dyn DurableStore>,
        policy: ConflictPolicy,
        config: QueueConfig,
    ) -> Arc<OfflineQueue> {
        Arc::new(OfflineQueue::new(
            store,
            writer,
            ConflictResolver::default(),
            policy,
            bus,
            config,
        ))
    }

    fn applying() -> Arc<dyn RemoteWriter> {
        let mut writer = MockRemoteWriter::new();
        writer.expect_write().returning(|_| Ok(WriteOutcome::Applied));
        Arc::new(writer)
    }

    #[test]
    fn retry_delay_doubles() {
        let config = config();
        assert_eq!(config.retry_delay(0), Duration::from_millis(10));
        assert_eq!(config.retry_delay(1), Duration::from_millis(20));
        assert_eq!(config.retry_delay(3), Duration::from_millis(80));
        assert_eq!(config.retry_delay(64), Duration::from_millis(10).saturating_mul(u32::MAX));
    }

    #[tokio::test]
    async fn enqueue_persists_before_returning() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(applying(), store.clone(), ConflictPolicy::default());

        let id = queue.enqueue(json!({"note": "hi"}), "annotation").await.unwrap();

        assert!(store.get(&record_key(&id)).await.unwrap().is_some());
        assert!(store.get(INDEX_KEY).await.unwrap().is_some());
        assert_eq!(queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn drain_removes_applied_entries() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(applying(), store.clone(), ConflictPolicy::default());
        let id = queue.enqueue(json!({"v": 1}), "annotation").await.unwrap();

        let report = queue.drain_queue().await;

        assert_eq!(report.synced, 1);
        assert_eq!(queue.stats().total(), 0);
        assert!(store.get(&record_key(&id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drain_writes_in_batches() {
        struct Counting {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl RemoteWriter for Counting {
            async fn write(&self, _: &QueuedMutation) -> Result<WriteOutcome, RemoteWriteError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(WriteOutcome::Applied)
            }
        }

        let writer = Arc::new(Counting {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = queue_with(
            writer.clone(),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
        );
        for i in 0..25 {
            queue.enqueue(json!(i), "n").await.unwrap();
        }

        let report = queue.drain_queue().await;

        assert_eq!(report.synced, 25);
        assert!(writer.peak.load(Ordering::SeqCst) <= 10);
        assert!(writer.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn failures_back_off_then_fail() {
        let mut writer = MockRemoteWriter::new();
        writer
            .expect_write()
            .times(4)
            .returning(|_| Err(RemoteWriteError::Transient("reset".into())));
        let queue = queue_with(
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
        );
        queue.set_online(false);
        let id = queue.enqueue(json!({}), "n").await.unwrap();

        let first = queue.drain_queue().await;
        assert_eq!(first.retried, 1);
        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.retry_count, 1);
        assert!(entry.next_attempt_at.is_some());

        // Not due yet.
        assert_eq!(queue.drain_queue().await, DrainReport::default());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.drain_queue().await.retried, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.drain_queue().await.retried, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.drain_queue().await.failed, 1);

        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.sync_status, SyncStatus::Failed);
        assert_eq!(entry.retry_count, 4);
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn zero_retries_fails_after_first_attempt() {
        let mut writer = MockRemoteWriter::new();
        writer
            .expect_write()
            .times(1)
            .returning(|_| Err(RemoteWriteError::Timeout));
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let queue = queue_on(
            bus,
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
            QueueConfig {
                max_retries: 0,
                ..config()
            },
        );
        queue.set_online(false);
        let id = queue.enqueue(json!({}), "n").await.unwrap();

        assert_eq!(queue.drain_queue().await.failed, 1);
        assert_eq!(queue.get(&id).unwrap().sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn rejected_writes_fail_immediately_and_can_be_retried() {
        let mut writer = MockRemoteWriter::new();
        let mut seq = mockall::Sequence::new();
        writer
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RemoteWriteError::Rejected("forbidden".into())));
        writer
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(WriteOutcome::Applied));
        let queue = queue_with(
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
        );
        let id = queue.enqueue(json!({}), "n").await.unwrap();

        assert_eq!(queue.drain_queue().await.failed, 1);
        assert_eq!(queue.stats().failed, 1);

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        assert!(matches!(
            queue.retry(&id).await,
            Err(QueueError::NotRetryable { .. })
        ));
        assert_eq!(queue.drain_queue().await.synced, 1);
        assert!(matches!(queue.retry(&id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn conflict_resolved_to_server_value_is_synced() {
        let mut writer = MockRemoteWriter::new();
        writer.expect_write().times(1).returning(|_| {
            Ok(WriteOutcome::Conflict {
                server_value: json!({"price": 12}),
            })
        });
        let queue = queue_with(
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::new(ResolutionStrategy::ServerWins),
        );
        queue.enqueue(json!({"price": 10}), "price").await.unwrap();

        let report = queue.drain_queue().await;
        assert_eq!(report.resolved, 1);
        assert_eq!(queue.stats().total(), 0);
    }

    #[tokio::test]
    async fn merged_conflict_is_resubmitted() {
        let mut writer = MockRemoteWriter::new();
        let mut seq = mockall::Sequence::new();
        writer
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(WriteOutcome::Conflict {
                    server_value: json!({"price": 12, "volume": 300, "open": 9}),
                })
            });
        writer
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|m| m.payload == json!({"price": 12, "volume": 500, "open": 9}))
            .returning(|_| Ok(WriteOutcome::Applied));
        let queue = queue_with(
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::new(ResolutionStrategy::ServerWins)
                .with("bar", ResolutionStrategy::Merge),
        );
        queue
            .enqueue(json!({"price": 10, "volume": 500}), "bar")
            .await
            .unwrap();

        let report = queue.drain_queue().await;
        assert_eq!(report.resolved, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(queue.stats().total(), 0);
    }

    #[tokio::test]
    async fn resolved_conflicts_are_published() {
        let mut writer = MockRemoteWriter::new();
        let mut seq = mockall::Sequence::new();
        writer
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(WriteOutcome::Conflict {
                    server_value: json!({"price": 12, "volume": 300, "open": 9}),
                })
            });
        writer
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(WriteOutcome::Applied));
        let bus = EventBus::spawn(BusConfig::default(), CancellationToken::new());
        let queue = queue_on(
            Arc::clone(&bus),
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::new(ResolutionStrategy::Merge),
            config(),
        );
        let id = queue
            .enqueue(json!({"price": 10, "volume": 500}), "quote")
            .await
            .unwrap();

        queue.drain_queue().await;

        let conflicts: Vec<Event> = bus
            .history()
            .into_iter()
            .filter(|e| e.topic == SYNC_CONFLICT_TOPIC)
            .collect();
        assert_eq!(conflicts.len(), 1);
        let payload = &conflicts[0].payload;
        assert_eq!(payload["mutationId"], json!(id));
        assert_eq!(payload["strategy"], "merge");
        assert_eq!(payload["conflictingFields"], json!(["price", "volume"]));
        assert_eq!(payload["resolved"], json!({"price": 12, "volume": 500, "open": 9}));
        assert_eq!(payload["resubmitted"], true);
    }

    #[tokio::test]
    async fn manual_conflict_leaves_entry_failed() {
        let mut writer = MockRemoteWriter::new();
        writer.expect_write().times(1).returning(|_| {
            Ok(WriteOutcome::Conflict {
                server_value: json!({"text": "server"}),
            })
        });
        let queue = queue_with(
            Arc::new(writer),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::new(ResolutionStrategy::Manual),
        );
        let id = queue.enqueue(json!({"text": "local"}), "note").await.unwrap();

        let report = queue.drain_queue().await;

        assert_eq!(report.failed, 1);
        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.sync_status, SyncStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("manual resolution required"));
    }

    #[tokio::test]
    async fn cancelled_drain_leaves_entries_syncing() {
        struct Hanging;

        #[async_trait]
        impl RemoteWriter for Hanging {
            async fn write(&self, _: &QueuedMutation) -> Result<WriteOutcome, RemoteWriteError> {
                std::future::pending().await
            }
        }

        let queue = queue_with(
            Arc::new(Hanging),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
        );
        queue.enqueue(json!({}), "n").await.unwrap();

        let cancel = CancellationToken::new();
        let drain = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.drain_queue_until(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let report = drain.await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(queue.stats().syncing, 1);
    }

    #[tokio::test]
    async fn restore_reverts_syncing_entries() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let first = queue_with(applying(), Arc::clone(&store), ConflictPolicy::default());
        let a = first.enqueue(json!({"a": 1}), "n").await.unwrap();
        let b = first.enqueue(json!({"b": 2}), "n").await.unwrap();

        let mut syncing = first.get(&b).unwrap();
        syncing.sync_status = SyncStatus::Syncing;
        store
            .put(&record_key(&b), serde_json::to_vec(&syncing).unwrap())
            .await
            .unwrap();

        let second = queue_with(applying(), store, ConflictPolicy::default());
        assert_eq!(second.restore().await.unwrap(), 2);

        let ids: Vec<_> = second.entries().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b.clone()]);
        assert_eq!(second.get(&b).unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn mark_synced_is_exactly_once() {
        let queue = queue_with(
            applying(),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
        );
        let id = queue.enqueue(json!({}), "n").await.unwrap();

        assert!(queue.mark_synced(&id).await);
        assert!(!queue.mark_synced(&id).await);
        assert!(!queue.mark_failed(&id, "late").await);
    }

    #[tokio::test]
    async fn online_transition_detection() {
        let queue = queue_with(
            applying(),
            Arc::new(InMemoryStore::new()),
            ConflictPolicy::default(),
        );
        assert!(queue.is_online());
        assert!(!queue.set_online(true));
        assert!(!queue.set_online(false));
        assert!(queue.set_online(true));
    }
}
