//! Transport-backed remote writer.
//!
//! Writes queued mutations as `mutation` frames and matches the server's
//! `mutation.ack` / `mutation.conflict` / `mutation.reject` replies by
//! mutation id. Replies that arrive after the write deadline are handed
//! back to the caller as [`LateReply`] so the queue can still apply them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::codec::{Frame, frame_type};
use super::connection::{Connection, SendStatus};
use crate::application::ports::{RemoteWriteError, RemoteWriter, WriteOutcome};
use crate::domain::connection::ConnectionState;
use crate::domain::mutation::{MutationId, QueuedMutation};

type Reply = Result<WriteOutcome, RemoteWriteError>;

/// A reply whose write had already given up waiting.
#[derive(Debug, Clone, PartialEq)]
pub struct LateReply {
    /// The mutation the reply refers to.
    pub mutation_id: MutationId,
    /// What the server said.
    pub outcome: Result<WriteOutcome, RemoteWriteError>,
}

type Waiters = DashMap<MutationId, (u64, oneshot::Sender<Reply>)>;

/// [`RemoteWriter`] over a transport [`Connection`].
pub struct TransportWriter {
    connection: Arc<Connection>,
    waiters: Waiters,
    next_ticket: AtomicU64,
    deadline: Duration,
}

/// Removes a write's waiter however the write ends, including when its
/// future is dropped mid-flight.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    mutation_id: &'a str,
    ticket: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters
            .remove_if(self.mutation_id, |_, (ticket, _)| *ticket == self.ticket);
    }
}

impl std::fmt::Debug for TransportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportWriter")
            .field("in_flight", &self.waiters.len())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl TransportWriter {
    /// Create a writer with the given reply deadline.
    #[must_use]
    pub fn new(connection: Arc<Connection>, deadline: Duration) -> Self {
        Self {
            connection,
            waiters: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            deadline,
        }
    }

    /// Whether a frame type is a mutation reply.
    #[must_use]
    pub fn is_reply(frame: &Frame) -> bool {
        matches!(
            frame.frame_type.as_str(),
            frame_type::MUTATION_ACK | frame_type::MUTATION_CONFLICT | frame_type::MUTATION_REJECT
        )
    }

    /// Route a reply frame to its waiting write.
    ///
    /// Returns the reply when no write is waiting for it.
    pub fn handle_reply(&self, frame: &Frame) -> Option<LateReply> {
        let mutation_id = frame
            .payload
            .get("mutationId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(mutation_id) = mutation_id else {
            tracing::warn!(frame_type = %frame.frame_type, "Mutation reply without mutationId");
            return None;
        };

        let outcome = match frame.frame_type.as_str() {
            frame_type::MUTATION_ACK => Ok(WriteOutcome::Applied),
            frame_type::MUTATION_CONFLICT => Ok(WriteOutcome::Conflict {
                server_value: frame
                    .payload
                    .get("serverValue")
                    .cloned()
                    .unwrap_or(Value::Null),
            }),
            _ => Err(RemoteWriteError::Rejected(
                frame
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected by server")
                    .to_string(),
            )),
        };

        match self.waiters.remove(&mutation_id) {
            Some((_, (_, waiter))) => match waiter.send(outcome) {
                Ok(()) => None,
                Err(outcome) => Some(LateReply {
                    mutation_id,
                    outcome,
                }),
            },
            None => {
                tracing::debug!(mutation_id = %mutation_id, "Late mutation reply");
                Some(LateReply {
                    mutation_id,
                    outcome,
                })
            }
        }
    }

    /// Writes waiting for a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.waiters.len()
    }
}

#[async_trait]
impl RemoteWriter for TransportWriter {
    async fn write(&self, mutation: &QueuedMutation) -> Result<WriteOutcome, RemoteWriteError> {
        if self.connection.state() != ConnectionState::Connected {
            return Err(RemoteWriteError::Transient("transport not connected".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.waiters.insert(mutation.id.clone(), (ticket, tx));
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            mutation_id: &mutation.id,
            ticket,
        };

        let frame = Frame::new(
            frame_type::MUTATION,
            json!({
                "mutationId": mutation.id,
                "type": mutation.mutation_type,
                "payload": mutation.payload,
                "createdAt": mutation.created_at,
                "retryCount": mutation.retry_count,
            }),
        );

        if self.connection.send(frame) != SendStatus::Sent {
            return Err(RemoteWriteError::Transient("transport not writable".to_string()));
        }

        match tokio::time::timeout(self.deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RemoteWriteError::Transient("reply channel closed".to_string())),
            Err(_) => Err(RemoteWriteError::Timeout),
        }
    }
}
