//! In-flight requests keyed by correlation id.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::message::MessageEnvelope;

/// Continuation for one outstanding request
struct PendingRequest {
    sender: oneshot::Sender<MeshResult<MessageEnvelope>>,
    to: String,
    created_at: Instant,
}

/// Table of outstanding requests
///
/// At most one entry exists per correlation id. Whoever removes the entry
/// (a matching response, the timeout, or shutdown) owns the terminal
/// transition.
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm a new entry; an existing entry with the same id is rejected first
    pub(crate) fn register(
        &self,
        correlation_id: impl Into<String>,
        to: impl Into<String>,
    ) -> oneshot::Receiver<MeshResult<MessageEnvelope>> {
        let (tx, rx) = oneshot::channel();
        let previous = self.entries.insert(
            correlation_id.into(),
            PendingRequest {
                sender: tx,
                to: to.into(),
                created_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            let _ = previous
                .sender
                .send(Err(MeshError::InvalidMessage("correlation id reused".to_string())));
        }
        rx
    }

    /// Fulfil the entry for `correlation_id` with `response`
    ///
    /// Returns `false` when no entry is waiting, so the caller can treat the
    /// response as unsolicited.
    pub(crate) fn resolve(&self, correlation_id: &str, response: MessageEnvelope) -> bool {
        match self.entries.remove(correlation_id) {
            Some((_, pending)) => {
                debug!(
                    correlation_id = %correlation_id,
                    to = %pending.to,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Matched response to pending request"
                );
                // The requester may already have given up
                let _ = pending.sender.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Drop the entry without fulfilling it; returns its destination
    pub(crate) fn cancel(&self, correlation_id: &str) -> Option<String> {
        self.entries
            .remove(correlation_id)
            .map(|(_, pending)| pending.to)
    }

    /// Reject every outstanding entry with `error`
    pub(crate) fn reject_all(&self, error: MeshError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                let _ = pending.sender.send(Err(error.clone()));
                rejected += 1;
            }
        }
        rejected
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cancels a pending entry when the waiting future is dropped before a
/// response or its own timeout
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    correlation_id: String,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingRequests, correlation_id: impl Into<String>) -> Self {
        Self {
            pending,
            correlation_id: correlation_id.into(),
            armed: true,
        }
    }

    /// The entry was already removed by whoever fulfilled it
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.cancel(&self.correlation_id).is_some() {
            debug!(correlation_id = %self.correlation_id, "Dropped abandoned pending request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EnvelopeBuilder;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_fulfils_once() {
        let pending = PendingRequests::new();
        let rx = pending.register("c1", "agent://ns/b");
        assert_eq!(pending.len(), 1);

        let response =
            EnvelopeBuilder::response("agent://ns/b", "agent://ns/a", "c1", json!("pong")).build();
        assert!(pending.resolve("c1", response.clone()));
        assert!(!pending.resolve("c1", response));

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.payload, json!("pong"));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_reject_all() {
        let pending = PendingRequests::new();
        let rx1 = pending.register("c1", "agent://ns/b");
        let rx2 = pending.register("c2", "agent://ns/c");

        assert_eq!(pending.reject_all(MeshError::Closed), 2);
        assert!(matches!(rx1.await.unwrap(), Err(MeshError::Closed)));
        assert!(matches!(rx2.await.unwrap(), Err(MeshError::Closed)));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let pending = PendingRequests::new();
        let _rx = pending.register("c1", "agent://ns/b");
        {
            let _guard = PendingGuard::new(&pending, "c1");
        }
        assert_eq!(pending.len(), 0);

        let _rx = pending.register("c2", "agent://ns/b");
        PendingGuard::new(&pending, "c2").disarm();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let pending = PendingRequests::new();
        let _rx = pending.register("c1", "agent://ns/b");
        assert_eq!(pending.cancel("c1").as_deref(), Some("agent://ns/b"));
        assert_eq!(pending.cancel("c1"), None);
    }
}
