//! In-process transport over `mpsc` channels.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::Transport;
use crate::error::{MeshError, MeshResult};
use crate::message::{MessageEnvelope, TransportKind};

/// Default inbox depth per endpoint
const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Shared switchboard connecting in-memory endpoints
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inboxes: Arc<DashMap<String, mpsc::Sender<MessageEnvelope>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an inbox at `endpoint`, replacing any previous one
    pub fn register(&self, endpoint: impl Into<String>) -> mpsc::Receiver<MessageEnvelope> {
        self.register_with_capacity(endpoint, DEFAULT_INBOX_CAPACITY)
    }

    pub fn register_with_capacity(
        &self,
        endpoint: impl Into<String>,
        capacity: usize,
    ) -> mpsc::Receiver<MessageEnvelope> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, "Registered in-memory endpoint");
        self.inboxes.insert(endpoint, tx);
        rx
    }

    pub fn unregister(&self, endpoint: &str) -> bool {
        self.inboxes.remove(endpoint).is_some()
    }

    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.inboxes.contains_key(endpoint)
    }

    async fn deliver(&self, endpoint: &str, envelope: MessageEnvelope) -> MeshResult<()> {
        // Clone the sender so no map guard is held across the await
        let tx = self
            .inboxes
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::transport(format!("no in-memory endpoint at {}", endpoint)))?;

        tx.send(envelope)
            .await
            .map_err(|_| MeshError::transport(format!("in-memory endpoint {} closed", endpoint)))
    }
}

/// [`Transport`] delivering into an [`InMemoryNetwork`]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(network: InMemoryNetwork) -> Self {
        Self {
            network,
            closed: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn send(&self, endpoint: &str, envelope: &MessageEnvelope) -> MeshResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshError::Closed);
        }
        self.network.deliver(endpoint, envelope.clone()).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
