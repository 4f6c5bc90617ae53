//! Transports deliver a serialized envelope to one endpoint.
//!
//! The client owns retries, backoff and dead-lettering. A transport performs a
//! single attempt and reports failures as [`MeshError::Transport`] so the
//! delivery loop can classify them.
//!
//! [`MeshError::Transport`]: crate::error::MeshError::Transport

use async_trait::async_trait;

use crate::error::MeshResult;
use crate::message::{MessageEnvelope, TransportKind};

#[cfg(feature = "http")]
mod http;
mod memory;

#[cfg(feature = "http")]
pub use http::{HttpTransport, MESSAGES_PATH};
pub use memory::{InMemoryNetwork, InMemoryTransport};

/// One delivery mechanism, keyed by [`TransportKind`]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which card endpoint this transport consumes
    fn kind(&self) -> TransportKind;

    /// Deliver `envelope` to `endpoint` once
    async fn send(&self, endpoint: &str, envelope: &MessageEnvelope) -> MeshResult<()>;

    /// Release resources; later sends may fail
    async fn close(&self) {}
}
