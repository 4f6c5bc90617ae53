//! # OSSA Mesh
//!
//! Agent-to-agent messaging for OSSA agent systems.
//!
//! Agents describe themselves with an [`AgentCard`], register it with
//! [`Discovery`], and exchange versioned [`MessageEnvelope`]s through a
//! [`MeshClient`].
//!
//! ## Features
//!
//! - **Addressing**: direct (`agent://ns/name`), topic (`topic://channel`) and
//!   broadcast (`broadcast://ns/*`) grammars
//! - **Routing**: rule-based topic fan-out with payload filters
//! - **Subscriptions**: wildcard channel patterns (`*`, `**`)
//! - **Priorities**: strict five-lane outbound queue
//! - **Reliability**: retry with backoff, TTL expiry, dead-letter routing,
//!   at-most-once / at-least-once / exactly-once guarantees
//! - **RPC**: correlated request/response and named commands
//! - **Transports**: HTTP (`http` feature) and in-process channels
//! - **Observability**: structured `tracing` logs, metrics and an event bus
//!
//! ## Example
//!
//! ```rust,no_run
//! use ossa_mesh::{
//!     AgentAddress, AgentCard, Discovery, HandlerError, InMemoryNetwork, InMemoryTransport,
//!     MeshClient, TransportKind,
//! };
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Arc::new(Discovery::new());
//!     let network = InMemoryNetwork::new();
//!
//!     let address = AgentAddress::parse("agent://demo/pong")?;
//!     let card = AgentCard::new(&address, "pong", "1.0.0")
//!         .with_endpoint(TransportKind::Memory, "mem://pong");
//!     let pong = MeshClient::builder(card)
//!         .discovery(Arc::clone(&discovery))
//!         .transport(InMemoryTransport::new(network.clone()))
//!         .start()
//!         .await?;
//!     pong.listen(network.register("mem://pong"))?;
//!     pong.register_command("ping", |_input: Value| async move {
//!         Ok::<Value, HandlerError>(json!("pong"))
//!     });
//!
//!     let address = AgentAddress::parse("agent://demo/ping")?;
//!     let card = AgentCard::new(&address, "ping", "1.0.0")
//!         .with_endpoint(TransportKind::Memory, "mem://ping");
//!     let ping = MeshClient::builder(card)
//!         .discovery(Arc::clone(&discovery))
//!         .transport(InMemoryTransport::new(network.clone()))
//!         .start()
//!         .await?;
//!     ping.listen(network.register("mem://ping"))?;
//!
//!     let answer = ping
//!         .invoke_command("agent://demo/pong", "ping", Value::Null, None)
//!         .await?;
//!     assert_eq!(answer, json!("pong"));
//!
//!     ping.close().await;
//!     pong.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod dlq;
pub mod error;
pub mod events;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod routing;
pub mod transport;
pub mod types;

pub use client::{
    ClientStats, CommandHandler, DispatchOutcome, MeshClient, MeshClientBuilder,
};
pub use config::{
    AcknowledgmentConfig, BackoffKind, ClientConfig, ConfigError, DeadLetterConfig,
    DeliveryGuarantee, OrderingConfig, ReliabilityConfig, RetryPolicy,
};
pub use discovery::{
    BackgroundTaskHandle, DeregistrationReason, Discovery, DiscoveryEvent, DiscoveryProvider,
    InMemoryDiscovery, resolve_endpoint,
};
pub use dlq::{DeadLetterStore, DlqStats};
pub use error::{A2aError, A2aErrorCode, MeshError, MeshResult};
pub use events::{EventBus, MeshEvent};
pub use message::{
    AgentCard, AgentHealth, AuthMethod, DeadLetterRecord, EncryptionRequirement, EnvelopeBuilder,
    EnvelopeMetadata, HealthStatus, MessageEnvelope, MessageId, MessageType, PROTOCOL_VERSION,
    Priority, TraceContext, TransportKind,
};
pub use metrics::{LatencyStats, MeshMetrics, MeshMetricsCollector};
pub use queue::{PriorityQueue, QueueStats};
pub use routing::{
    HandlerError, MessageFilter, MessageHandler, Router, RoutingRule, RoutingStats, Subscription,
    SubscriptionManager,
};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{InMemoryNetwork, InMemoryTransport, Transport};
pub use types::{
    Address, AddressError, AgentAddress, BroadcastAddress, TopicAddress, matches_pattern,
};
