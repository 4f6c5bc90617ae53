//! Agent Discovery Service
//!
//! Maps agent addresses to their [`AgentCard`]s and classifies address strings
//! into the three address families.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Discovery                        │
//! │  register_self / deregister / heartbeat               │
//! │  discover_by_uri / list_namespace / find_by_capability│
//! │  DiscoveryEvent broadcast                             │
//! │           │                                           │
//! │           ▼                                           │
//! │  ┌─────────────────────────────────────────────────┐  │
//! │  │ DiscoveryProvider                               │  │
//! │  │  ┌──────────────┐   ┌────────────────────────┐  │  │
//! │  │  │ InMemory     │   │ Custom (persistent)    │  │  │
//! │  │  └──────────────┘   └────────────────────────┘  │  │
//! │  └─────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is keyed by the card's address string. Lookups never touch the
//! network for the in-memory provider.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::message::{AgentCard, TransportKind};
use crate::types::{Address, AgentAddress};

// ============================================================================
// Events
// ============================================================================

/// Events emitted by the discovery service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// An agent card was inserted or overwritten
    AgentRegistered { address: String, name: String },
    /// An agent was removed from the registry
    AgentDeregistered {
        address: String,
        reason: DeregistrationReason,
    },
    /// An agent refreshed its heartbeat
    Heartbeat { address: String },
}

impl DiscoveryEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent:registered",
            Self::AgentDeregistered { .. } => "agent:deregistered",
            Self::Heartbeat { .. } => "agent:heartbeat",
        }
    }
}

/// Reason for agent deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregistrationReason {
    /// Agent explicitly deregistered
    Explicit,
    /// No heartbeat within the allowed age
    Expired,
}

// ============================================================================
// Discovery Provider Trait
// ============================================================================

/// Storage backend for agent cards
///
/// Implement this trait to back discovery with a persistent or shared
/// registry. Implementations must be safe to call concurrently.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Insert or overwrite the card stored under its address
    async fn register(&self, card: AgentCard) -> MeshResult<()>;

    /// Remove a card; returns `false` when nothing was registered
    async fn deregister(&self, address: &str) -> MeshResult<bool>;

    /// Refresh a card's heartbeat; returns `false` when nothing was registered
    async fn heartbeat(&self, address: &str) -> MeshResult<bool>;

    /// Look up a card by exact address
    async fn get(&self, address: &str) -> MeshResult<Option<AgentCard>>;

    /// All registered cards
    async fn list(&self) -> MeshResult<Vec<AgentCard>>;

    /// Remove cards whose last heartbeat is older than `max_age`
    async fn cleanup_stale(&self, max_age: Duration) -> MeshResult<Vec<String>>;
}

// ============================================================================
// In-Memory Provider
// ============================================================================

/// In-memory provider for single-process meshes
#[derive(Default)]
pub struct InMemoryDiscovery {
    cards: RwLock<HashMap<String, AgentCard>>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscoveryProvider for InMemoryDiscovery {
    async fn register(&self, card: AgentCard) -> MeshResult<()> {
        self.cards.write().await.insert(card.address.clone(), card);
        Ok(())
    }

    async fn deregister(&self, address: &str) -> MeshResult<bool> {
        Ok(self.cards.write().await.remove(address).is_some())
    }

    async fn heartbeat(&self, address: &str) -> MeshResult<bool> {
        let mut cards = self.cards.write().await;
        match cards.get_mut(address) {
            Some(card) => {
                card.heartbeat();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, address: &str) -> MeshResult<Option<AgentCard>> {
        Ok(self.cards.read().await.get(address).cloned())
    }

    async fn list(&self) -> MeshResult<Vec<AgentCard>> {
        Ok(self.cards.read().await.values().cloned().collect())
    }

    async fn cleanup_stale(&self, max_age: Duration) -> MeshResult<Vec<String>> {
        let mut cards = self.cards.write().await;
        let stale: Vec<String> = cards
            .iter()
            .filter(|(_, card)| card.is_stale(max_age))
            .map(|(address, _)| address.clone())
            .collect();
        for address in &stale {
            cards.remove(address);
        }
        Ok(stale)
    }
}

// ============================================================================
// Discovery Service
// ============================================================================

/// The discovery service shared by every client in a process
pub struct Discovery {
    provider: Arc<dyn DiscoveryProvider>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    /// Create a discovery service backed by [`InMemoryDiscovery`]
    pub fn new() -> Self {
        Self::with_provider(Arc::new(InMemoryDiscovery::new()))
    }

    /// Create a discovery service over a custom provider
    pub fn with_provider(provider: Arc<dyn DiscoveryProvider>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { provider, event_tx }
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// Insert or overwrite the registry entry for `card.address`
    ///
    /// A card without health information is stamped healthy with the current
    /// time so heartbeat expiry applies to it.
    pub async fn register_self(&self, mut card: AgentCard) -> MeshResult<()> {
        if card.health.is_none() {
            card.heartbeat();
        }
        let address = card.address.clone();
        let name = card.name.clone();

        info!(address = %address, name = %name, "Registering agent card");
        self.provider.register(card).await?;
        self.emit(DiscoveryEvent::AgentRegistered { address, name });
        Ok(())
    }

    /// Remove an agent from the registry
    pub async fn deregister(&self, address: &str) -> MeshResult<()> {
        if self.provider.deregister(address).await? {
            info!(address = %address, "Deregistered agent card");
            self.emit(DiscoveryEvent::AgentDeregistered {
                address: address.to_string(),
                reason: DeregistrationReason::Explicit,
            });
            Ok(())
        } else {
            Err(MeshError::AgentNotFound(address.to_string()))
        }
    }

    /// Refresh an agent's heartbeat
    pub async fn heartbeat(&self, address: &str) -> MeshResult<()> {
        if self.provider.heartbeat(address).await? {
            debug!(address = %address, "Heartbeat received");
            self.emit(DiscoveryEvent::Heartbeat {
                address: address.to_string(),
            });
            Ok(())
        } else {
            Err(MeshError::AgentNotFound(address.to_string()))
        }
    }

    /// Look up the card registered under `address`
    pub async fn discover_by_uri(&self, address: &str) -> MeshResult<Option<AgentCard>> {
        self.provider.get(address).await
    }

    /// All registered cards
    pub async fn list(&self) -> MeshResult<Vec<AgentCard>> {
        self.provider.list().await
    }

    /// Cards whose address lives in `namespace`
    pub async fn list_namespace(&self, namespace: &str) -> MeshResult<Vec<AgentCard>> {
        Ok(self
            .provider
            .list()
            .await?
            .into_iter()
            .filter(|card| {
                card.agent_address()
                    .is_ok_and(|address| address.namespace() == namespace)
            })
            .collect())
    }

    /// Cards advertising `capability`
    pub async fn find_by_capability(&self, capability: &str) -> MeshResult<Vec<AgentCard>> {
        Ok(self
            .provider
            .list()
            .await?
            .into_iter()
            .filter(|card| card.has_capability(capability))
            .collect())
    }

    /// Remove cards without a heartbeat in `max_age`
    pub async fn cleanup_stale(&self, max_age: Duration) -> MeshResult<Vec<String>> {
        let removed = self.provider.cleanup_stale(max_age).await?;
        for address in &removed {
            warn!(address = %address, "Removed stale agent card");
            self.emit(DiscoveryEvent::AgentDeregistered {
                address: address.clone(),
                reason: DeregistrationReason::Expired,
            });
        }
        Ok(removed)
    }

    /// Periodically remove stale cards
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
    ) -> BackgroundTaskHandle {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = service.cleanup_stale(max_age).await {
                    warn!(error = %e, "Discovery cleanup failed");
                }
            }
        });
        BackgroundTaskHandle { handle }
    }

    /// Parse a direct address, reporting malformed input as `AGENT_NOT_FOUND`
    pub fn parse_agent_address(address: &str) -> MeshResult<AgentAddress> {
        AgentAddress::parse(address)
            .map_err(|e| MeshError::AgentNotFound(format!("{}: {}", address, e)))
    }

    /// Classify an address into one of the three families
    pub fn parse_address(address: &str) -> MeshResult<Address> {
        Address::resolve(address)
    }
}

/// Pick the endpoint to deliver to
///
/// Walks the card's transports in preference order and returns the first one
/// that has an endpoint and is available locally.
pub fn resolve_endpoint(
    card: &AgentCard,
    available: &[TransportKind],
) -> MeshResult<(TransportKind, String)> {
    if card.endpoints.is_empty() {
        return Err(MeshError::AgentUnreachable {
            address: card.address.clone(),
            reason: "card lists no endpoints".to_string(),
        });
    }

    card.transports
        .iter()
        .filter(|kind| available.contains(kind))
        .find_map(|kind| card.endpoint(*kind).map(|url| (*kind, url.to_string())))
        .ok_or_else(|| MeshError::UnsupportedTransport {
            address: card.address.clone(),
            transports: card
                .transports
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Handle for background tasks
pub struct BackgroundTaskHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandle {
    /// Stop the background task
    pub fn stop(self) {
        self.handle.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
