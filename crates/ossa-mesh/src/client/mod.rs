//! Mesh client
//!
//! [`MeshClient`] is the façade agents use to talk to the mesh. Outbound
//! envelopes are validated synchronously, queued by priority and delivered by
//! a background scheduler. Inbound envelopes enter through
//! [`MeshClient::handle_message`] (or a stream attached with
//! [`MeshClient::listen`]) and are dispatched to pending requests, command
//! handlers or subscriptions.
//!
//! # Example
//!
//! ```rust,ignore
//! use ossa_mesh::{AgentAddress, AgentCard, InMemoryNetwork, InMemoryTransport, MeshClient, TransportKind};
//!
//! let network = InMemoryNetwork::new();
//! let address = AgentAddress::parse("agent://demo/pong")?;
//! let card = AgentCard::new(&address, "pong", "1.0.0")
//!     .with_endpoint(TransportKind::Memory, "mem://pong");
//!
//! let client = MeshClient::builder(card)
//!     .discovery(discovery.clone())
//!     .transport(InMemoryTransport::new(network.clone()))
//!     .start()
//!     .await?;
//! client.listen(network.register("mem://pong"))?;
//! client.register_command("ping", |_input| async { Ok(serde_json::json!("pong")) });
//! ```

mod delivery;
mod dispatch;
mod pending;
mod scheduler;

pub use dispatch::{COMMAND_KEY, CommandHandler, DispatchOutcome, INPUT_KEY};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, DeliveryGuarantee};
use crate::discovery::Discovery;
use crate::dlq::{DeadLetterStore, DlqStats};
use crate::error::{A2aErrorCode, MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::message::{
    AgentCard, EnvelopeBuilder, MessageEnvelope, MessageId, MessageType, Priority, TransportKind,
};
use crate::metrics::{MeshMetrics, MeshMetricsCollector};
use crate::queue::{PriorityQueue, QueueStats};
use crate::routing::{MessageHandler, Router, RoutingRule, RoutingStats, Subscription, SubscriptionManager};
use crate::transport::Transport;
use crate::types::{Address, BroadcastAddress, TOPIC_SCHEME, TopicAddress};

use dispatch::{DedupWindow, command_request, error_payload, parse_command, remote_error};
use pending::{PendingGuard, PendingRequests};

/// How often the local dead-letter store drops expired records
const DLQ_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Point-in-time view of a client
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub address: String,
    pub metrics: MeshMetrics,
    pub queue: QueueStats,
    /// Depth of each priority lane, highest first
    pub queue_depth: Vec<(Priority, usize)>,
    pub routing: RoutingStats,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub commands: usize,
    /// Present when a dead-letter channel is configured
    pub dead_letters: Option<DlqStats>,
}

/// Shared state behind every [`MeshClient`] handle
pub(crate) struct ClientInner {
    address: String,
    card: AgentCard,
    config: ClientConfig,
    discovery: Arc<Discovery>,
    router: Router,
    subscriptions: SubscriptionManager,
    commands: DashMap<String, Arc<dyn CommandHandler>>,
    queue: PriorityQueue,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    pending: PendingRequests,
    dead_letters: Option<Arc<DeadLetterStore>>,
    dedup: Option<DedupWindow>,
    metrics: MeshMetricsCollector,
    events: EventBus,
    processing: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    dlq_cleanup: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Builder
// ============================================================================

/// Wires a client together and starts it
pub struct MeshClientBuilder {
    card: AgentCard,
    config: ClientConfig,
    discovery: Option<Arc<Discovery>>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    events: Option<EventBus>,
}

impl MeshClientBuilder {
    pub fn new(card: AgentCard) -> Self {
        Self {
            card,
            config: ClientConfig::default(),
            discovery: None,
            transports: HashMap::new(),
            events: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a discovery service with other clients
    pub fn discovery(mut self, discovery: Arc<Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Add a transport; a later transport of the same kind replaces it
    pub fn transport(self, transport: impl Transport + 'static) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Publish events on an existing bus
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate, register the card and start background tasks
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the card address is not an
    /// agent address, or registration fails.
    pub async fn start(self) -> MeshResult<MeshClient> {
        let Self {
            card,
            config,
            discovery,
            transports,
            events,
        } = self;

        config.validate()?;
        let address = Discovery::parse_agent_address(&card.address)?.to_string();
        let discovery = discovery.unwrap_or_else(|| Arc::new(Discovery::new()));
        let events = events.unwrap_or_default();

        if transports.is_empty() {
            warn!(address = %address, "Mesh client started without transports; outbound delivery will fail");
        }

        discovery.register_self(card.clone()).await?;

        let dead_letters = config
            .reliability
            .dead_letter
            .as_ref()
            .map(|dlq| Arc::new(DeadLetterStore::new(dlq)));
        let dedup = (config.reliability.delivery_guarantee == DeliveryGuarantee::ExactlyOnce)
            .then(|| DedupWindow::new(config.dedup_window));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            address: address.clone(),
            card,
            router: Router::with_events(events.clone()),
            subscriptions: SubscriptionManager::new(),
            commands: DashMap::new(),
            queue: PriorityQueue::new(config.queue_capacity),
            transports,
            pending: PendingRequests::new(),
            dead_letters,
            dedup,
            metrics: MeshMetricsCollector::with_defaults(),
            events,
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            dlq_cleanup: Mutex::new(None),
            discovery,
            config,
        });

        scheduler::spawn(
            Arc::downgrade(&inner),
            inner.config.tick_interval,
            shutdown_rx.clone(),
        );
        if let Some(interval) = inner.config.heartbeat_interval {
            spawn_heartbeat(
                Arc::clone(&inner.discovery),
                address.clone(),
                interval,
                shutdown_rx,
            );
        }
        if let Some(store) = &inner.dead_letters {
            *inner.dlq_cleanup.lock().await =
                Some(Arc::clone(store).start_cleanup_task(DLQ_CLEANUP_INTERVAL));
        }

        info!(
            address = %address,
            transports = ?inner.transports.keys().collect::<Vec<_>>(),
            guarantee = ?inner.config.reliability.delivery_guarantee,
            "Mesh client started"
        );
        Ok(MeshClient { inner })
    }
}

fn spawn_heartbeat(
    discovery: Arc<Discovery>,
    address: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Registration already stamped the first heartbeat
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = discovery.heartbeat(&address).await {
                        warn!(address = %address, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    });
}

// ============================================================================
// Client
// ============================================================================

/// Handle to a running mesh client
///
/// Cloning is cheap and every clone drives the same client. Call
/// [`close`](Self::close) to stop background tasks.
#[derive(Clone)]
pub struct MeshClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("address", &self.inner.address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MeshClient {
    pub fn builder(card: AgentCard) -> MeshClientBuilder {
        MeshClientBuilder::new(card)
    }

    /// This client's agent address
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn card(&self) -> &AgentCard {
        &self.inner.card
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.inner.discovery
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> MeshResult<()> {
        if self.is_closed() {
            Err(MeshError::Closed)
        } else {
            Ok(())
        }
    }

    /// Start an envelope from this client with the configured default TTL
    pub fn envelope(
        &self,
        to: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder::new(self.inner.address.clone(), to, message_type, payload)
            .with_ttl(self.inner.config.default_ttl_secs)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Validate and queue an envelope for delivery
    ///
    /// # Errors
    ///
    /// - `AgentNotFound` / `TopicNotFound` when `to` does not parse
    /// - `MessageTooLarge` when the encoded envelope exceeds the limit
    /// - `QueueFull` when the outbound queue is at capacity
    pub async fn send(&self, envelope: MessageEnvelope) -> MeshResult<MessageId> {
        self.ensure_open()?;
        Address::resolve(&envelope.to)?;

        let size = envelope.encoded_len()?;
        let limit = self.inner.config.max_message_size;
        if size > limit {
            return Err(MeshError::MessageTooLarge { size, limit });
        }

        let id = envelope.id.clone();
        let to = envelope.to.clone();
        let priority = envelope.priority;
        self.inner.queue.enqueue(envelope).await?;
        self.inner.metrics.record_send().await;

        debug!(message_id = %id, to = %to, priority = %priority, "Queued message");
        self.inner.events.emit(MeshEvent::MessageQueued {
            message_id: id.to_string(),
            to,
            priority,
        });
        Ok(id)
    }

    /// Send a request and wait for the correlated response payload
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn request(
        &self,
        to: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> MeshResult<Value> {
        let request = self.envelope(to, MessageType::Request, payload).build();
        Ok(self.request_envelope(request, timeout).await?.payload)
    }

    /// Send a prepared request envelope and wait for the response envelope
    ///
    /// The correlation id defaults to the envelope id and the reply-to address
    /// to this client.
    pub async fn request_envelope(
        &self,
        mut request: MessageEnvelope,
        timeout: Option<Duration>,
    ) -> MeshResult<MessageEnvelope> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);

        request.message_type = MessageType::Request;
        let correlation_id = request
            .correlation_id
            .get_or_insert_with(|| request.id.to_string())
            .clone();
        request
            .reply_to
            .get_or_insert_with(|| self.inner.address.clone());
        let to = request.to.clone();

        let rx = self.inner.pending.register(correlation_id.clone(), to.clone());
        let guard = PendingGuard::new(&self.inner.pending, correlation_id.clone());
        self.send(request).await?;
        debug!(correlation_id = %correlation_id, to = %to, ?timeout, "Awaiting response");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(MeshError::Closed)
            }
            Err(_) => {
                drop(guard);
                warn!(correlation_id = %correlation_id, to = %to, ?timeout, "Request timed out");
                self.inner.events.emit(MeshEvent::RequestTimeout {
                    correlation_id,
                    to,
                });
                Err(MeshError::Timeout(timeout))
            }
        }
    }

    /// Invoke a remote command and return its result
    ///
    /// An error-shaped response (`{"error": {"code", "message"}}`) becomes
    /// [`MeshError::Remote`].
    pub async fn invoke_command(
        &self,
        to: impl Into<String>,
        command: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> MeshResult<Value> {
        let payload = self
            .request(to, command_request(command, input), timeout)
            .await?;
        match remote_error(&payload) {
            Some(err) => Err(err),
            None => Ok(payload),
        }
    }

    /// Answer a request envelope
    ///
    /// Goes to the request's reply-to address, falling back to its sender.
    pub async fn respond(&self, request: &MessageEnvelope, payload: Value) -> MeshResult<MessageId> {
        let to = request
            .reply_to
            .clone()
            .unwrap_or_else(|| request.from.clone());
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.id.to_string());

        let mut response =
            EnvelopeBuilder::response(self.inner.address.clone(), to, correlation_id, payload)
                .with_ttl(self.inner.config.default_ttl_secs)
                .with_priority(request.priority);
        if let Some(trace) = &request.trace {
            response = response.with_trace(trace.child());
        }
        self.send(response.build()).await
    }

    /// Publish an event to a topic
    ///
    /// `topic` may be a bare channel (`orders.created`) or a topic address.
    pub async fn publish(&self, topic: &str, payload: Value) -> MeshResult<MessageId> {
        let parsed = match topic.strip_prefix(TOPIC_SCHEME) {
            Some(_) => TopicAddress::parse(topic),
            None => TopicAddress::new(topic),
        }
        .map_err(|e| MeshError::TopicNotFound(format!("{}: {}", topic, e)))?;

        let envelope = self
            .envelope(parsed.to_string(), MessageType::Event, payload)
            .build();
        let id = self.send(envelope).await?;
        self.inner.metrics.record_publish(parsed.channel()).await;
        Ok(id)
    }

    /// Publish an event to every agent in `namespace`
    pub async fn broadcast(&self, namespace: &str, payload: Value) -> MeshResult<MessageId> {
        let address = BroadcastAddress::new(namespace)
            .map_err(|e| MeshError::TopicNotFound(format!("{}: {}", namespace, e)))?;

        let envelope = self
            .envelope(address.to_string(), MessageType::Event, payload)
            .build();
        let id = self.send(envelope).await?;
        self.inner.metrics.record_broadcast().await;
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    /// Bind a handler to a channel or pattern
    ///
    /// Returns `false` when the same handler id is already bound to that
    /// channel.
    pub fn subscribe(&self, subscription: Subscription, handler: impl MessageHandler + 'static) -> bool {
        self.inner
            .subscriptions
            .subscribe(subscription, Arc::new(handler))
    }

    pub fn unsubscribe(&self, channel: &str, handler_id: &str) -> bool {
        self.inner.subscriptions.unsubscribe(channel, handler_id)
    }

    /// Register a command handler; returns `true` if it replaced another
    pub fn register_command(
        &self,
        command: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> bool {
        let command = command.into();
        debug!(command = %command, "Registered command handler");
        self.inner
            .commands
            .insert(command, Arc::new(handler))
            .is_some()
    }

    pub fn unregister_command(&self, command: &str) -> bool {
        self.inner.commands.remove(command).is_some()
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Dispatch one inbound envelope
    ///
    /// A response matching a pending request resolves it and nothing else
    /// runs. A request naming a registered command runs that command and
    /// replies when a reply-to address is present. Everything else goes to
    /// the subscriptions matching the envelope's channel, all run
    /// concurrently.
    ///
    /// Handler failures are logged and counted, never returned.
    ///
    /// # Errors
    ///
    /// `UnsupportedVersion` for an incompatible protocol version and
    /// `Closed` after [`close`](Self::close).
    pub async fn handle_message(&self, envelope: MessageEnvelope) -> MeshResult<DispatchOutcome> {
        self.ensure_open()?;

        if let Err(e) = envelope.check_version() {
            warn!(message_id = %envelope.id, version = %envelope.version, "Rejecting envelope");
            return Err(e);
        }

        if envelope.is_expired_at(Utc::now()) {
            warn!(message_id = %envelope.id, from = %envelope.from, "Dropping expired inbound message");
            self.inner.metrics.record_expired().await;
            self.inner.events.emit(MeshEvent::MessageExpired {
                message_id: envelope.id.to_string(),
                to: envelope.to.clone(),
            });
            return Ok(DispatchOutcome::Expired);
        }

        if let Some(dedup) = &self.inner.dedup
            && !dedup.first_sighting(envelope.id.as_str())
        {
            debug!(message_id = %envelope.id, "Dropping duplicate message");
            self.inner.metrics.record_duplicate().await;
            return Ok(DispatchOutcome::Duplicate);
        }

        self.inner.metrics.record_receive().await;
        self.inner.events.emit(MeshEvent::MessageReceived {
            message_id: envelope.id.to_string(),
            from: envelope.from.clone(),
            message_type: envelope.message_type,
        });

        if envelope.message_type == MessageType::Response
            && let Some(correlation_id) = envelope.correlation_id.clone()
            && self.inner.pending.resolve(&correlation_id, envelope.clone())
        {
            return Ok(DispatchOutcome::ResponseMatched);
        }

        if envelope.message_type == MessageType::Request
            && let Some((command, input)) = parse_command(&envelope.payload)
        {
            let handler = self
                .inner
                .commands
                .get(command)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(handler) = handler {
                let command = command.to_string();
                return Ok(self.run_command(&envelope, command, handler, input).await);
            }
        }

        Ok(self.dispatch_to_subscribers(envelope).await)
    }

    async fn run_command(
        &self,
        envelope: &MessageEnvelope,
        command: String,
        handler: Arc<dyn CommandHandler>,
        input: Value,
    ) -> DispatchOutcome {
        debug!(message_id = %envelope.id, command = %command, "Running command");
        let reply = match handler.execute(input).await {
            Ok(value) => value,
            Err(e) => {
                warn!(message_id = %envelope.id, command = %command, error = %e, "Command handler failed");
                self.inner.metrics.record_handler_failure().await;
                error_payload(A2aErrorCode::TaskRejected, e.to_string())
            }
        };

        let replied = if envelope.reply_to.is_some() {
            match self.respond(envelope, reply).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(message_id = %envelope.id, command = %command, error = %e, "Failed to send command response");
                    false
                }
            }
        } else {
            debug!(message_id = %envelope.id, command = %command, "No reply-to address, result discarded");
            false
        };

        DispatchOutcome::CommandHandled { command, replied }
    }

    async fn dispatch_to_subscribers(&self, envelope: MessageEnvelope) -> DispatchOutcome {
        let channel = Address::parse(&envelope.to)
            .map(|address| address.channel())
            .unwrap_or_else(|_| envelope.to.clone());

        let bindings: Vec<_> = self
            .inner
            .subscriptions
            .get_handlers(&channel)
            .into_iter()
            .filter(|binding| binding.accepts(&envelope))
            .collect();
        if bindings.is_empty() {
            debug!(message_id = %envelope.id, channel = %channel, "No subscribers");
            return DispatchOutcome::Unhandled;
        }

        // One task per handler so a panicking handler cannot take its siblings down
        let tasks = bindings.iter().map(|binding| {
            let binding = binding.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move { binding.invoke(envelope).await.map_err(|e| e.to_string()) })
        });
        let results = join_all(tasks).await;

        let mut failures = 0;
        for (binding, result) in bindings.iter().zip(results) {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => join_error.to_string(),
            };
            failures += 1;
            warn!(
                message_id = %envelope.id,
                channel = %channel,
                handler_id = %binding.handler_id(),
                error = %error,
                "Subscription handler failed"
            );
            self.inner.metrics.record_handler_failure().await;
        }

        DispatchOutcome::Dispatched {
            handlers: bindings.len(),
            failures,
        }
    }

    /// Handle envelopes from `inbox` one at a time until it closes or the
    /// client shuts down
    pub fn listen(&self, mut inbox: mpsc::Receiver<MessageEnvelope>) -> MeshResult<()> {
        self.ensure_open()?;
        let client = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    next = inbox.recv() => {
                        let Some(envelope) = next else { break };
                        let id = envelope.id.clone();
                        if let Err(e) = client.handle_message(envelope).await {
                            warn!(message_id = %id, error = %e, "Inbound message rejected");
                        }
                    }
                }
            }
            debug!(address = %client.inner.address, "Inbox listener stopped");
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    pub fn add_rule(&self, rule: RoutingRule) -> MeshResult<String> {
        self.inner.router.add_rule(rule)
    }

    pub fn remove_rule(&self, id: &str) -> Option<RoutingRule> {
        self.inner.router.remove_rule(id)
    }

    pub fn get_rules(&self) -> Vec<RoutingRule> {
        self.inner.router.get_rules()
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    /// Subscribe to this client's operation events
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &MeshMetricsCollector {
        &self.inner.metrics
    }

    pub async fn stats(&self) -> ClientStats {
        let dead_letters = match &self.inner.dead_letters {
            Some(store) => Some(store.stats().await),
            None => None,
        };
        ClientStats {
            address: self.inner.address.clone(),
            metrics: self.inner.metrics.snapshot().await,
            queue: self.inner.queue.stats().await,
            queue_depth: self.inner.queue.len_by_priority().await,
            routing: self.inner.router.stats(),
            pending_requests: self.inner.pending.len(),
            subscriptions: self.inner.subscriptions.handler_count(),
            commands: self.inner.commands.len(),
            dead_letters,
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Envelopes waiting for the scheduler
    pub async fn queued(&self) -> usize {
        self.inner.queue.len().await
    }

    /// Local dead-letter store, when a dead-letter channel is configured
    pub fn dead_letters(&self) -> Option<&DeadLetterStore> {
        self.inner.dead_letters.as_deref()
    }

    /// Re-queue every dead-lettered copy of `message_id`
    ///
    /// Replayed envelopes get a fresh timestamp so their TTL restarts.
    pub async fn replay_dead_letter(&self, message_id: &str) -> MeshResult<usize> {
        let store = self.inner.dead_letters.as_ref().ok_or_else(|| {
            MeshError::InvalidConfig("no dead-letter channel configured".to_string())
        })?;

        let mut replayed = 0;
        for record in store.take(message_id).await {
            let mut envelope = record.original;
            envelope.timestamp = Utc::now();
            envelope.metadata.retry_count = 0;
            self.send(envelope).await?;
            replayed += 1;
        }
        info!(message_id = %message_id, replayed, "Replayed dead-lettered message");
        Ok(replayed)
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop the scheduler and listeners, reject pending requests, drop
    /// queued envelopes, close transports and deregister from discovery
    ///
    /// Calling `close` more than once is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(address = %self.inner.address, "Closing mesh client");

        // Receivers may all be gone already
        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self.inner.dlq_cleanup.lock().await.take() {
            handle.abort();
        }

        let rejected = self.inner.pending.reject_all(MeshError::Closed);
        let dropped = self.inner.queue.drain().await.len();
        if dropped > 0 {
            warn!(address = %self.inner.address, dropped, "Dropped queued messages on close");
        }

        for transport in self.inner.transports.values() {
            transport.close().await;
        }
        if let Err(e) = self.inner.discovery.deregister(&self.inner.address).await {
            debug!(address = %self.inner.address, error = %e, "Deregistration on close failed");
        }

        info!(
            address = %self.inner.address,
            rejected_requests = rejected,
            "Mesh client closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadLetterConfig;
    use crate::routing::HandlerError;
    use crate::transport::{InMemoryNetwork, InMemoryTransport};
    use crate::types::AgentAddress;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn card(address: &str, endpoint: &str) -> AgentCard {
        let addr = AgentAddress::parse(address).unwrap();
        AgentCard::new(&addr, addr.name(), "1.0.0").with_endpoint(TransportKind::Memory, endpoint)
    }

    async fn client(address: &str, discovery: &Arc<Discovery>, network: &InMemoryNetwork) -> MeshClient {
        client_with(address, discovery, network, ClientConfig::default()).await
    }

    async fn client_with(
        address: &str,
        discovery: &Arc<Discovery>,
        network: &InMemoryNetwork,
        config: ClientConfig,
    ) -> MeshClient {
        let endpoint = format!("mem://{}", address.trim_start_matches("agent://"));
        MeshClient::builder(card(address, &endpoint))
            .config(config)
            .discovery(Arc::clone(discovery))
            .transport(InMemoryTransport::new(network.clone()))
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_card() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let a = client("agent://ns/a", &discovery, &network).await;

        assert_eq!(a.address(), "agent://ns/a");
        assert!(discovery.discover_by_uri("agent://ns/a").await.unwrap().is_some());

        a.close().await;
        assert!(discovery.discover_by_uri("agent://ns/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_non_agent_address() {
        let mut card = card("agent://ns/a", "mem://a");
        card.address = "topic://orders".to_string();
        let err = MeshClient::builder(card).start().await.unwrap_err();
        assert_eq!(err.code(), A2aErrorCode::AgentNotFound);
    }

    #[tokio::test]
    async fn test_send_validates_synchronously() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let config = ClientConfig {
            max_message_size: 256,
            ..ClientConfig::default()
        };
        let a = client_with("agent://ns/a", &discovery, &network, config).await;

        let bad = a.envelope("agent://missing-name", MessageType::Event, json!({})).build();
        assert_eq!(a.send(bad).await.unwrap_err().code(), A2aErrorCode::AgentNotFound);

        let bad_topic = a.envelope("topic://", MessageType::Event, json!({})).build();
        assert_eq!(a.send(bad_topic).await.unwrap_err().code(), A2aErrorCode::TopicNotFound);

        let big = a
            .envelope("agent://ns/b", MessageType::Event, json!({"blob": "x".repeat(512)}))
            .build();
        assert!(matches!(
            a.send(big).await.unwrap_err(),
            MeshError::MessageTooLarge { limit: 256, .. }
        ));
        assert_eq!(a.queued().await, 0);
        a.close().await;
    }

    #[tokio::test]
    async fn test_response_takes_precedence() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let a = client("agent://ns/a", &discovery, &network).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        a.subscribe(Subscription::new("agent://ns/a", "catch-all"), move |_env: MessageEnvelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });

        let rx = a.inner.pending.register("c-1", "agent://ns/b");
        let response =
            EnvelopeBuilder::response("agent://ns/b", "agent://ns/a", "c-1", json!("pong")).build();
        assert_eq!(
            a.handle_message(response).await.unwrap(),
            DispatchOutcome::ResponseMatched
        );
        assert_eq!(rx.await.unwrap().unwrap().payload, json!("pong"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Unsolicited responses fall through to subscriptions
        let stray =
            EnvelopeBuilder::response("agent://ns/b", "agent://ns/a", "c-2", json!("late")).build();
        assert_eq!(
            a.handle_message(stray).await.unwrap(),
            DispatchOutcome::Dispatched { handlers: 1, failures: 0 }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        a.close().await;
    }

    #[tokio::test]
    async fn test_command_error_becomes_error_payload() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let mut a_inbox = network.register("mem://ns/a");
        let a = client("agent://ns/a", &discovery, &network).await;
        let b = client("agent://ns/b", &discovery, &network).await;

        b.register_command("explode", |_input: Value| async move {
            Err::<Value, HandlerError>("kaboom".into())
        });

        let request = a
            .envelope("agent://ns/b", MessageType::Request, command_request("explode", json!(null)))
            .with_reply_to("agent://ns/a")
            .with_correlation_id("corr-1")
            .build();
        let outcome = b.handle_message(request).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::CommandHandled { command: "explode".into(), replied: true }
        );

        let response = tokio::time::timeout(Duration::from_secs(5), a_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(response.payload["error"]["code"], "TASK_REJECTED");
        assert_eq!(response.payload["error"]["message"], "kaboom");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_abort_siblings() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let a = client("agent://ns/a", &discovery, &network).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        a.subscribe(Subscription::new("alerts", "ok"), move |_env: MessageEnvelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });
        a.subscribe(Subscription::new("alerts", "bad"), |_env: MessageEnvelope| async move {
            Err::<(), HandlerError>("nope".into())
        });

        let event = EnvelopeBuilder::event("agent://ns/b", "topic://alerts", json!({})).build();
        assert_eq!(
            a.handle_message(event).await.unwrap(),
            DispatchOutcome::Dispatched { handlers: 2, failures: 1 }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(a.stats().await.metrics.handler_failures_total, 1);
        a.close().await;
    }

    #[tokio::test]
    async fn test_exactly_once_drops_duplicates() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let mut config = ClientConfig::default();
        config.reliability.delivery_guarantee = DeliveryGuarantee::ExactlyOnce;
        let a = client_with("agent://ns/a", &discovery, &network, config).await;

        let event = EnvelopeBuilder::event("agent://ns/b", "topic://alerts", json!({})).build();
        assert_eq!(a.handle_message(event.clone()).await.unwrap(), DispatchOutcome::Unhandled);
        assert_eq!(a.handle_message(event).await.unwrap(), DispatchOutcome::Duplicate);
        assert_eq!(a.stats().await.metrics.duplicates_dropped_total, 1);
        a.close().await;
    }

    #[tokio::test]
    async fn test_rejects_other_major_version() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let a = client("agent://ns/a", &discovery, &network).await;

        let mut event = EnvelopeBuilder::event("agent://ns/b", "agent://ns/a", json!({})).build();
        event.version = "ossa/a2a/v1.0.0".to_string();
        assert_eq!(
            a.handle_message(event).await.unwrap_err().code(),
            A2aErrorCode::UnsupportedVersion
        );
        a.close().await;
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_further_calls() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let a = client("agent://ns/a", &discovery, &network).await;

        let rx = a.inner.pending.register("c-1", "agent://ns/b");
        a.close().await;
        a.close().await;

        assert!(matches!(rx.await.unwrap(), Err(MeshError::Closed)));
        assert!(a.is_closed());
        let env = EnvelopeBuilder::event("agent://ns/a", "agent://ns/b", json!({})).build();
        assert!(matches!(a.send(env).await, Err(MeshError::Closed)));
    }

    #[tokio::test]
    async fn test_dead_letter_for_unknown_destination() {
        let discovery = Arc::new(Discovery::new());
        let network = InMemoryNetwork::new();
        let mut config = ClientConfig::default();
        config.reliability.dead_letter = Some(DeadLetterConfig::default());
        let a = client_with("agent://ns/a", &discovery, &network, config).await;
        let mut events = a.events();

        let id = a
            .send(a.envelope("agent://ns/ghost", MessageType::Event, json!({"x": 1})).build())
            .await
            .unwrap();

        let dead_lettered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(MeshEvent::MessageDeadLettered { message_id, .. }) = events.recv().await {
                    break message_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(dead_lettered, id.to_string());

        let store = a.dead_letters().unwrap();
        let records = store.get(id.as_str()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error.code, A2aErrorCode::AgentNotFound);
        assert_eq!(records[0].destination, "agent://ns/ghost");
        a.close().await;
    }
}
