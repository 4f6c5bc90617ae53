//! Outbound processing loop.
//!
//! A ticker drives the loop. Each tick takes at most one envelope off the
//! priority queue, guarded so a slow tick never overlaps the next one. With
//! ordering enabled deliveries run inline; otherwise each destination gets its
//! own task so one slow destination does not hold up the rest.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::ClientInner;
use super::delivery::send_with_retry;
use crate::discovery::resolve_endpoint;
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::message::{DeadLetterRecord, EnvelopeBuilder, MessageEnvelope};
use crate::types::Address;

/// Clears the processing flag when a tick ends or is cancelled
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawn the ticker; it exits on shutdown or once the client is dropped
pub(super) fn spawn(
    inner: Weak<ClientInner>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.process_next().await;
                }
            }
        }
        debug!("Scheduler stopped");
    });
}

impl ClientInner {
    /// Take one envelope off the queue and process it
    ///
    /// Returns `false` when the queue was empty or another tick is still
    /// processing.
    pub(super) async fn process_next(self: &Arc<Self>) -> bool {
        if self.processing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _guard = ProcessingGuard(&self.processing);

        let Some(envelope) = self.queue.dequeue().await else {
            return false;
        };
        self.process_envelope(envelope).await;
        true
    }

    /// TTL check, routing and delivery for one envelope
    ///
    /// Never returns an error: every failure is logged and reported as an
    /// event so the loop keeps going.
    pub(super) async fn process_envelope(self: &Arc<Self>, envelope: MessageEnvelope) {
        if envelope.is_expired_at(Utc::now()) {
            warn!(
                message_id = %envelope.id,
                to = %envelope.to,
                ttl = envelope.ttl,
                "Dropping expired message"
            );
            self.metrics.record_expired().await;
            self.events.emit(MeshEvent::MessageExpired {
                message_id: envelope.id.to_string(),
                to: envelope.to.clone(),
            });
            return;
        }

        let destinations = match self.destinations(&envelope).await {
            Ok(destinations) => destinations,
            Err(e) => {
                error!(message_id = %envelope.id, to = %envelope.to, error = %e, "Routing failed");
                self.events.emit(MeshEvent::MessageFailed {
                    message_id: envelope.id.to_string(),
                    destination: envelope.to.clone(),
                    code: e.code(),
                    error: e.to_string(),
                });
                return;
            }
        };

        if destinations.is_empty() {
            debug!(message_id = %envelope.id, to = %envelope.to, "No destinations");
            return;
        }

        if self.config.reliability.ordered() {
            for destination in destinations {
                self.deliver(&envelope, &destination).await;
            }
        } else {
            let envelope = Arc::new(envelope);
            for destination in destinations {
                let inner = Arc::clone(self);
                let envelope = Arc::clone(&envelope);
                tokio::spawn(async move {
                    inner.deliver(&envelope, &destination).await;
                });
            }
        }
    }

    /// Router output, plus registered namespace peers for broadcasts
    async fn destinations(&self, envelope: &MessageEnvelope) -> MeshResult<Vec<String>> {
        let mut destinations: BTreeSet<String> =
            self.router.route(envelope)?.into_iter().collect();

        if let Address::Broadcast(broadcast) = Address::resolve(&envelope.to)? {
            for card in self.discovery.list_namespace(broadcast.namespace()).await? {
                if card.address != envelope.from {
                    destinations.insert(card.address);
                }
            }
        }
        Ok(destinations.into_iter().collect())
    }

    /// Resolve, send with retry, then report or dead-letter
    async fn deliver(self: &Arc<Self>, envelope: &MessageEnvelope, destination: &str) {
        let started = Instant::now();
        let (attempts, result) = match self.resolve_transport(destination).await {
            Ok((transport, endpoint)) => {
                let report = send_with_retry(
                    transport.as_ref(),
                    &endpoint,
                    destination,
                    envelope,
                    &self.config.reliability,
                    &self.metrics,
                )
                .await;
                (report.attempts, report.result)
            }
            Err(e) => (0, Err(e)),
        };

        match result {
            Ok(()) => {
                debug!(
                    message_id = %envelope.id,
                    destination = %destination,
                    attempts,
                    "Delivered"
                );
                self.metrics.record_delivery(started.elapsed()).await;
                self.events.emit(MeshEvent::MessageDelivered {
                    message_id: envelope.id.to_string(),
                    destination: destination.to_string(),
                    attempts,
                });
            }
            Err(e) => {
                warn!(
                    message_id = %envelope.id,
                    destination = %destination,
                    attempts,
                    error = %e,
                    "Delivery failed"
                );
                self.metrics.record_delivery_failure().await;
                self.events.emit(MeshEvent::MessageFailed {
                    message_id: envelope.id.to_string(),
                    destination: destination.to_string(),
                    code: e.code(),
                    error: e.to_string(),
                });
                self.dead_letter(envelope, destination, &e, attempts).await;
            }
        }
    }

    async fn resolve_transport(
        &self,
        destination: &str,
    ) -> MeshResult<(Arc<dyn crate::transport::Transport>, String)> {
        let card = self
            .discovery
            .discover_by_uri(destination)
            .await?
            .ok_or_else(|| MeshError::AgentNotFound(destination.to_string()))?;

        let available: Vec<_> = self.transports.keys().copied().collect();
        let (kind, endpoint) = resolve_endpoint(&card, &available)?;
        let transport = self
            .transports
            .get(&kind)
            .cloned()
            .ok_or_else(|| MeshError::UnsupportedTransport {
                address: destination.to_string(),
                transports: kind.to_string(),
            })?;
        Ok((transport, endpoint))
    }

    /// Publish a wrapper envelope to the dead-letter topic and keep a local
    /// record; failures here are logged and swallowed
    async fn dead_letter(
        &self,
        envelope: &MessageEnvelope,
        destination: &str,
        error: &MeshError,
        attempts: u32,
    ) {
        let Some(config) = &self.config.reliability.dead_letter else {
            return;
        };
        if envelope.to == config.channel {
            warn!(message_id = %envelope.id, "Dead-letter wrapper undeliverable, dropping");
            return;
        }

        let record = DeadLetterRecord {
            original: envelope.clone(),
            error: error.to_a2a_error(),
            destination: destination.to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        if let Some(store) = &self.dead_letters {
            store.add(record.clone()).await;
        }

        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(message_id = %envelope.id, error = %e, "Failed to encode dead-letter record");
                return;
            }
        };
        let wrapper = EnvelopeBuilder::event(self.address.clone(), config.channel.clone(), payload)
            .with_priority(envelope.priority)
            .with_ttl(config.retention_secs.max(1))
            .with_correlation_id(envelope.id.to_string())
            .build();

        match self.queue.enqueue(wrapper).await {
            Ok(()) => {
                self.metrics.record_dead_letter().await;
                self.events.emit(MeshEvent::MessageDeadLettered {
                    message_id: envelope.id.to_string(),
                    destination: destination.to_string(),
                    channel: config.channel.clone(),
                });
            }
            Err(e) => {
                warn!(message_id = %envelope.id, error = %e, "Failed to enqueue dead-letter wrapper");
            }
        }
    }
}
