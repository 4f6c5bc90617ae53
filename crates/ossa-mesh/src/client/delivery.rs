//! Per-destination delivery with retry and backoff.

use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ReliabilityConfig;
use crate::error::{MeshError, MeshResult};
use crate::message::MessageEnvelope;
use crate::metrics::MeshMetricsCollector;
use crate::transport::Transport;

/// Result of delivering one envelope to one destination
#[derive(Debug)]
pub(crate) struct DeliveryReport {
    /// Transport attempts made, including the first
    pub attempts: u32,
    pub result: MeshResult<()>,
}

/// Deliver `envelope` to `endpoint`, retrying retryable failures
///
/// Sleeps between attempts follow the reliability policy, except that a
/// remote `Retry-After` hint replaces the computed delay (still capped at the
/// policy's maximum). Non-retryable errors stop immediately. Exhausting the
/// budget yields [`MeshError::DeliveryFailed`].
pub(crate) async fn send_with_retry(
    transport: &dyn Transport,
    endpoint: &str,
    destination: &str,
    envelope: &MessageEnvelope,
    reliability: &ReliabilityConfig,
    metrics: &MeshMetricsCollector,
) -> DeliveryReport {
    let policy = reliability.effective_retry();
    let max_attempts = policy.max_attempts.max(1);
    let ack_timeout = reliability.ack_timeout();
    let mut outgoing = envelope.clone();

    for attempt in 1..=max_attempts {
        outgoing.metadata.retry_count = attempt - 1;

        let result = match ack_timeout {
            Some(limit) => tokio::time::timeout(limit, transport.send(endpoint, &outgoing))
                .await
                .unwrap_or_else(|_| {
                    Err(MeshError::transport(format!(
                        "no acknowledgment within {:?}",
                        limit
                    )))
                }),
            None => transport.send(endpoint, &outgoing).await,
        };

        let error = match result {
            Ok(()) => {
                return DeliveryReport {
                    attempts: attempt,
                    result: Ok(()),
                };
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            warn!(
                message_id = %envelope.id,
                destination = %destination,
                attempt,
                error = %error,
                "Delivery failed with non-retryable error"
            );
            return DeliveryReport {
                attempts: attempt,
                result: Err(error),
            };
        }

        if attempt == max_attempts {
            return DeliveryReport {
                attempts: attempt,
                result: Err(MeshError::DeliveryFailed {
                    destination: destination.to_string(),
                    attempts: attempt,
                    last_error: error.to_string(),
                }),
            };
        }

        let delay = match error.retry_after() {
            Some(seconds) => {
                Duration::from_secs(seconds).min(Duration::from_millis(policy.max_delay_ms))
            }
            None => policy.delay_for(attempt),
        };
        debug!(
            message_id = %envelope.id,
            destination = %destination,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery attempt failed, backing off"
        );
        metrics.record_retry().await;
        tokio::time::sleep(delay).await;
    }

    // max_attempts >= 1, so the loop always returns
    DeliveryReport {
        attempts: max_attempts,
        result: Err(MeshError::DeliveryFailed {
            destination: destination.to_string(),
            attempts: max_attempts,
            last_error: "no attempt made".to_string(),
        }),
    }
}
