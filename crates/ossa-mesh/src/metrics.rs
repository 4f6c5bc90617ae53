//! Metrics collection for mesh clients
//!
//! Counters use saturating arithmetic. Per-channel counts are capped to keep
//! cardinality bounded; agent addresses are never used as keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Counters for one client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshMetrics {
    /// Envelopes accepted by `send` (including requests and commands)
    pub messages_sent_total: u64,
    /// Inbound envelopes handled
    pub messages_received_total: u64,
    pub messages_published_total: u64,
    pub messages_broadcast_total: u64,
    /// Successful per-destination deliveries
    pub deliveries_total: u64,
    /// Destinations that exhausted their retry budget
    pub delivery_failures_total: u64,
    /// Attempts beyond the first
    pub retries_total: u64,
    /// Envelopes dropped by the TTL check
    pub expired_total: u64,
    pub dead_lettered_total: u64,
    /// Subscription or command handlers that returned an error
    pub handler_failures_total: u64,
    /// Inbound duplicates dropped under exactly-once delivery
    pub duplicates_dropped_total: u64,
    /// Published envelopes per topic channel (cardinality limited)
    pub channel_counts: HashMap<String, u64>,
    /// Per-destination delivery latency, including retries
    pub delivery_latency_ms: LatencyStats,
}

/// Latency statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Metrics collector with cardinality limits
#[derive(Clone)]
pub struct MeshMetricsCollector {
    metrics: Arc<RwLock<MeshMetrics>>,
    /// Maximum number of channels to track
    max_channels: usize,
    latency_samples: Arc<RwLock<Vec<u64>>>,
    max_samples: usize,
}

impl Default for MeshMetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MeshMetricsCollector {
    pub fn new(max_channels: usize, max_samples: usize) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(MeshMetrics::default())),
            max_channels,
            latency_samples: Arc::new(RwLock::new(Vec::new())),
            max_samples,
        }
    }

    /// Create with default limits
    pub fn with_defaults() -> Self {
        Self::new(20, 1000)
    }

    async fn bump(&self, field: impl FnOnce(&mut MeshMetrics) -> &mut u64) {
        let mut metrics = self.metrics.write().await;
        let counter = field(&mut *metrics);
        *counter = counter.saturating_add(1);
    }

    pub async fn record_send(&self) {
        self.bump(|m| &mut m.messages_sent_total).await;
    }

    pub async fn record_receive(&self) {
        self.bump(|m| &mut m.messages_received_total).await;
    }

    /// Record a publish to a topic channel
    pub async fn record_publish(&self, channel: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.messages_published_total = metrics.messages_published_total.saturating_add(1);

        if metrics.channel_counts.contains_key(channel)
            || metrics.channel_counts.len() < self.max_channels
        {
            let count = metrics.channel_counts.entry(channel.to_string()).or_insert(0);
            *count = count.saturating_add(1);
        }
    }

    pub async fn record_broadcast(&self) {
        self.bump(|m| &mut m.messages_broadcast_total).await;
    }

    /// Record a successful delivery and its latency
    pub async fn record_delivery(&self, latency: Duration) {
        self.bump(|m| &mut m.deliveries_total).await;
        self.record_latency(latency.as_millis() as u64).await;
    }

    pub async fn record_delivery_failure(&self) {
        self.bump(|m| &mut m.delivery_failures_total).await;
    }

    pub async fn record_retry(&self) {
        self.bump(|m| &mut m.retries_total).await;
    }

    pub async fn record_expired(&self) {
        self.bump(|m| &mut m.expired_total).await;
    }

    pub async fn record_dead_letter(&self) {
        self.bump(|m| &mut m.dead_lettered_total).await;
    }

    pub async fn record_handler_failure(&self) {
        self.bump(|m| &mut m.handler_failures_total).await;
    }

    pub async fn record_duplicate(&self) {
        self.bump(|m| &mut m.duplicates_dropped_total).await;
    }

    async fn record_latency(&self, duration_ms: u64) {
        let mut samples = self.latency_samples.write().await;
        samples.push(duration_ms);

        // Keep only recent samples
        if samples.len() > self.max_samples {
            let drain_count = samples.len() - self.max_samples;
            samples.drain(0..drain_count);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_unstable();

        let Some(&max) = sorted.last() else {
            return;
        };
        let at = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)] as f64;

        let mut metrics = self.metrics.write().await;
        metrics.delivery_latency_ms = LatencyStats {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: max as f64,
        };
    }

    /// Get current metrics snapshot
    pub async fn snapshot(&self) -> MeshMetrics {
        self.metrics.read().await.clone()
    }

    /// Reset all metrics
    pub async fn reset(&self) {
        *self.metrics.write().await = MeshMetrics::default();
        self.latency_samples.write().await.clear();
    }
}
