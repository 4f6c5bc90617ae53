//! Local dead-letter store
//!
//! Keeps a bounded, time-limited record of envelopes that exhausted delivery
//! so they can be inspected or replayed. The wrapper envelope published to the
//! dead-letter topic carries the same [`DeadLetterRecord`].

use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::DeadLetterConfig;
use crate::message::DeadLetterRecord;

/// Statistics for the dead-letter store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqStats {
    /// Records currently held
    pub current_size: usize,
    /// Records added (lifetime)
    pub total_added: u64,
    /// Records taken out for replay or removed explicitly
    pub total_removed: u64,
    /// Records dropped by retention expiry
    pub total_expired: u64,
    /// Records evicted to respect `max_entries`
    pub total_evicted: u64,
}

/// Bounded store of [`DeadLetterRecord`]s
pub struct DeadLetterStore {
    retention: Duration,
    max_entries: usize,
    records: RwLock<VecDeque<DeadLetterRecord>>,
    stats: RwLock<DlqStats>,
}

impl DeadLetterStore {
    pub fn new(config: &DeadLetterConfig) -> Self {
        Self {
            retention: Duration::seconds(config.retention_secs as i64),
            max_entries: config.max_entries.max(1),
            records: RwLock::new(VecDeque::new()),
            stats: RwLock::new(DlqStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&DeadLetterConfig::default())
    }

    fn is_expired(&self, record: &DeadLetterRecord) -> bool {
        Utc::now() > record.failed_at + self.retention
    }

    /// Add a record, evicting the oldest one when full
    pub async fn add(&self, record: DeadLetterRecord) {
        let mut records = self.records.write().await;
        let mut stats = self.stats.write().await;

        if records.len() >= self.max_entries {
            warn!("Dead-letter store full, evicting oldest record");
            records.pop_front();
            stats.total_evicted += 1;
        }

        debug!(
            message_id = %record.original.id,
            destination = %record.destination,
            "Stored dead-letter record"
        );
        records.push_back(record);
        stats.total_added += 1;
        stats.current_size = records.len();
    }

    /// All records, oldest first
    pub async fn list(&self) -> Vec<DeadLetterRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    /// Records for one original message id
    pub async fn get(&self, message_id: &str) -> Vec<DeadLetterRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.original.id.as_str() == message_id)
            .cloned()
            .collect()
    }

    /// Remove and return every record for `message_id`
    pub async fn take(&self, message_id: &str) -> Vec<DeadLetterRecord> {
        let mut records = self.records.write().await;
        let mut stats = self.stats.write().await;

        let (taken, kept): (Vec<_>, Vec<_>) = records
            .drain(..)
            .partition(|r| r.original.id.as_str() == message_id);
        records.extend(kept);

        if !taken.is_empty() {
            stats.total_removed += taken.len() as u64;
            stats.current_size = records.len();
            debug!(message_id = %message_id, count = taken.len(), "Removed dead-letter records");
        }
        taken
    }

    /// Drop records older than the retention window
    pub async fn cleanup_expired(&self) -> usize {
        let mut records = self.records.write().await;
        let mut stats = self.stats.write().await;

        let initial_len = records.len();
        records.retain(|record| !self.is_expired(record));
        let removed = initial_len - records.len();

        if removed > 0 {
            stats.total_expired += removed as u64;
            stats.current_size = records.len();
            debug!("Cleaned up {} expired dead-letter records", removed);
        }
        removed
    }

    pub async fn stats(&self) -> DlqStats {
        self.stats.read().await.clone()
    }

    pub async fn size(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn clear(&self) {
        let mut records = self.records.write().await;
        let mut stats = self.stats.write().await;
        let cleared = records.len();
        records.clear();
        stats.current_size = 0;
        debug!("Cleared {} dead-letter records", cleared);
    }

    /// Start periodic retention cleanup
    pub fn start_cleanup_task(
        self: Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup_expired().await;
            }
        })
    }
}
