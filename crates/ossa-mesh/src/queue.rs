//! Strict-priority outbound queue
//!
//! Five lanes served in fixed precedence: urgent, critical, high, normal, low.
//! The scheduler is strict, not weighted and not aging, so a continuous
//! stream of urgent envelopes starves the low lane indefinitely. Fairness is
//! a non-goal.

use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::message::{MessageEnvelope, Priority};

/// Fraction of capacity at which a warning is logged
const WARNING_RATIO: f64 = 0.8;

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Current queue depth
    pub current_depth: usize,
    /// Maximum depth observed
    pub max_depth: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    /// Enqueues refused because the queue was full
    pub total_rejected: u64,
    /// Times the depth crossed the warning threshold
    pub warning_count: u64,
}

#[derive(Default)]
struct Lanes {
    lanes: [VecDeque<MessageEnvelope>; 5],
    stats: QueueStats,
}

impl Lanes {
    fn depth(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Priority queue of envelopes awaiting delivery
pub struct PriorityQueue {
    inner: RwLock<Lanes>,
    capacity: Option<usize>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl PriorityQueue {
    /// Create a queue refusing enqueues beyond `capacity`
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Lanes::default()),
            capacity: Some(capacity),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            inner: RwLock::new(Lanes::default()),
            capacity: None,
        }
    }

    /// Create from an optional capacity
    pub fn new(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::with_capacity(capacity),
            None => Self::unbounded(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append to the lane matching the envelope's priority
    pub async fn enqueue(&self, envelope: MessageEnvelope) -> MeshResult<()> {
        let mut inner = self.inner.write().await;
        let depth = inner.depth();

        if let Some(capacity) = self.capacity {
            if depth >= capacity {
                inner.stats.total_rejected += 1;
                warn!(
                    message_id = %envelope.id,
                    capacity,
                    "Outbound queue full, rejecting envelope"
                );
                return Err(MeshError::QueueFull {
                    capacity,
                    current: depth,
                });
            }
            let threshold = (capacity as f64 * WARNING_RATIO).ceil() as usize;
            if depth + 1 == threshold.max(1) {
                inner.stats.warning_count += 1;
                warn!(depth = depth + 1, capacity, "Outbound queue approaching capacity");
            }
        }

        let lane = envelope.priority.rank();
        debug!(message_id = %envelope.id, priority = %envelope.priority, "Enqueued envelope");
        inner.lanes[lane].push_back(envelope);

        let depth = depth + 1;
        inner.stats.total_enqueued += 1;
        inner.stats.current_depth = depth;
        inner.stats.max_depth = inner.stats.max_depth.max(depth);
        Ok(())
    }

    /// Remove the oldest envelope of the highest non-empty lane
    pub async fn dequeue(&self) -> Option<MessageEnvelope> {
        let mut inner = self.inner.write().await;
        let envelope = inner.lanes.iter_mut().find_map(VecDeque::pop_front)?;
        inner.stats.total_dequeued += 1;
        inner.stats.current_depth = inner.depth();
        Some(envelope)
    }

    /// Clone of the envelope `dequeue` would return next
    pub async fn peek(&self) -> Option<MessageEnvelope> {
        let inner = self.inner.read().await;
        inner.lanes.iter().find_map(|lane| lane.front().cloned())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.depth()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Depth of each lane, highest priority first
    pub async fn len_by_priority(&self) -> Vec<(Priority, usize)> {
        let inner = self.inner.read().await;
        Priority::ALL
            .iter()
            .map(|p| (*p, inner.lanes[p.rank()].len()))
            .collect()
    }

    /// Remove everything in dequeue order
    pub async fn drain(&self) -> Vec<MessageEnvelope> {
        let mut inner = self.inner.write().await;
        let drained: Vec<MessageEnvelope> = inner
            .lanes
            .iter_mut()
            .flat_map(|lane| lane.drain(..))
            .collect();
        inner.stats.total_dequeued += drained.len() as u64;
        inner.stats.current_depth = 0;
        drained
    }

    pub async fn stats(&self) -> QueueStats {
        self.inner.read().await.stats.clone()
    }
}
