//! Operation events published by clients and routers.
//!
//! Event names are a stable contract for collaborators such as dashboards:
//! `message:queued`, `message:delivered`, `message:failed`, `message:expired`,
//! `message:received`, `message:dead-lettered`, `request:timeout`,
//! `rule:added`, `rule:removed`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::A2aErrorCode;
use crate::message::{MessageType, Priority};

/// Something observable happened inside the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum MeshEvent {
    #[serde(rename = "message:queued")]
    MessageQueued {
        message_id: String,
        to: String,
        priority: Priority,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        message_id: String,
        destination: String,
        attempts: u32,
    },
    #[serde(rename = "message:failed")]
    MessageFailed {
        message_id: String,
        destination: String,
        code: A2aErrorCode,
        error: String,
    },
    #[serde(rename = "message:expired")]
    MessageExpired { message_id: String, to: String },
    #[serde(rename = "message:received")]
    MessageReceived {
        message_id: String,
        from: String,
        message_type: MessageType,
    },
    #[serde(rename = "message:dead-lettered")]
    MessageDeadLettered {
        message_id: String,
        destination: String,
        channel: String,
    },
    #[serde(rename = "request:timeout")]
    RequestTimeout { correlation_id: String, to: String },
    #[serde(rename = "rule:added")]
    RuleAdded { rule_id: String, channel: String },
    #[serde(rename = "rule:removed")]
    RuleRemoved { rule_id: String },
}

impl MeshEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageQueued { .. } => "message:queued",
            Self::MessageDelivered { .. } => "message:delivered",
            Self::MessageFailed { .. } => "message:failed",
            Self::MessageExpired { .. } => "message:expired",
            Self::MessageReceived { .. } => "message:received",
            Self::MessageDeadLettered { .. } => "message:dead-lettered",
            Self::RequestTimeout { .. } => "request:timeout",
            Self::RuleAdded { .. } => "rule:added",
            Self::RuleRemoved { .. } => "rule:removed",
        }
    }
}

/// Fan-out channel for [`MeshEvent`]s
///
/// Slow receivers lag and lose the oldest events; emitting never blocks.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: MeshEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
