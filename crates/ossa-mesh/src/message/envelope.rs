//! The message envelope exchanged between agents.
//!
//! Envelopes serialize to the JSON wire document every transport carries:
//!
//! ```json
//! {
//!   "version": "ossa/a2a/v0.3.0",
//!   "id": "8d0c3f0e-...",
//!   "timestamp": "2026-01-01T00:00:00Z",
//!   "from": "agent://ns/a",
//!   "to": "agent://ns/b",
//!   "type": "request",
//!   "payload": {"command": "ping", "input": {}},
//!   "correlationId": "8d0c3f0e-...",
//!   "replyTo": "agent://ns/a",
//!   "ttl": 300,
//!   "priority": "normal"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};

/// Protocol version stamped on every envelope this crate constructs
pub const PROTOCOL_VERSION: &str = "ossa/a2a/v0.3.0";

const VERSION_PREFIX: &str = "ossa/a2a/v";

/// Default time-to-live in seconds
pub const DEFAULT_TTL_SECS: u64 = 300;

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

/// Unique identifier for a message (UUID v4)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and validate a UUID-formatted message ID
    pub fn parse(id: impl AsRef<str>) -> MeshResult<Self> {
        let s = id.as_ref();
        Uuid::parse_str(s)
            .map_err(|_| MeshError::InvalidMessage(format!("invalid message id '{}'", s)))?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Interaction kind carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Command,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Command => "command",
        };
        f.write_str(s)
    }
}

/// Delivery priority, highest first: urgent > critical > high > normal > low
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities in strict precedence order
    pub const ALL: [Priority; 5] = [
        Priority::Urgent,
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Lane index; 0 is served first
    pub fn rank(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::Critical => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Urgent => "urgent",
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// W3C trace context propagated with an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Start a new sampled trace
    pub fn new_root() -> Self {
        let trace_id = Uuid::new_v4().simple().to_string();
        Self {
            traceparent: format!("00-{}-{}-01", trace_id, new_span_id()),
            tracestate: None,
        }
    }

    /// Derive a child context: same trace id and flags, fresh span id
    pub fn child(&self) -> Self {
        let parts: Vec<&str> = self.traceparent.split('-').collect();
        let traceparent = match parts.as_slice() {
            [version, trace_id, _, flags] => {
                format!("{}-{}-{}-{}", version, trace_id, new_span_id(), flags)
            }
            _ => return Self::new_root(),
        };
        Self {
            traceparent,
            tracestate: self.tracestate.clone(),
        }
    }

    /// The 32-hex-digit trace id, if the traceparent is well formed
    pub fn trace_id(&self) -> Option<&str> {
        self.traceparent
            .split('-')
            .nth(1)
            .filter(|id| id.len() == 32)
    }
}

fn new_span_id() -> String {
    let mut span = Uuid::new_v4().simple().to_string();
    span.truncate(16);
    span
}

/// Optional transport-level metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl EnvelopeMetadata {
    fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.retry_count == 0 && self.content_type.is_none()
    }
}

/// The versioned unit of exchange between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub version: String,
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    /// Recipient address or topic expression
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Time-to-live in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
    #[serde(default, skip_serializing_if = "EnvelopeMetadata::is_empty")]
    pub metadata: EnvelopeMetadata,
}

impl MessageEnvelope {
    /// Create an envelope with defaults for every optional field
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: MessageId::new(),
            timestamp: Utc::now(),
            from: from.into(),
            to: to.into(),
            message_type,
            payload,
            correlation_id: None,
            reply_to: None,
            ttl: DEFAULT_TTL_SECS,
            priority: Priority::Normal,
            trace: None,
            metadata: EnvelopeMetadata::default(),
        }
    }

    /// Whether `now - timestamp` exceeds the time-to-live
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        let ttl_ms = i64::try_from(self.ttl)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        age.num_milliseconds() > ttl_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Look up a metadata header
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(String::as_str)
    }

    /// Check the envelope's protocol version against [`PROTOCOL_VERSION`]
    ///
    /// A different major version is rejected. A different minor or patch
    /// version is accepted with a warning.
    pub fn check_version(&self) -> MeshResult<()> {
        let theirs = parse_protocol_version(&self.version)?;
        let ours = parse_protocol_version(PROTOCOL_VERSION)?;

        if theirs.major != ours.major {
            return Err(MeshError::UnsupportedVersion(self.version.clone()));
        }
        if theirs.minor != ours.minor {
            warn!(
                message_id = %self.id,
                version = %self.version,
                expected = PROTOCOL_VERSION,
                "Envelope protocol minor version differs"
            );
        }
        Ok(())
    }

    /// Serialize to the JSON wire document
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON wire document
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Size of the serialized wire document in bytes
    pub fn encoded_len(&self) -> MeshResult<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

fn parse_protocol_version(version: &str) -> MeshResult<semver::Version> {
    let raw = version
        .strip_prefix(VERSION_PREFIX)
        .ok_or_else(|| MeshError::UnsupportedVersion(version.to_string()))?;
    semver::Version::parse(raw).map_err(|_| MeshError::UnsupportedVersion(version.to_string()))
}
