//! Error types for mesh operations
//!
//! [`MeshError`] is what the Rust API returns. [`A2aErrorCode`] and
//! [`A2aError`] are the closed wire vocabulary that crosses agent boundaries,
//! e.g. inside dead-letter records or error-shaped command responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Wire-level error codes shared by every agent in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum A2aErrorCode {
    AgentNotFound,
    AgentUnreachable,
    TopicNotFound,
    AuthRequired,
    AuthFailed,
    AuthExpired,
    InsufficientPermissions,
    InvalidMessage,
    MessageExpired,
    MessageTooLarge,
    TaskRejected,
    TaskTimeout,
    TaskCancelled,
    UnsupportedVersion,
    UnsupportedTransport,
    RateLimited,
}

impl A2aErrorCode {
    /// Wire representation of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::AgentUnreachable => "AGENT_UNREACHABLE",
            Self::TopicNotFound => "TOPIC_NOT_FOUND",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::MessageExpired => "MESSAGE_EXPIRED",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::TaskRejected => "TASK_REJECTED",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::TaskCancelled => "TASK_CANCELLED",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::UnsupportedTransport => "UNSUPPORTED_TRANSPORT",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    /// Parse a wire code, returning `None` for codes outside the enumeration
    pub fn parse(code: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(code.to_string())).ok()
    }
}

impl fmt::Display for A2aErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error record exchanged between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aError {
    pub code: A2aErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Suggested wait before retrying, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl A2aError {
    /// Create a new error record stamped with the current time
    pub fn new(code: A2aErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            retry_after: None,
            details: None,
        }
    }

    /// Attach a retry-after hint
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for A2aError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors that can occur during mesh operations
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    /// Address does not resolve to a registered agent, or is not an agent address
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Address is not a valid topic or broadcast expression
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Agent is registered but exposes no endpoint we can reach
    #[error("Agent unreachable: {address} ({reason})")]
    AgentUnreachable { address: String, reason: String },

    /// None of the agent's transports is available locally
    #[error("Unsupported transport for {address}: {transports}")]
    UnsupportedTransport { address: String, transports: String },

    /// A single transport attempt failed
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
        retry_after: Option<u64>,
    },

    /// Delivery exhausted its retry budget
    #[error("Delivery to {destination} failed after {attempts} attempt(s): {last_error}")]
    DeliveryFailed {
        destination: String,
        attempts: u32,
        last_error: String,
    },

    /// Message outlived its time-to-live
    #[error("Message {0} expired")]
    MessageExpired(String),

    /// Envelope carries an incompatible protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Envelope failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Serialized envelope exceeds the configured limit
    #[error("Message too large: {size} bytes (limit: {limit} bytes)")]
    MessageTooLarge { size: usize, limit: usize },

    /// Outbound queue is at capacity
    #[error("Queue full: capacity {capacity}, current size {current}")]
    QueueFull { capacity: usize, current: usize },

    /// Request did not receive a response in time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The remote handler answered with an error-shaped payload
    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    /// A local subscription or command handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// The client was closed
    #[error("Mesh client is closed")]
    Closed,

    /// Message serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshError {
    /// Create a transport error without HTTP details
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Map onto the closed wire enumeration
    pub fn code(&self) -> A2aErrorCode {
        match self {
            Self::AgentNotFound(_) => A2aErrorCode::AgentNotFound,
            Self::TopicNotFound(_) => A2aErrorCode::TopicNotFound,
            Self::AgentUnreachable { .. } | Self::DeliveryFailed { .. } => {
                A2aErrorCode::AgentUnreachable
            }
            Self::UnsupportedTransport { .. } => A2aErrorCode::UnsupportedTransport,
            Self::Transport { status, .. } => match status {
                Some(401) => A2aErrorCode::AuthRequired,
                Some(403) => A2aErrorCode::InsufficientPermissions,
                Some(404) => A2aErrorCode::AgentNotFound,
                Some(413) => A2aErrorCode::MessageTooLarge,
                Some(429) => A2aErrorCode::RateLimited,
                _ => A2aErrorCode::AgentUnreachable,
            },
            Self::MessageExpired(_) => A2aErrorCode::MessageExpired,
            Self::UnsupportedVersion(_) => A2aErrorCode::UnsupportedVersion,
            Self::InvalidMessage(_) | Self::SerializationFailed(_) | Self::InvalidConfig(_) => {
                A2aErrorCode::InvalidMessage
            }
            Self::MessageTooLarge { .. } => A2aErrorCode::MessageTooLarge,
            Self::QueueFull { .. } => A2aErrorCode::RateLimited,
            Self::Timeout(_) => A2aErrorCode::TaskTimeout,
            Self::Remote { code, .. } => {
                A2aErrorCode::parse(code).unwrap_or(A2aErrorCode::TaskRejected)
            }
            Self::Handler(_) => A2aErrorCode::TaskRejected,
            Self::Closed => A2aErrorCode::TaskCancelled,
        }
    }

    /// Whether the delivery loop should retry after this error
    ///
    /// Only transport failures (connect, timeout, any non-2xx status) are
    /// retried. Addressing and protocol errors fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Suggested retry delay in seconds, if the remote supplied one
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convert into the wire error record
    pub fn to_a2a_error(&self) -> A2aError {
        let mut err = A2aError::new(self.code(), self.to_string());
        if let Some(seconds) = self.retry_after() {
            err = err.with_retry_after(seconds);
        }
        err
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationFailed(err.to_string())
    }
}

impl From<A2aError> for MeshError {
    fn from(err: A2aError) -> Self {
        MeshError::Remote {
            code: err.code.to_string(),
            message: err.message,
        }
    }
}
