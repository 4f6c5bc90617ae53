//! Fluent envelope builder API.

use serde_json::Value;

use super::envelope::{MessageEnvelope, MessageType, Priority, TraceContext};

/// Builder for creating envelopes with a fluent API
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: MessageEnvelope,
}

impl EnvelopeBuilder {
    /// Start building an envelope of the given type
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            envelope: MessageEnvelope::new(from, to, message_type, payload),
        }
    }

    /// Create a fire-and-forget event builder
    pub fn event(from: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self::new(from, to, MessageType::Event, payload)
    }

    /// Create a request builder
    pub fn request(from: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self::new(from, to, MessageType::Request, payload)
    }

    /// Create a response builder answering `correlation_id`
    pub fn response(
        from: impl Into<String>,
        to: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(from, to, MessageType::Response, payload).with_correlation_id(correlation_id)
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.envelope.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply-to address
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.envelope.reply_to = Some(reply_to.into());
        self
    }

    /// Set time-to-live in seconds
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.envelope.ttl = ttl_secs;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.envelope.priority = priority;
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.envelope.trace = Some(trace);
        self
    }

    /// Add a metadata header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envelope.metadata.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.envelope.metadata.content_type = Some(content_type.into());
        self
    }

    /// Build the envelope
    pub fn build(self) -> MessageEnvelope {
        self.envelope
    }
}

impl From<EnvelopeBuilder> for MessageEnvelope {
    fn from(builder: EnvelopeBuilder) -> Self {
        builder.build()
    }
}
