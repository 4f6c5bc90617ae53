//! Message model shared by every mesh component.
//!
//! - `MessageEnvelope` - the versioned unit of exchange
//! - `EnvelopeBuilder` - fluent construction
//! - `AgentCard` - the descriptor an agent publishes to discovery
//! - `DeadLetterRecord` - wrapper payload for messages that exhausted delivery

mod builder;
mod card;
mod envelope;

pub use builder::EnvelopeBuilder;
pub use card::{
    AgentCard, AgentHealth, AuthMethod, EncryptionRequirement, HealthStatus, TransportKind,
};
pub use envelope::{
    DEFAULT_TTL_SECS, EnvelopeMetadata, MessageEnvelope, MessageId, MessageType,
    PROTOCOL_VERSION, Priority, TraceContext,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::A2aError;

/// Payload of the envelope published to a dead-letter channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original: MessageEnvelope,
    pub error: A2aError,
    pub destination: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::A2aErrorCode;
    use crate::types::{Address, AgentAddress};
    use serde_json::json;

    #[test]
    fn test_builder() {
        let env = EnvelopeBuilder::request("agent://ns/a", "agent://ns/b", json!({"q": 1}))
            .with_correlation_id("c-1")
            .with_reply_to("agent://ns/a")
            .with_priority(Priority::High)
            .with_ttl(30)
            .with_header("tenant", "acme")
            .with_content_type("application/json")
            .build();

        assert_eq!(env.message_type, MessageType::Request);
        assert_eq!(env.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(env.priority, Priority::High);
        assert_eq!(env.ttl, 30);
        assert_eq!(env.header("tenant"), Some("acme"));
        assert_eq!(env.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_serialize_then_parse_each_address_family() {
        for to in ["agent://a/b", "topic://c", "broadcast://a/*"] {
            let env = EnvelopeBuilder::event("agent://a/sender", to, json!({})).build();
            let parsed = MessageEnvelope::from_json(&env.to_json().unwrap()).unwrap();

            match Address::parse(&parsed.to).unwrap() {
                Address::Agent(agent) => {
                    assert_eq!(agent, AgentAddress::parse("agent://a/b").unwrap());
                    assert_eq!((agent.namespace(), agent.name()), ("a", "b"));
                }
                Address::Topic(topic) => assert_eq!(topic.channel(), "c"),
                Address::Broadcast(b) => assert_eq!(b.namespace(), "a"),
            }
        }
    }

    #[test]
    fn test_dead_letter_record_shape() {
        let original = EnvelopeBuilder::event("agent://ns/a", "agent://ns/b", json!({"x": 1})).build();
        let record = DeadLetterRecord {
            original: original.clone(),
            error: A2aError::new(A2aErrorCode::AgentUnreachable, "connection refused"),
            destination: "agent://ns/b".into(),
            attempts: 3,
            failed_at: Utc::now(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["original"]["payload"]["x"], 1);
        assert_eq!(value["error"]["code"], "AGENT_UNREACHABLE");
        assert_eq!(value["attempts"], 3);
        assert!(value.get("failedAt").is_some());
    }
}
