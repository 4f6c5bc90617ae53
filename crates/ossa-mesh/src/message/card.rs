//! Agent Card: the self-describing record an agent publishes to discovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::envelope::PROTOCOL_VERSION;
use crate::types::{AddressError, AgentAddress};

/// Wire transport an agent can be reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Websocket,
    Grpc,
    /// In-process channels, for single-process meshes and tests
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Websocket => "websocket",
            Self::Grpc => "grpc",
            Self::Memory => "memory",
        };
        f.write_str(s)
    }
}

/// Authentication methods an agent accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    None,
    ApiKey,
    Bearer,
    Oauth2,
    Mtls,
}

/// Transport encryption requirement
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionRequirement {
    pub tls_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tls_version: Option<String>,
}

/// Health status reported for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Health snapshot with the last heartbeat time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub status: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
}

/// Capability and connectivity record for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// `agent://{namespace}/{name}`
    pub address: String,
    /// Human-readable name
    pub name: String,
    /// Semantic version of the agent itself
    pub version: String,
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Endpoint URL per transport kind
    #[serde(default)]
    pub endpoints: HashMap<TransportKind, String>,
    /// Supported transports in order of preference
    #[serde(default)]
    pub transports: Vec<TransportKind>,
    #[serde(default)]
    pub authentication: Vec<AuthMethod>,
    #[serde(default)]
    pub encryption: EncryptionRequirement,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<AgentHealth>,
}

impl AgentCard {
    /// Create a card for `address` with no endpoints yet
    pub fn new(address: &AgentAddress, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            name: name.into(),
            version: version.into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Vec::new(),
            endpoints: HashMap::new(),
            transports: Vec::new(),
            authentication: vec![AuthMethod::None],
            encryption: EncryptionRequirement::default(),
            metadata: HashMap::new(),
            health: None,
        }
    }

    /// Add a capability tag
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Add an endpoint; the transport is appended to the preference list
    pub fn with_endpoint(mut self, kind: TransportKind, url: impl Into<String>) -> Self {
        self.endpoints.insert(kind, url.into());
        if !self.transports.contains(&kind) {
            self.transports.push(kind);
        }
        self
    }

    pub fn with_authentication(mut self, methods: Vec<AuthMethod>) -> Self {
        self.authentication = methods;
        self
    }

    /// Require TLS, optionally with a minimum version such as `"1.2"`
    pub fn with_tls(mut self, min_version: Option<String>) -> Self {
        self.encryption = EncryptionRequirement {
            tls_required: true,
            min_tls_version: min_version,
        };
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parsed form of `address`
    pub fn agent_address(&self) -> Result<AgentAddress, AddressError> {
        AgentAddress::parse(&self.address)
    }

    pub fn endpoint(&self, kind: TransportKind) -> Option<&str> {
        self.endpoints.get(&kind).map(String::as_str)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Record a heartbeat, marking the agent healthy
    pub fn heartbeat(&mut self) {
        self.health = Some(AgentHealth {
            status: HealthStatus::Healthy,
            last_heartbeat: Utc::now(),
        });
    }

    /// Whether the last heartbeat is older than `max_age`
    ///
    /// Cards that never sent a heartbeat are never stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match &self.health {
            Some(health) => {
                let elapsed = Utc::now().signed_duration_since(health.last_heartbeat);
                elapsed.num_milliseconds() > max_age.as_millis() as i64
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> AgentAddress {
        AgentAddress::parse("agent://ns/worker").unwrap()
    }

    #[test]
    fn test_card_builder() {
        let card = AgentCard::new(&address(), "Worker", "1.2.0")
            .with_capability("summarize")
            .with_capability("summarize")
            .with_endpoint(TransportKind::Http, "http://localhost:8080")
            .with_endpoint(TransportKind::Memory, "memory://ns/worker")
            .with_tls(Some("1.3".into()));

        assert_eq!(card.capabilities, vec!["summarize"]);
        assert_eq!(card.transports, vec![TransportKind::Http, TransportKind::Memory]);
        assert_eq!(card.endpoint(TransportKind::Http), Some("http://localhost:8080"));
        assert!(card.encryption.tls_required);
        assert_eq!(card.agent_address().unwrap(), address());
    }

    #[test]
    fn test_card_serialization() {
        let card = AgentCard::new(&address(), "Worker", "1.0.0")
            .with_endpoint(TransportKind::Http, "http://localhost:8080");
        let value = serde_json::to_value(&card).unwrap();

        assert_eq!(value["address"], "agent://ns/worker");
        assert_eq!(value["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(value["endpoints"]["http"], "http://localhost:8080");
        assert_eq!(value["transports"][0], "http");
        assert_eq!(value["authentication"][0], "none");

        let back: AgentCard = serde_json::from_value(value).unwrap();
        assert_eq!(back, card);
    }

    #[test]
    fn test_staleness() {
        let mut card = AgentCard::new(&address(), "Worker", "1.0.0");
        assert!(!card.is_stale(Duration::from_secs(0)));

        card.heartbeat();
        assert!(!card.is_stale(Duration::from_secs(60)));

        if let Some(health) = card.health.as_mut() {
            health.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        }
        assert!(card.is_stale(Duration::from_secs(60)));
    }
}
