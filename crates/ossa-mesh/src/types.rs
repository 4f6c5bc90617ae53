//! Address grammar for mesh communication
//!
//! Three mutually exclusive address families are recognised:
//!
//! | Family    | Grammar                      | Example                  |
//! |-----------|------------------------------|--------------------------|
//! | Direct    | `agent://{namespace}/{name}` | `agent://billing/ledger` |
//! | Topic     | `topic://{channel}`          | `topic://orders.created` |
//! | Broadcast | `broadcast://{namespace}/*`  | `broadcast://billing/*`  |
//!
//! Channels are dot-separated segments. In subscription patterns `*` matches
//! exactly one segment and `**` matches zero or more segments.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::MeshError;

pub const AGENT_SCHEME: &str = "agent://";
pub const TOPIC_SCHEME: &str = "topic://";
pub const BROADCAST_SCHEME: &str = "broadcast://";

/// Error type for address parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The address string is empty
    Empty,
    /// The scheme is not one of `agent://`, `topic://`, `broadcast://`
    UnknownScheme(String),
    /// A component is missing (e.g. `agent://ns`)
    MissingComponent(&'static str),
    /// A component contains characters outside the allowed set
    InvalidCharacters(&'static str),
    /// Broadcast addresses must end in `/*`
    MissingBroadcastWildcard,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "address cannot be empty"),
            Self::UnknownScheme(s) => write!(f, "unknown address scheme in '{}'", s),
            Self::MissingComponent(c) => write!(f, "address is missing its {}", c),
            Self::InvalidCharacters(c) => write!(
                f,
                "{} can only contain alphanumeric characters, hyphens, underscores, and dots",
                c
            ),
            Self::MissingBroadcastWildcard => {
                write!(f, "broadcast address must have the form broadcast://{{namespace}}/*")
            }
        }
    }
}

impl std::error::Error for AddressError {}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.chars().all(|c| c == '.')
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_channel(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|segment| {
            segment == "*"
                || segment == "**"
                || (!segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '-' || c == '_'))
        })
}

/// Direct address of one agent: `agent://{namespace}/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentAddress {
    namespace: String,
    name: String,
}

impl AgentAddress {
    /// Build an address from validated components
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, AddressError> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() {
            return Err(AddressError::MissingComponent("namespace"));
        }
        if name.is_empty() {
            return Err(AddressError::MissingComponent("name"));
        }
        if !is_identifier(&namespace) {
            return Err(AddressError::InvalidCharacters("namespace"));
        }
        if !is_identifier(&name) {
            return Err(AddressError::InvalidCharacters("name"));
        }
        Ok(Self { namespace, name })
    }

    /// Parse `agent://{namespace}/{name}`
    ///
    /// # Examples
    ///
    /// ```
    /// use ossa_mesh::AgentAddress;
    ///
    /// let addr = AgentAddress::parse("agent://billing/ledger").unwrap();
    /// assert_eq!(addr.namespace(), "billing");
    /// assert_eq!(addr.name(), "ledger");
    ///
    /// assert!(AgentAddress::parse("agent://billing").is_err());
    /// assert!(AgentAddress::parse("topic://billing").is_err());
    /// ```
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let rest = address
            .strip_prefix(AGENT_SCHEME)
            .ok_or_else(|| AddressError::UnknownScheme(address.to_string()))?;
        let (namespace, name) = rest
            .split_once('/')
            .ok_or(AddressError::MissingComponent("name"))?;
        if name.contains('/') {
            return Err(AddressError::InvalidCharacters("name"));
        }
        Self::new(namespace, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", AGENT_SCHEME, self.namespace, self.name)
    }
}

impl FromStr for AgentAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Topic address: `topic://{channel}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    channel: String,
}

impl TopicAddress {
    /// Build a topic address from a channel name or pattern
    pub fn new(channel: impl Into<String>) -> Result<Self, AddressError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(AddressError::MissingComponent("channel"));
        }
        if !is_channel(&channel) {
            return Err(AddressError::InvalidCharacters("channel"));
        }
        Ok(Self { channel })
    }

    /// Parse `topic://{channel}`
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let channel = address
            .strip_prefix(TOPIC_SCHEME)
            .ok_or_else(|| AddressError::UnknownScheme(address.to_string()))?;
        Self::new(channel)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl fmt::Display for TopicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TOPIC_SCHEME, self.channel)
    }
}

/// Namespace-wide fan-out address: `broadcast://{namespace}/*`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BroadcastAddress {
    namespace: String,
}

impl BroadcastAddress {
    pub fn new(namespace: impl Into<String>) -> Result<Self, AddressError> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(AddressError::MissingComponent("namespace"));
        }
        if !is_identifier(&namespace) {
            return Err(AddressError::InvalidCharacters("namespace"));
        }
        Ok(Self { namespace })
    }

    /// Parse `broadcast://{namespace}/*`
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let rest = address
            .strip_prefix(BROADCAST_SCHEME)
            .ok_or_else(|| AddressError::UnknownScheme(address.to_string()))?;
        let namespace = rest
            .strip_suffix("/*")
            .ok_or(AddressError::MissingBroadcastWildcard)?;
        Self::new(namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Channel name subscribers use to receive this broadcast
    pub fn channel(&self) -> String {
        format!("{}.*", self.namespace)
    }
}

impl fmt::Display for BroadcastAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/*", BROADCAST_SCHEME, self.namespace)
    }
}

/// Any of the three address families
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Agent(AgentAddress),
    Topic(TopicAddress),
    Broadcast(BroadcastAddress),
}

impl Address {
    /// Classify and parse an address string
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        if address.starts_with(AGENT_SCHEME) {
            AgentAddress::parse(address).map(Self::Agent)
        } else if address.starts_with(TOPIC_SCHEME) {
            TopicAddress::parse(address).map(Self::Topic)
        } else if address.starts_with(BROADCAST_SCHEME) {
            BroadcastAddress::parse(address).map(Self::Broadcast)
        } else {
            Err(AddressError::UnknownScheme(address.to_string()))
        }
    }

    /// Parse, mapping failures onto the mesh's addressing errors
    ///
    /// Strings that look like agent addresses (or carry no known scheme) map
    /// to `AgentNotFound`; topic and broadcast strings map to `TopicNotFound`.
    pub fn resolve(address: &str) -> Result<Self, MeshError> {
        Self::parse(address).map_err(|e| {
            if address.starts_with(TOPIC_SCHEME) || address.starts_with(BROADCAST_SCHEME) {
                MeshError::TopicNotFound(format!("{}: {}", address, e))
            } else {
                MeshError::AgentNotFound(format!("{}: {}", address, e))
            }
        })
    }

    /// Channel used for local subscription dispatch
    ///
    /// Topic addresses yield their channel, broadcasts yield `{namespace}.*`
    /// and direct addresses yield the full address string.
    pub fn channel(&self) -> String {
        match self {
            Self::Agent(a) => a.to_string(),
            Self::Topic(t) => t.channel().to_string(),
            Self::Broadcast(b) => b.channel(),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(a) => a.fmt(f),
            Self::Topic(t) => t.fmt(f),
            Self::Broadcast(b) => b.fmt(f),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Decide whether a concrete channel satisfies a subscription pattern
///
/// Segments are separated by `.`. `*` consumes exactly one segment, `**`
/// consumes zero or more. Any other segment must match literally.
///
/// ```
/// use ossa_mesh::matches_pattern;
///
/// assert!(matches_pattern("orders.*", "orders.created"));
/// assert!(!matches_pattern("orders.*", "orders.eu.created"));
/// assert!(matches_pattern("orders.**", "orders.eu.created"));
/// assert!(matches_pattern("orders.**", "orders"));
/// ```
pub fn matches_pattern(pattern: &str, channel: &str) -> bool {
    if pattern == channel {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let channel: Vec<&str> = channel.split('.').collect();
    match_segments(&pattern, &channel)
}

fn match_segments(pattern: &[&str], channel: &[&str]) -> bool {
    match pattern.split_first() {
        None => channel.is_empty(),
        Some((&"**", rest)) => (0..=channel.len()).any(|skip| match_segments(rest, &channel[skip..])),
        Some((&segment, rest)) => match channel.split_first() {
            Some((&head, tail)) => (segment == "*" || segment == head) && match_segments(rest, tail),
            None => false,
        },
    }
}
