//! Destination computation for outbound envelopes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::filter::MessageFilter;
use crate::error::MeshResult;
use crate::events::{EventBus, MeshEvent};
use crate::message::MessageEnvelope;
use crate::types::{Address, AgentAddress, TOPIC_SCHEME};

/// Source pattern matching any sender
pub const ANY_SOURCE: &str = "*";

/// Maps a topic channel to concrete target agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Synthesized from source, channel and creation time when left empty
    #[serde(default)]
    pub id: String,
    /// `*` or an exact sender address
    pub source: String,
    /// Topic channel, with or without the `topic://` scheme
    pub channel: String,
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MessageFilter>,
    /// Name of a transform applied by the collaborator that owns the rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl RoutingRule {
    /// Enabled rule from any source with no filter
    pub fn new(channel: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            id: String::new(),
            source: ANY_SOURCE.to_string(),
            channel: channel.into(),
            targets,
            filter: None,
            transform: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn applies_to(&self, envelope: &MessageEnvelope) -> bool {
        (self.source == ANY_SOURCE || self.source == envelope.from)
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(&envelope.payload))
    }
}

/// Counters exposed to dashboards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub direct_routed: u64,
    pub topic_routed: u64,
    pub broadcast_routed: u64,
    /// Topic or broadcast messages that resolved to no destination
    pub unroutable: u64,
}

#[derive(Debug, Default)]
struct RouterCounters {
    direct: AtomicU64,
    topic: AtomicU64,
    broadcast: AtomicU64,
    unroutable: AtomicU64,
}

/// Rule table plus the routing algorithm
pub struct Router {
    rules: DashMap<String, RoutingRule>,
    counters: RouterCounters,
    events: EventBus,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_events(EventBus::default())
    }

    /// Router publishing `rule:*` events on `events`
    pub fn with_events(events: EventBus) -> Self {
        Self {
            rules: DashMap::new(),
            counters: RouterCounters::default(),
            events,
        }
    }

    /// Add or replace a rule, returning its id
    pub fn add_rule(&self, mut rule: RoutingRule) -> MeshResult<String> {
        if let Some(filter) = &rule.filter {
            filter.validate()?;
        }
        rule.channel = rule
            .channel
            .strip_prefix(TOPIC_SCHEME)
            .unwrap_or(&rule.channel)
            .to_string();
        if rule.id.is_empty() {
            rule.id = self.synthesize_id(&rule);
        }

        let id = rule.id.clone();
        info!(
            rule_id = %id,
            source = %rule.source,
            channel = %rule.channel,
            targets = rule.targets.len(),
            "Adding routing rule"
        );
        self.events.emit(MeshEvent::RuleAdded {
            rule_id: id.clone(),
            channel: rule.channel.clone(),
        });
        self.rules.insert(id.clone(), rule);
        Ok(id)
    }

    fn synthesize_id(&self, rule: &RoutingRule) -> String {
        let stamp = rule
            .created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| rule.created_at.timestamp_micros());
        let base = format!("{}:{}:{}", rule.source, rule.channel, stamp);
        let mut id = base.clone();
        let mut n = 1;
        while self.rules.contains_key(&id) {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        id
    }

    pub fn remove_rule(&self, id: &str) -> Option<RoutingRule> {
        let removed = self.rules.remove(id).map(|(_, rule)| rule);
        if removed.is_some() {
            info!(rule_id = %id, "Removed routing rule");
            self.events.emit(MeshEvent::RuleRemoved {
                rule_id: id.to_string(),
            });
        }
        removed
    }

    pub fn get_rule(&self, id: &str) -> Option<RoutingRule> {
        self.rules.get(id).map(|entry| entry.value().clone())
    }

    /// All rules, oldest first
    pub fn get_rules(&self) -> Vec<RoutingRule> {
        let mut rules: Vec<RoutingRule> =
            self.rules.iter().map(|entry| entry.value().clone()).collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rules
    }

    /// Enable or disable a rule; returns `false` for unknown ids
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.rules.get_mut(id) {
            Some(mut rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Compute the deduplicated destination set for `envelope`
    ///
    /// Direct addresses bypass rule evaluation. Topics collect the targets of
    /// every enabled rule on that channel whose source and filter accept the
    /// envelope. Broadcasts collect every enabled rule target in the namespace.
    pub fn route(&self, envelope: &MessageEnvelope) -> MeshResult<Vec<String>> {
        let destinations: BTreeSet<String> = match Address::resolve(&envelope.to)? {
            Address::Agent(agent) => {
                self.counters.direct.fetch_add(1, Ordering::Relaxed);
                return Ok(vec![agent.to_string()]);
            }
            Address::Topic(topic) => {
                self.counters.topic.fetch_add(1, Ordering::Relaxed);
                self.rules
                    .iter()
                    .filter(|rule| rule.enabled && rule.channel == topic.channel())
                    .filter(|rule| rule.applies_to(envelope))
                    .flat_map(|rule| rule.targets.clone())
                    .collect()
            }
            Address::Broadcast(broadcast) => {
                self.counters.broadcast.fetch_add(1, Ordering::Relaxed);
                self.rules
                    .iter()
                    .filter(|rule| rule.enabled)
                    .flat_map(|rule| rule.targets.clone())
                    .filter(|target| {
                        AgentAddress::parse(target)
                            .is_ok_and(|address| address.namespace() == broadcast.namespace())
                    })
                    .collect()
            }
        };

        if destinations.is_empty() {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(message_id = %envelope.id, to = %envelope.to, "No routing rule matched");
        }
        Ok(destinations.into_iter().collect())
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            total_rules: self.rules.len(),
            enabled_rules: self.rules.iter().filter(|rule| rule.enabled).count(),
            direct_routed: self.counters.direct.load(Ordering::Relaxed),
            topic_routed: self.counters.topic.load(Ordering::Relaxed),
            broadcast_routed: self.counters.broadcast.load(Ordering::Relaxed),
            unroutable: self.counters.unroutable.load(Ordering::Relaxed),
        }
    }
}
