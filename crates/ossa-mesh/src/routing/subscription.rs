//! Channel-to-handler bindings.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use super::filter::MessageFilter;
use crate::message::{MessageEnvelope, Priority};
use crate::types::matches_pattern;

/// Error returned by user handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler invoked for inbound envelopes on a subscribed channel
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}

/// Subscription descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Channel name or wildcard pattern
    pub channel: String,
    /// Payload schema advertised to publishers; not enforced locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MessageFilter>,
    pub handler_id: String,
    #[serde(default)]
    pub priority: Priority,
    /// Maximum simultaneous invocations of this handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, handler_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            schema: None,
            filter: None,
            handler_id: handler_id.into(),
            priority: Priority::Normal,
            max_concurrency: None,
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max.max(1));
        self
    }
}

/// A handler bound to a subscription
#[derive(Clone)]
pub struct HandlerBinding {
    pub subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    limiter: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl HandlerBinding {
    fn new(subscription: Subscription, handler: Arc<dyn MessageHandler>) -> Self {
        if let Some(filter) = &subscription.filter {
            // Parse the expression now, not on the first delivery
            let _ = filter.comparison();
        }
        let limiter = subscription
            .max_concurrency
            .map(|max| Arc::new(Semaphore::new(max)));
        Self {
            subscription,
            handler,
            limiter,
        }
    }

    pub fn handler_id(&self) -> &str {
        &self.subscription.handler_id
    }

    /// Whether the subscription filter accepts `envelope`
    pub fn accepts(&self, envelope: &MessageEnvelope) -> bool {
        self.subscription
            .filter
            .as_ref()
            .is_none_or(|filter| filter.matches(&envelope.payload))
    }

    /// Run the handler, waiting for a concurrency slot first
    pub async fn invoke(&self, envelope: MessageEnvelope) -> Result<(), HandlerError> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await?),
            None => None,
        };
        self.handler.handle(envelope).await
    }
}

/// Channel-keyed handler table
#[derive(Default)]
pub struct SubscriptionManager {
    channels: DashMap<String, Vec<HandlerBinding>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a channel
    ///
    /// Returns `false` when the handler id is already bound to that channel;
    /// the existing binding is kept.
    pub fn subscribe(&self, subscription: Subscription, handler: Arc<dyn MessageHandler>) -> bool {
        let mut bindings = self.channels.entry(subscription.channel.clone()).or_default();
        if bindings
            .iter()
            .any(|b| b.subscription.handler_id == subscription.handler_id)
        {
            debug!(
                channel = %subscription.channel,
                handler_id = %subscription.handler_id,
                "Handler already subscribed"
            );
            return false;
        }

        debug!(
            channel = %subscription.channel,
            handler_id = %subscription.handler_id,
            "Subscribed handler"
        );
        bindings.push(HandlerBinding::new(subscription, handler));
        true
    }

    /// Remove one handler; the channel entry goes away with its last handler
    pub fn unsubscribe(&self, channel: &str, handler_id: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut bindings) => {
                let before = bindings.len();
                bindings.retain(|b| b.subscription.handler_id != handler_id);
                before != bindings.len()
            }
            None => false,
        };
        self.channels.remove_if(channel, |_, bindings| bindings.is_empty());
        removed
    }

    /// Handlers bound to `channel` exactly or through a matching pattern
    ///
    /// A handler id bound under several matching patterns is returned once.
    pub fn get_handlers(&self, channel: &str) -> Vec<HandlerBinding> {
        let mut seen = HashSet::new();
        let mut handlers = Vec::new();
        for entry in self.channels.iter() {
            if !matches_pattern(entry.key(), channel) {
                continue;
            }
            for binding in entry.value() {
                if seen.insert(binding.subscription.handler_id.clone()) {
                    handlers.push(binding.clone());
                }
            }
        }
        handlers.sort_by_key(|b| b.subscription.priority.rank());
        handlers
    }

    pub fn has_subscribers(&self, channel: &str) -> bool {
        !self.get_handlers(channel).is_empty()
    }

    /// Registered channel names and patterns
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn handler_count(&self) -> usize {
        self.channels.iter().map(|e| e.value().len()).sum()
    }
}
