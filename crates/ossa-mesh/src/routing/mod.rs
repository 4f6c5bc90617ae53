//! Routing rules, payload filters and local subscriptions.

mod filter;
mod router;
mod subscription;

pub use filter::{CompareOp, Comparison, MessageFilter, lookup_path};
pub use router::{ANY_SOURCE, Router, RoutingRule, RoutingStats};
pub use subscription::{
    HandlerBinding, HandlerError, MessageHandler, Subscription, SubscriptionManager,
};
