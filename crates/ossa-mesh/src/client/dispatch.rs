//! Inbound dispatch building blocks: command handlers, outcomes and the
//! exactly-once de-duplication window.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{A2aErrorCode, MeshError};
use crate::routing::HandlerError;

/// Payload key naming the command in a command request
pub const COMMAND_KEY: &str = "command";
/// Payload key carrying the command input
pub const INPUT_KEY: &str = "input";

/// Handler for RPC-style commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, input: Value) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn execute(&self, input: Value) -> Result<Value, HandlerError> {
        (self)(input).await
    }
}

/// What `handle_message` did with an inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Response matched a pending request
    ResponseMatched,
    /// A registered command ran; `replied` is false without a reply-to address
    CommandHandled { command: String, replied: bool },
    /// Subscription handlers ran
    Dispatched { handlers: usize, failures: usize },
    /// Nobody listens on the envelope's channel
    Unhandled,
    /// Dropped by the TTL check
    Expired,
    /// Dropped as a duplicate under exactly-once delivery
    Duplicate,
}

/// Command request shape: `{"command": name, "input": value}`
pub(crate) fn command_request(command: &str, input: Value) -> Value {
    json!({ COMMAND_KEY: command, INPUT_KEY: input })
}

/// Split a command request payload into name and input
pub(crate) fn parse_command(payload: &Value) -> Option<(&str, Value)> {
    let object = payload.as_object()?;
    let command = object.get(COMMAND_KEY)?.as_str()?;
    let input = object.get(INPUT_KEY).cloned().unwrap_or(Value::Null);
    Some((command, input))
}

/// Error-shaped response payload: `{"error": {"code", "message"}}`
pub(crate) fn error_payload(code: A2aErrorCode, message: impl Into<String>) -> Value {
    json!({ "error": { "code": code.as_str(), "message": message.into() } })
}

/// Recognise an error-shaped response payload
pub(crate) fn remote_error(payload: &Value) -> Option<MeshError> {
    let error = payload.as_object()?.get("error")?.as_object()?;
    let code = error.get("code")?.as_str()?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(MeshError::Remote {
        code: code.to_string(),
        message: message.to_string(),
    })
}

/// Message ids seen within a sliding window
pub(crate) struct DedupWindow {
    window: Duration,
    seen: DashMap<String, Instant>,
    // Table size that triggers the next prune
    prune_at: AtomicUsize,
}

/// Never prune below this many ids
const PRUNE_THRESHOLD: usize = 1024;

impl DedupWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
            prune_at: AtomicUsize::new(PRUNE_THRESHOLD),
        }
    }

    /// Record `id`; returns `false` if it was already seen inside the window
    pub(crate) fn first_sighting(&self, id: &str) -> bool {
        let now = Instant::now();
        if self.seen.len() > self.prune_at.load(Ordering::Relaxed) {
            self.prune(now);
        }

        let mut fresh = true;
        self.seen
            .entry(id.to_string())
            .and_modify(|seen_at| {
                if now.duration_since(*seen_at) <= self.window {
                    fresh = false;
                } else {
                    *seen_at = now;
                }
            })
            .or_insert(now);
        fresh
    }

    /// Drop ids older than the window, then double the high-water mark over
    /// what survived so the next prune waits for as many new insertions
    fn prune(&self, now: Instant) {
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) <= self.window);
        let next = self.seen.len().saturating_mul(2).max(PRUNE_THRESHOLD);
        self.prune_at.store(next, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_payload_shape() {
        let payload = command_request("ping", json!({"n": 1}));
        assert_eq!(payload, json!({"command": "ping", "input": {"n": 1}}));

        let (command, input) = parse_command(&payload).unwrap();
        assert_eq!(command, "ping");
        assert_eq!(input, json!({"n": 1}));

        assert_eq!(parse_command(&json!({"command": "x"})).unwrap().1, Value::Null);
        assert!(parse_command(&json!({"q": "ping"})).is_none());
        assert!(parse_command(&json!("ping")).is_none());
    }

    #[test]
    fn test_error_payload_round_trip() {
        let payload = error_payload(A2aErrorCode::TaskRejected, "boom");
        assert_eq!(payload["error"]["code"], "TASK_REJECTED");

        match remote_error(&payload) {
            Some(MeshError::Remote { code, message }) => {
                assert_eq!(code, "TASK_REJECTED");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(remote_error(&json!("pong")).is_none());
        assert!(remote_error(&json!({"error": "plain string"})).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window() {
        let dedup = DedupWindow::new(Duration::from_secs(10));
        assert!(dedup.first_sighting("m1"));
        assert!(!dedup.first_sighting("m1"));
        assert!(dedup.first_sighting("m2"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(dedup.first_sighting("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_prunes_at_high_water_mark() {
        let dedup = DedupWindow::new(Duration::from_secs(10));
        for n in 0..=PRUNE_THRESHOLD {
            assert!(dedup.first_sighting(&format!("id-{n}")));
        }
        // Nothing has expired, so the sweep keeps everything and the mark doubles
        assert!(dedup.first_sighting("trigger"));
        let mark = dedup.prune_at.load(Ordering::Relaxed);
        assert_eq!(mark, (PRUNE_THRESHOLD + 1) * 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        for n in 0..100 {
            assert!(dedup.first_sighting(&format!("more-{n}")));
        }
        assert!(dedup.first_sighting("id-0"));
        // Below the mark, expired ids are still held
        assert_eq!(dedup.seen.len(), PRUNE_THRESHOLD + 2 + 100);

        let mut fresh = 0;
        while dedup.seen.len() <= mark {
            dedup.first_sighting(&format!("fresh-{fresh}"));
            fresh += 1;
        }
        dedup.first_sighting("sweep");
        // Only ids sighted after the advance survive
        assert_eq!(dedup.seen.len(), 100 + 1 + fresh + 1);
        assert!(!dedup.first_sighting("id-0"));
        assert!(dedup.first_sighting("id-1"));
    }
}
