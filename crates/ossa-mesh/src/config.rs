//! # Client Configuration
//!
//! Reliability settings travel with each client. Every field has a default,
//! and [`ClientConfig::from_env`] overlays environment variables on top.
//!
//! ## Environment Variables
//!
//! ### Client
//! - `OSSA_MESH_TICK_INTERVAL` - Scheduler tick, humantime format (default: 10ms)
//! - `OSSA_MESH_DEFAULT_TTL_SECS` - TTL stamped on new envelopes (default: 300)
//! - `OSSA_MESH_REQUEST_TIMEOUT` - Default `request` timeout (default: 30s)
//! - `OSSA_MESH_QUEUE_CAPACITY` - Outbound queue capacity, 0 for unbounded (default: 10000)
//! - `OSSA_MESH_MAX_MESSAGE_SIZE` - Maximum serialized envelope size in bytes (default: 1048576)
//! - `OSSA_MESH_HEARTBEAT_INTERVAL` - Discovery heartbeat period (default: disabled)
//! - `OSSA_MESH_DEDUP_WINDOW` - Exactly-once de-duplication window (default: 5m)
//!
//! ### Reliability
//! - `OSSA_MESH_DELIVERY_GUARANTEE` - `at-most-once`, `at-least-once` or `exactly-once`
//! - `OSSA_MESH_RETRY_MAX_ATTEMPTS` - Attempts per destination (default: 3)
//! - `OSSA_MESH_RETRY_BACKOFF` - `exponential`, `linear` or `constant`
//! - `OSSA_MESH_RETRY_INITIAL_DELAY_MS` - First backoff delay (default: 1000)
//! - `OSSA_MESH_RETRY_MAX_DELAY_MS` - Backoff ceiling (default: 30000)
//! - `OSSA_MESH_RETRY_MULTIPLIER` - Exponential growth factor (default: 2.0)
//! - `OSSA_MESH_DLQ_CHANNEL` - Dead-letter topic, e.g. `topic://mesh.dlq`
//! - `OSSA_MESH_DLQ_RETENTION_SECS` - Local dead-letter retention (default: 86400)
//! - `OSSA_MESH_ORDERING_ENABLED` - Deliver destinations in order (default: false)
//! - `OSSA_MESH_ACK_TIMEOUT` - Per-attempt acknowledgment timeout (default: disabled)

use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

use crate::error::MeshError;
use crate::message::DEFAULT_TTL_SECS;
use crate::types::TopicAddress;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for MeshError {
    fn from(err: ConfigError) -> Self {
        MeshError::InvalidConfig(err.to_string())
    }
}

/// Delivery semantics offered to senders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryGuarantee {
    /// One attempt, no retries
    AtMostOnce,
    /// Retry until the policy is exhausted
    #[default]
    AtLeastOnce,
    /// At-least-once delivery plus inbound de-duplication by message id
    ExactlyOnce,
}

impl DeliveryGuarantee {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "at-most-once" | "at_most_once" => Some(Self::AtMostOnce),
            "at-least-once" | "at_least_once" => Some(Self::AtLeastOnce),
            "exactly-once" | "exactly_once" => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Constant,
}

impl BackoffKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            "constant" => Some(Self::Constant),
            _ => None,
        }
    }
}

/// Retry policy applied to each destination independently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based)
    ///
    /// ```
    /// use ossa_mesh::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy { initial_delay_ms: 100, ..RetryPolicy::default() };
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    /// assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = self.initial_delay_ms as f64;
        let raw = match self.backoff {
            BackoffKind::Exponential => initial * self.multiplier.powi(attempt as i32 - 1),
            BackoffKind::Linear => initial * attempt as f64,
            BackoffKind::Constant => initial,
        };
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Dead-letter routing for messages that exhausted delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterConfig {
    /// Topic address the wrapper envelope is published to
    pub channel: String,
    /// How long the local store keeps records
    pub retention_secs: u64,
    /// Maximum records kept locally; oldest are evicted first
    pub max_entries: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            channel: "topic://mesh.dead-letter".to_string(),
            retention_secs: 86_400,
            max_entries: 10_000,
        }
    }
}

/// Ordering settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderingConfig {
    /// Deliver one envelope fully before the scheduler takes the next
    pub enabled: bool,
}

/// Acknowledgment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgmentConfig {
    /// An attempt that is not acknowledged within this window counts as failed
    pub timeout_ms: u64,
}

impl Default for AcknowledgmentConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// Per-client reliability settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityConfig {
    pub delivery_guarantee: DeliveryGuarantee,
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering: Option<OrderingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledgment: Option<AcknowledgmentConfig>,
}

impl ReliabilityConfig {
    /// Retry policy adjusted for the delivery guarantee
    pub fn effective_retry(&self) -> RetryPolicy {
        match self.delivery_guarantee {
            DeliveryGuarantee::AtMostOnce => RetryPolicy {
                max_attempts: 1,
                ..self.retry.clone()
            },
            _ => self.retry.clone(),
        }
    }

    pub fn ordered(&self) -> bool {
        self.ordering.as_ref().is_some_and(|o| o.enabled)
    }

    /// Per-attempt acknowledgment timeout, when configured
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.acknowledgment
            .as_ref()
            .map(|ack| Duration::from_millis(ack.timeout_ms))
    }
}

/// Mesh client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheduler tick; at most one envelope is dequeued per tick
    pub tick_interval: Duration,
    /// TTL in seconds for envelopes built by the client
    pub default_ttl_secs: u64,
    /// Timeout applied by `request` when the caller passes none
    pub request_timeout: Duration,
    /// Outbound queue capacity; `None` is unbounded
    pub queue_capacity: Option<usize>,
    /// Maximum serialized envelope size in bytes
    pub max_message_size: usize,
    /// Discovery heartbeat period; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Inbound de-duplication window for exactly-once delivery
    pub dedup_window: Duration,
    pub reliability: ReliabilityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            default_ttl_secs: DEFAULT_TTL_SECS,
            request_timeout: Duration::from_secs(30),
            queue_capacity: Some(10_000),
            max_message_size: 1024 * 1024, // 1MB
            heartbeat_interval: None,
            dedup_window: Duration::from_secs(300),
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(tick) = get_env_duration("OSSA_MESH_TICK_INTERVAL")? {
            config.tick_interval = tick;
        }
        if let Some(ttl) = get_env_u64("OSSA_MESH_DEFAULT_TTL_SECS")? {
            config.default_ttl_secs = ttl;
        }
        if let Some(timeout) = get_env_duration("OSSA_MESH_REQUEST_TIMEOUT")? {
            config.request_timeout = timeout;
        }
        if let Some(capacity) = get_env_usize("OSSA_MESH_QUEUE_CAPACITY")? {
            config.queue_capacity = (capacity > 0).then_some(capacity);
        }
        if let Some(size) = get_env_usize("OSSA_MESH_MAX_MESSAGE_SIZE")? {
            config.max_message_size = size;
        }
        if let Some(interval) = get_env_duration("OSSA_MESH_HEARTBEAT_INTERVAL")? {
            config.heartbeat_interval = Some(interval);
        }
        if let Some(window) = get_env_duration("OSSA_MESH_DEDUP_WINDOW")? {
            config.dedup_window = window;
        }

        let reliability = &mut config.reliability;
        if let Some(raw) = get_env_string("OSSA_MESH_DELIVERY_GUARANTEE") {
            reliability.delivery_guarantee =
                DeliveryGuarantee::parse(&raw).ok_or_else(|| ConfigError::InvalidEnvVar {
                    key: "OSSA_MESH_DELIVERY_GUARANTEE".to_string(),
                    message: format!(
                        "invalid delivery guarantee '{raw}', expected at-most-once/at-least-once/exactly-once"
                    ),
                })?;
        }
        if let Some(attempts) = get_env_u32("OSSA_MESH_RETRY_MAX_ATTEMPTS")? {
            reliability.retry.max_attempts = attempts;
        }
        if let Some(raw) = get_env_string("OSSA_MESH_RETRY_BACKOFF") {
            reliability.retry.backoff =
                BackoffKind::parse(&raw).ok_or_else(|| ConfigError::InvalidEnvVar {
                    key: "OSSA_MESH_RETRY_BACKOFF".to_string(),
                    message: format!(
                        "invalid backoff '{raw}', expected exponential/linear/constant"
                    ),
                })?;
        }
        if let Some(delay) = get_env_u64("OSSA_MESH_RETRY_INITIAL_DELAY_MS")? {
            reliability.retry.initial_delay_ms = delay;
        }
        if let Some(delay) = get_env_u64("OSSA_MESH_RETRY_MAX_DELAY_MS")? {
            reliability.retry.max_delay_ms = delay;
        }
        if let Some(multiplier) = get_env_f64("OSSA_MESH_RETRY_MULTIPLIER")? {
            reliability.retry.multiplier = multiplier;
        }
        if let Some(channel) = get_env_string("OSSA_MESH_DLQ_CHANNEL") {
            reliability
                .dead_letter
                .get_or_insert_with(DeadLetterConfig::default)
                .channel = channel;
        }
        if let Some(retention) = get_env_u64("OSSA_MESH_DLQ_RETENTION_SECS")? {
            reliability
                .dead_letter
                .get_or_insert_with(DeadLetterConfig::default)
                .retention_secs = retention;
        }
        if let Some(enabled) = get_env_bool("OSSA_MESH_ORDERING_ENABLED")? {
            reliability.ordering = Some(OrderingConfig { enabled });
        }
        if let Some(timeout) = get_env_duration("OSSA_MESH_ACK_TIMEOUT")? {
            reliability.acknowledgment = Some(AcknowledgmentConfig {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "tick_interval must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be greater than 0 (use None for unbounded)".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".to_string(),
            ));
        }

        let retry = &self.reliability.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "retry.multiplier must be >= 1.0, got {}",
                retry.multiplier
            )));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.max_delay_ms ({}) must be >= retry.initial_delay_ms ({})",
                retry.max_delay_ms, retry.initial_delay_ms
            )));
        }

        if let Some(dlq) = &self.reliability.dead_letter {
            let channel = dlq.channel.strip_prefix(crate::types::TOPIC_SCHEME).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "dead_letter.channel must be a topic address, got '{}'",
                    dlq.channel
                ))
            })?;
            TopicAddress::new(channel).map_err(|e| {
                ConfigError::ValidationError(format!("dead_letter.channel: {e}"))
            })?;
        }
        if matches!(&self.reliability.acknowledgment, Some(ack) if ack.timeout_ms == 0) {
            return Err(ConfigError::ValidationError(
                "acknowledgment.timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// Environment variable helper functions

fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        Err(_) => Ok(None),
    }
}

fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid u64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u32>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid u32 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_f64(key: &str) -> Result<Option<f64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<f64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid f64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(val) => humantime::parse_duration(&val)
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid duration '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
