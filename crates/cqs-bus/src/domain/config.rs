//! Bus configuration with validation.
//!
//! Values come from three places: serde (`#[serde(default)]`, so a partial
//! document is fine), `CQS_*` environment variables, or a
//! [`SettingsProvider`] using the dotted setting names
//! (`RequestReplyBus.Request.QueueName`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::codec::Codec;
use crate::domain::error::BusError;

/// Request queue plus the session-enabled queue replies come back on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePair {
    pub request_queue: String,
    pub reply_queue: String,
}

impl QueuePair {
    pub fn new(request_queue: impl Into<String>, reply_queue: impl Into<String>) -> Self {
        Self {
            request_queue: request_queue.into(),
            reply_queue: reply_queue.into(),
        }
    }
}

/// Main bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Request/reply bus queues
    pub request_reply: QueuePair,
    /// Query bus queues
    pub query: QueuePair,
    /// Command queue
    pub command_queue: String,
    /// Event queue
    pub event_queue: String,
    /// Payload encoding for outgoing messages
    pub codec: Codec,
    /// Time-to-live stamped on outgoing messages. `None` disables it.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
    /// Longest a single receive waits before the loop re-checks its stop flag
    #[serde(with = "humantime_serde")]
    pub receive_wait: Duration,
    /// Age after which an unanswered call fails with `Timeout`.
    /// `None` leaves orphaned calls pending until the bus is dropped.
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Option<Duration>,
    /// How often the timeout sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_reply: QueuePair::new("cqs-requests", "cqs-replies"),
            query: QueuePair::new("cqs-queries", "cqs-query-results"),
            command_queue: "cqs-commands".to_string(),
            event_queue: "cqs-events".to_string(),
            codec: Codec::Json,
            time_to_live: Some(Duration::from_secs(24 * 60 * 60)),
            receive_wait: Duration::from_millis(500),
            reply_timeout: Some(Duration::from_secs(60)),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Setting names understood by [`BusConfig::from_settings`].
pub mod keys {
    pub const REQUEST_REPLY_REQUEST_QUEUE: &str = "RequestReplyBus.Request.QueueName";
    pub const REQUEST_REPLY_REPLY_QUEUE: &str = "RequestReplyBus.Reply.QueueName";
    pub const QUERY_REQUEST_QUEUE: &str = "QueryBus.Request.QueueName";
    pub const QUERY_RESPONSE_QUEUE: &str = "QueryBus.Response.QueueName";
    pub const COMMAND_QUEUE: &str = "CommandBus.QueueName";
    pub const EVENT_QUEUE: &str = "EventBus.QueueName";
    pub const TIME_TO_LIVE: &str = "Bus.TimeToLive";
    pub const REPLY_TIMEOUT: &str = "Bus.ReplyTimeout";
    pub const CODEC: &str = "Bus.Codec";
}

impl BusConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), BusError> {
        let queues = [
            ("request_reply.request_queue", &self.request_reply.request_queue),
            ("request_reply.reply_queue", &self.request_reply.reply_queue),
            ("query.request_queue", &self.query.request_queue),
            ("query.reply_queue", &self.query.reply_queue),
            ("command_queue", &self.command_queue),
            ("event_queue", &self.event_queue),
        ];
        for (name, value) in queues {
            if value.trim().is_empty() {
                return Err(BusError::Config(format!("{name} cannot be empty")));
            }
        }

        for (name, pair) in [("request_reply", &self.request_reply), ("query", &self.query)] {
            if pair.request_queue == pair.reply_queue {
                return Err(BusError::Config(format!(
                    "{name} request and reply queues must differ"
                )));
            }
        }

        if self.receive_wait.is_zero() {
            return Err(BusError::Config("receive_wait cannot be 0".into()));
        }

        if let Some(timeout) = self.reply_timeout {
            if timeout.is_zero() {
                return Err(BusError::Config(
                    "reply_timeout cannot be 0; use none to disable it".into(),
                ));
            }
            if self.sweep_interval.is_zero() {
                return Err(BusError::Config("sweep_interval cannot be 0".into()));
            }
        }

        Ok(())
    }

    /// Load from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CQS_REQUEST_QUEUE` / `CQS_REPLY_QUEUE`: request/reply bus queues
    /// - `CQS_QUERY_QUEUE` / `CQS_QUERY_REPLY_QUEUE`: query bus queues
    /// - `CQS_COMMAND_QUEUE`, `CQS_EVENT_QUEUE`
    /// - `CQS_TIME_TO_LIVE`: e.g. `1day`, `0s` disables it
    /// - `CQS_RECEIVE_WAIT`: e.g. `500ms`
    /// - `CQS_REPLY_TIMEOUT`: e.g. `60s`, `none` disables eviction
    /// - `CQS_SWEEP_INTERVAL`: e.g. `1s`
    /// - `CQS_CODEC`: `json` or `bincode`
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BusError> {
        let mut config = Self::default();

        let queue_vars: [(&str, &mut String); 6] = [
            ("CQS_REQUEST_QUEUE", &mut config.request_reply.request_queue),
            ("CQS_REPLY_QUEUE", &mut config.request_reply.reply_queue),
            ("CQS_QUERY_QUEUE", &mut config.query.request_queue),
            ("CQS_QUERY_REPLY_QUEUE", &mut config.query.reply_queue),
            ("CQS_COMMAND_QUEUE", &mut config.command_queue),
            ("CQS_EVENT_QUEUE", &mut config.event_queue),
        ];
        for (var, slot) in queue_vars {
            if let Some(value) = lookup(var) {
                *slot = value;
            }
        }

        if let Some(raw) = lookup("CQS_TIME_TO_LIVE") {
            config.time_to_live = parse_optional_duration("CQS_TIME_TO_LIVE", &raw)?;
        }
        if let Some(raw) = lookup("CQS_RECEIVE_WAIT") {
            config.receive_wait = parse_duration("CQS_RECEIVE_WAIT", &raw)?;
        }
        if let Some(raw) = lookup("CQS_REPLY_TIMEOUT") {
            config.reply_timeout = parse_optional_duration("CQS_REPLY_TIMEOUT", &raw)?;
        }
        if let Some(raw) = lookup("CQS_SWEEP_INTERVAL") {
            config.sweep_interval = parse_duration("CQS_SWEEP_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("CQS_CODEC") {
            config.codec = parse_codec("CQS_CODEC", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a settings provider using the dotted setting names.
    /// Missing settings keep their defaults.
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self, BusError> {
        let mut config = Self::default();

        let queue_keys: [(&str, &mut String); 6] = [
            (keys::REQUEST_REPLY_REQUEST_QUEUE, &mut config.request_reply.request_queue),
            (keys::REQUEST_REPLY_REPLY_QUEUE, &mut config.request_reply.reply_queue),
            (keys::QUERY_REQUEST_QUEUE, &mut config.query.request_queue),
            (keys::QUERY_RESPONSE_QUEUE, &mut config.query.reply_queue),
            (keys::COMMAND_QUEUE, &mut config.command_queue),
            (keys::EVENT_QUEUE, &mut config.event_queue),
        ];
        for (key, slot) in queue_keys {
            if let Some(value) = settings.get(key) {
                *slot = value;
            }
        }

        if let Some(raw) = settings.get(keys::TIME_TO_LIVE) {
            config.time_to_live = parse_optional_duration(keys::TIME_TO_LIVE, &raw)?;
        }
        if let Some(raw) = settings.get(keys::REPLY_TIMEOUT) {
            config.reply_timeout = parse_optional_duration(keys::REPLY_TIMEOUT, &raw)?;
        }
        if let Some(raw) = settings.get(keys::CODEC) {
            config.codec = parse_codec(keys::CODEC, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_duration(name: &str, raw: &str) -> Result<Duration, BusError> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| BusError::Config(format!("{name}: invalid duration '{raw}': {e}")))
}

/// `none`, `off` and zero all mean "disabled".
fn parse_optional_duration(name: &str, raw: &str) -> Result<Option<Duration>, BusError> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("none") || trimmed.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let duration = parse_duration(name, trimmed)?;
    Ok(Some(duration).filter(|d| !d.is_zero()))
}

fn parse_codec(name: &str, raw: &str) -> Result<Codec, BusError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(Codec::Json),
        "bincode" => Ok(Codec::Bincode),
        other => Err(BusError::Config(format!("{name}: unknown codec '{other}'"))),
    }
}

/// Source of named settings.
pub trait SettingsProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads settings from the process environment.
///
/// `RequestReplyBus.Request.QueueName` is looked up as
/// `REQUESTREPLYBUS_REQUEST_QUEUENAME`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl EnvSettings {
    pub fn variable_name(key: &str) -> String {
        key.to_uppercase().replace('.', "_")
    }
}

impl SettingsProvider for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::variable_name(key)).ok()
    }
}

/// In-memory settings, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: HashMap<String, String>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SettingsProvider for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}
