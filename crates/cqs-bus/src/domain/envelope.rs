//! Wire envelope exchanged with the queue transport.
//!
//! Identifiers are carried as raw strings: the envelope is what arrives from
//! the outside world, and a missing or malformed marker must be representable
//! so the receive loops can reject it explicitly.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::domain::correlation::{CorrelationId, SessionId};
use crate::domain::error::BusError;

/// Container for one payload crossing the transport boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Transport message id. Requests use their correlation id here.
    pub message_id: Option<String>,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Type tag used to choose the decode target.
    pub type_tag: Option<String>,
    /// Correlation marker on replies: the id of the request being answered.
    pub reply_to: Option<String>,
    /// Session this message is addressed to (replies only).
    pub session_id: Option<String>,
    /// Session the sender expects its replies on (requests only).
    pub reply_to_session_id: Option<String>,
    /// How long the message may wait in the queue.
    pub time_to_live: Option<Duration>,
    /// Free-form application properties.
    pub properties: HashMap<String, String>,
}

impl Envelope {
    /// Create an envelope for an encoded payload with its type tag.
    pub fn new(type_tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_tag: Some(type_tag.into()),
            payload,
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, id: CorrelationId) -> Self {
        self.reply_to = Some(id.to_string());
        self
    }

    pub fn with_session(mut self, session: &str) -> Self {
        self.session_id = Some(session.to_string());
        self
    }

    pub fn with_reply_to_session(mut self, session: &SessionId) -> Self {
        self.reply_to_session_id = Some(session.to_string());
        self
    }

    /// Set a time-to-live. A zero duration means "no expiry".
    pub fn with_time_to_live(mut self, ttl: Option<Duration>) -> Self {
        self.time_to_live = ttl.filter(|d| !d.is_zero());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Correlation id of the request this reply answers.
    pub fn reply_correlation(&self) -> Result<CorrelationId, BusError> {
        let raw = self.reply_to.as_deref().ok_or_else(|| {
            BusError::UnknownMessage(format!(
                "did not find the 'reply_to' marker in message {self}; \
                 is something other than this library using the queue?"
            ))
        })?;
        CorrelationId::parse(raw).map_err(|_| {
            BusError::UnknownMessage(format!(
                "failed to parse 'reply_to' value '{raw}' as a correlation id in message {self}"
            ))
        })
    }

    /// The request's own id, assigned by the calling client.
    pub fn request_id(&self) -> Result<CorrelationId, BusError> {
        let raw = self.message_id.as_deref().ok_or_else(|| {
            BusError::UnknownMessage(format!("did not find the message id in message {self}"))
        })?;
        CorrelationId::parse(raw).map_err(|_| {
            BusError::UnknownMessage(format!(
                "failed to parse message id '{raw}' as a correlation id in message {self}"
            ))
        })
    }

    /// Type tag, or an `UnknownMessage` error naming what is missing.
    pub fn require_type_tag(&self) -> Result<&str, BusError> {
        self.type_tag.as_deref().ok_or_else(|| {
            BusError::UnknownMessage(format!(
                "message {self} has no type tag; it was not produced by this library"
            ))
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[id={} type={} reply_to={} bytes={}]",
            self.message_id.as_deref().unwrap_or("-"),
            self.type_tag.as_deref().unwrap_or("-"),
            self.reply_to.as_deref().unwrap_or("-"),
            self.payload.len()
        )
    }
}

/// Peek-lock token identifying one handed-out delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(pub u64);

/// A message received under peek-lock. It stays invisible to other
/// receivers until completed (removed) or abandoned (put back).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub lock: LockToken,
    /// How many times this message has been handed out, this one included.
    pub delivery_count: u32,
}
