//! Error taxonomy for the buses and the transport port.

use std::time::Duration;
use thiserror::Error;

use crate::domain::correlation::CorrelationId;
use crate::domain::fault::Fault;

/// Errors surfaced by buses, listeners and pending calls.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    /// Missing correlation/type metadata, or a type tag nobody registered.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// Zero handlers registered for a command or request type.
    #[error("no handler registered for {message_type}")]
    NoHandler { message_type: String },

    /// More than one handler where exactly one is required.
    #[error("{message_type} has the following handlers: {}", .handlers.join(","))]
    MultipleHandlers {
        message_type: String,
        handlers: Vec<String>,
    },

    /// The receive machinery itself failed. Recreate the bus instance.
    #[error("fatal bus failure: {0}")]
    FatalBus(String),

    /// Business fault raised by a handler and forwarded to the caller.
    #[error("{0}")]
    Fault(Fault),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("correlation id {0} is already pending")]
    DuplicateCorrelation(CorrelationId),

    /// The pending call was evicted before a reply arrived.
    #[error("no reply for {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    /// The completion handle was dropped without an outcome.
    #[error("reply channel closed before an outcome was delivered")]
    ReplyDropped,

    #[error("unexpected reply type {actual}, expected {expected}")]
    UnexpectedReply { expected: String, actual: String },

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("bus has already been started")]
    AlreadyStarted,

    #[error("bus has been stopped; create a new instance")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Whether this error means the instance must be recreated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::FatalBus(_))
    }
}

/// Errors reported by transport adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("session {0} is already locked by another receiver")]
    SessionLocked(String),

    #[error("lock {0} is unknown or expired")]
    LockLost(u64),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("transport closed")]
    Closed,
}
