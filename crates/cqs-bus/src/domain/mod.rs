//! Domain types for the buses.
//!
//! Identifiers, the wire envelope, the error taxonomy, the pending call
//! table and configuration. Nothing here talks to a transport.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod message;
pub mod notice;
pub mod pending;

// Re-exports for convenience
pub use config::{BusConfig, EnvSettings, MapSettings, QueuePair, SettingsProvider};
pub use correlation::{CorrelationId, SessionId};
pub use envelope::{Delivery, Envelope, LockToken};
pub use error::{BusError, TransportError};
pub use fault::Fault;
pub use message::{ApplicationEvent, Command, Message, Query, Request};
pub use notice::{FailureNotice, MessageHandling};
pub use pending::{PendingCall, PendingCallTable, PendingStats, ReplyOutcome};
