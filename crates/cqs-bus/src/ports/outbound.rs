//! Outbound ports: the queue transport.
//!
//! The buses need a durable queue with peek-lock receive and
//! session-addressed delivery. Many senders may share one queue; each
//! receive loop owns exactly one receiver.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::correlation::SessionId;
use crate::domain::envelope::{Delivery, Envelope, LockToken};
use crate::domain::error::TransportError;

/// Sends envelopes to one queue.
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// Enqueue an envelope. Resolves once the transport accepted it.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Peek-lock receiver on a queue or on one session of a queue.
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Wait up to `max_wait` for the next message. `Ok(None)` means nothing
    /// arrived in time.
    async fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Remove a received message from the queue.
    async fn complete(&self, lock: LockToken) -> Result<(), TransportError>;

    /// Release a received message so it is delivered again.
    async fn abandon(&self, lock: LockToken) -> Result<(), TransportError>;

    /// Release the receiver, including any session lock it holds.
    async fn close(&self) {}
}

/// Claims sessions on a session-enabled queue.
#[async_trait]
pub trait SessionAcceptor: Send + Sync {
    /// Lock the named session for exclusive receipt.
    async fn accept_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn QueueReceiver>, TransportError>;
}

/// Opens senders and receivers by queue name.
pub trait Transport: Send + Sync {
    fn sender(&self, queue: &str) -> Result<Arc<dyn QueueSender>, TransportError>;

    fn receiver(&self, queue: &str) -> Result<Arc<dyn QueueReceiver>, TransportError>;

    fn sessions(&self, queue: &str) -> Result<Arc<dyn SessionAcceptor>, TransportError>;
}
