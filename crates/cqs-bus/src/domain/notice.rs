//! Bus-level failure notifications.

use crate::domain::envelope::Envelope;
use crate::domain::error::BusError;

/// What to do with the message that triggered a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageHandling {
    /// Abandon the lock so the transport redelivers it.
    #[default]
    PutMessageBackInQueue,
    /// Complete the lock; the message is gone.
    RemoveMessage,
}

/// A failure that could not be reported to a caller.
///
/// Subscribers receive it by mutable reference and may override the
/// recommended disposition before the loop applies it.
#[derive(Debug, Clone)]
pub struct FailureNotice {
    /// The message being handled, if any.
    pub envelope: Option<Envelope>,
    pub error: BusError,
    disposition: MessageHandling,
}

impl FailureNotice {
    pub fn new(envelope: Option<Envelope>, error: BusError, recommended: MessageHandling) -> Self {
        Self {
            envelope,
            error,
            disposition: recommended,
        }
    }

    pub fn disposition(&self) -> MessageHandling {
        self.disposition
    }

    /// Override the disposition the loop will apply.
    pub fn set_disposition(&mut self, disposition: MessageHandling) {
        self.disposition = disposition;
    }

    /// Whether the bus instance must be recreated.
    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}
