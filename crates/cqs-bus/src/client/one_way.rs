//! Command and event buses: send and forget.
//!
//! Both resolve once the transport accepted the message, not when it was
//! handled. Handler failures surface on the listener side only.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::codec::Codec;
use crate::domain::config::BusConfig;
use crate::domain::correlation::CorrelationId;
use crate::domain::error::BusError;
use crate::domain::message::{ApplicationEvent, Command, Message};
use crate::ports::outbound::{QueueSender, Transport};

#[derive(Clone)]
struct OneWaySender {
    queue: String,
    sender: Arc<dyn QueueSender>,
    codec: Codec,
    time_to_live: Option<Duration>,
}

impl OneWaySender {
    fn open(transport: &dyn Transport, queue: String, config: &BusConfig) -> Result<Self, BusError> {
        Ok(Self {
            sender: transport.sender(&queue)?,
            queue,
            codec: config.codec,
            time_to_live: config.time_to_live,
        })
    }

    async fn send<M: Message>(&self, message: &M) -> Result<CorrelationId, BusError> {
        let message_id = CorrelationId::new();
        let envelope = self
            .codec
            .envelope(M::TYPE_TAG, message)?
            .with_message_id(message_id.to_string())
            .with_time_to_live(self.time_to_live);
        self.sender.send(envelope).await?;
        debug!(
            message_id = %message_id,
            type_tag = M::TYPE_TAG,
            queue = %self.queue,
            "Sent message"
        );
        Ok(message_id)
    }
}

/// Sends commands to the command queue. Cheap to clone.
#[derive(Clone)]
pub struct CommandBus {
    inner: OneWaySender,
}

impl CommandBus {
    pub fn new(
        transport: &dyn Transport,
        queue: impl Into<String>,
        config: &BusConfig,
    ) -> Result<Self, BusError> {
        Ok(Self {
            inner: OneWaySender::open(transport, queue.into(), config)?,
        })
    }

    /// Send a command. Returns the message id it was sent under.
    pub async fn send<C: Command>(&self, command: C) -> Result<CorrelationId, BusError> {
        self.inner.send(&command).await
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }
}

/// Publishes application events to the event queue. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: OneWaySender,
}

impl EventBus {
    pub fn new(
        transport: &dyn Transport,
        queue: impl Into<String>,
        config: &BusConfig,
    ) -> Result<Self, BusError> {
        Ok(Self {
            inner: OneWaySender::open(transport, queue.into(), config)?,
        })
    }

    /// Publish an event. Returns the message id it was sent under.
    pub async fn publish<E: ApplicationEvent>(&self, event: E) -> Result<CorrelationId, BusError> {
        self.inner.send(&event).await
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }
}
