//! Builds buses and listeners from one transport and one configuration.

use std::sync::Arc;
use tracing::info;

use crate::client::{CommandBus, EventBus, QueryBus, RequestReplyBus};
use crate::container::Container;
use crate::domain::config::BusConfig;
use crate::domain::error::BusError;
use crate::listener::{CommandListener, EventListener, QueryListener, RequestReplyListener};
use crate::ports::outbound::Transport;

/// Entry point for applications.
///
/// Request/reply and query buses come back started, since they cannot
/// receive replies otherwise. Listeners come back idle so handlers and
/// success hooks can be attached before `start()`.
#[derive(Clone)]
pub struct CqsFactory {
    transport: Arc<dyn Transport>,
    config: BusConfig,
}

impl CqsFactory {
    /// Validates the configuration.
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        info!(
            request_queue = %config.request_reply.request_queue,
            query_queue = %config.query.request_queue,
            command_queue = %config.command_queue,
            event_queue = %config.event_queue,
            codec = ?config.codec,
            "CQS factory ready"
        );
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn create_command_bus(&self) -> Result<CommandBus, BusError> {
        CommandBus::new(self.transport.as_ref(), &self.config.command_queue, &self.config)
    }

    pub fn create_event_bus(&self) -> Result<EventBus, BusError> {
        EventBus::new(self.transport.as_ref(), &self.config.event_queue, &self.config)
    }

    /// Must be called inside a tokio runtime.
    pub fn create_request_reply_bus(&self) -> Result<RequestReplyBus, BusError> {
        let bus = RequestReplyBus::new(
            self.transport.clone(),
            self.config.request_reply.clone(),
            &self.config,
        )?;
        bus.start()?;
        Ok(bus)
    }

    /// Must be called inside a tokio runtime.
    pub fn create_query_bus(&self) -> Result<QueryBus, BusError> {
        let bus = QueryBus::new(self.transport.clone(), self.config.query.clone(), &self.config)?;
        bus.start()?;
        Ok(bus)
    }

    pub fn create_command_listener(&self, container: Arc<Container>) -> CommandListener {
        CommandListener::new(
            self.transport.clone(),
            self.config.command_queue.clone(),
            container,
            &self.config,
        )
    }

    pub fn create_event_listener(&self, container: Arc<Container>) -> EventListener {
        EventListener::new(
            self.transport.clone(),
            self.config.event_queue.clone(),
            container,
            &self.config,
        )
    }

    pub fn create_request_reply_listener(&self, container: Arc<Container>) -> RequestReplyListener {
        RequestReplyListener::new(
            self.transport.clone(),
            self.config.request_reply.clone(),
            container,
            &self.config,
        )
    }

    pub fn create_query_listener(&self, container: Arc<Container>) -> QueryListener {
        QueryListener::new(
            self.transport.clone(),
            self.config.query.clone(),
            container,
            &self.config,
        )
    }
}
