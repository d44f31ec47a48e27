//! Inbound ports: what the listeners invoke.
//!
//! Handlers return a [`Fault`] on failure. The request dispatcher sends it
//! back to the caller, where it surfaces as `BusError::Fault`.

use async_trait::async_trait;

use crate::domain::fault::Fault;
use crate::domain::message::{ApplicationEvent, Command, Request};

/// Answers one request type.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn execute(&self, request: R) -> Result<R::Reply, Fault>;
}

/// Executes one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn execute(&self, command: C) -> Result<(), Fault>;
}

/// Reacts to one event type. Any number may be registered.
#[async_trait]
pub trait EventSubscriber<E: ApplicationEvent>: Send + Sync {
    async fn handle(&self, event: &E) -> Result<(), Fault>;
}
