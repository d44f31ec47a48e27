//! Type registry: type tag to typed decode and dispatch.
//!
//! Listeners only see a tag and bytes. Registering a message type stores a
//! monomorphized invoker for it, so the listener can decode the payload,
//! resolve the handlers inside a scope and encode the outcome without knowing
//! the concrete type. Clients keep a [`ReplyRegistry`] for the reverse
//! direction.

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::codec::Codec;
use crate::container::{HandlerKey, Scope};
use crate::domain::error::BusError;
use crate::domain::fault::Fault;
use crate::domain::message::{ApplicationEvent, Command, Message, Request};
use crate::domain::pending::ReplyOutcome;
use crate::ports::inbound::{CommandHandler, EventSubscriber, RequestHandler};

/// A handler's encoded reply.
#[derive(Debug, Clone)]
pub struct EncodedReply {
    pub type_tag: &'static str,
    pub payload: Vec<u8>,
}

pub(crate) type RequestInvoker =
    for<'a> fn(Codec, &'a [u8], &'a Scope) -> BoxFuture<'a, Result<EncodedReply, BusError>>;
pub(crate) type OneWayInvoker =
    for<'a> fn(Codec, &'a [u8], &'a Scope) -> BoxFuture<'a, Result<(), BusError>>;

/// Tag -> invoker, per protocol.
#[derive(Default)]
pub(crate) struct DispatchTable {
    requests: HashMap<String, RequestInvoker>,
    commands: HashMap<String, OneWayInvoker>,
    events: HashMap<String, OneWayInvoker>,
}

impl DispatchTable {
    pub(crate) fn add_request<R: Request>(&mut self) {
        self.requests
            .insert(R::TYPE_TAG.to_string(), invoke_request::<R> as RequestInvoker);
    }

    pub(crate) fn add_command<C: Command>(&mut self) {
        self.commands
            .insert(C::TYPE_TAG.to_string(), invoke_command::<C> as OneWayInvoker);
    }

    pub(crate) fn add_event<E: ApplicationEvent>(&mut self) {
        self.events
            .insert(E::TYPE_TAG.to_string(), invoke_event::<E> as OneWayInvoker);
    }

    pub(crate) fn request(&self, type_tag: &str) -> Option<RequestInvoker> {
        self.requests.get(type_tag).copied()
    }

    pub(crate) fn command(&self, type_tag: &str) -> Option<OneWayInvoker> {
        self.commands.get(type_tag).copied()
    }

    pub(crate) fn event(&self, type_tag: &str) -> Option<OneWayInvoker> {
        self.events.get(type_tag).copied()
    }
}

/// Exactly one handler, or the matching error.
fn single_handler<T: 'static>(scope: &Scope, key: &HandlerKey) -> Result<T, BusError> {
    let mut resolved = scope.resolve_all::<T>(key);
    match resolved.len() {
        0 => Err(BusError::NoHandler {
            message_type: key.type_tag.clone(),
        }),
        1 => Ok(resolved.remove(0).handler),
        _ => Err(BusError::MultipleHandlers {
            message_type: key.type_tag.clone(),
            handlers: resolved.into_iter().map(|r| r.name).collect(),
        }),
    }
}

fn invoke_request<'a, R: Request>(
    codec: Codec,
    payload: &'a [u8],
    scope: &'a Scope,
) -> BoxFuture<'a, Result<EncodedReply, BusError>> {
    Box::pin(async move {
        let request: R = codec.decode(payload)?;
        let handler =
            single_handler::<Arc<dyn RequestHandler<R>>>(scope, &HandlerKey::request(R::TYPE_TAG))?;
        let reply = handler.execute(request).await.map_err(BusError::Fault)?;
        Ok(EncodedReply {
            type_tag: <R::Reply as Message>::TYPE_TAG,
            payload: codec.encode(&reply)?,
        })
    })
}

fn invoke_command<'a, C: Command>(
    codec: Codec,
    payload: &'a [u8],
    scope: &'a Scope,
) -> BoxFuture<'a, Result<(), BusError>> {
    Box::pin(async move {
        let command: C = codec.decode(payload)?;
        let handler =
            single_handler::<Arc<dyn CommandHandler<C>>>(scope, &HandlerKey::command(C::TYPE_TAG))?;
        handler.execute(command).await.map_err(BusError::Fault)
    })
}

fn invoke_event<'a, E: ApplicationEvent>(
    codec: Codec,
    payload: &'a [u8],
    scope: &'a Scope,
) -> BoxFuture<'a, Result<(), BusError>> {
    Box::pin(async move {
        let event: E = codec.decode(payload)?;
        let subscribers =
            scope.resolve_all::<Arc<dyn EventSubscriber<E>>>(&HandlerKey::event(E::TYPE_TAG));
        if subscribers.is_empty() {
            debug!(type_tag = E::TYPE_TAG, "No subscribers for event");
            return Ok(());
        }

        let outcomes = join_all(subscribers.iter().map(|s| s.handler.handle(&event))).await;
        for (subscriber, outcome) in subscribers.iter().zip(outcomes) {
            if let Err(fault) = outcome {
                debug!(
                    type_tag = E::TYPE_TAG,
                    subscriber = %subscriber.name,
                    fault = %fault,
                    "Event subscriber failed"
                );
                return Err(BusError::Fault(fault));
            }
        }
        Ok(())
    })
}

type ReplyDecoder = fn(Codec, &[u8]) -> ReplyOutcome;

fn decode_value<T: Message>(codec: Codec, payload: &[u8]) -> ReplyOutcome {
    let value: T = codec.decode(payload)?;
    Ok(Box::new(value))
}

fn decode_fault(codec: Codec, payload: &[u8]) -> ReplyOutcome {
    let fault: Fault = codec.decode(payload)?;
    Err(fault.into_error())
}

/// Reply tag -> decoder, on the client side. `Fault` is always known.
pub struct ReplyRegistry {
    decoders: DashMap<String, ReplyDecoder>,
}

impl Default for ReplyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyRegistry {
    pub fn new() -> Self {
        let decoders = DashMap::new();
        decoders.insert(Fault::TYPE_TAG.to_string(), decode_fault as ReplyDecoder);
        Self { decoders }
    }

    /// Idempotent.
    pub fn register<T: Message>(&self) {
        self.decoders
            .entry(T::TYPE_TAG.to_string())
            .or_insert(decode_value::<T> as ReplyDecoder);
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    /// Decode a reply payload. `None` if the tag was never registered.
    pub fn decode(&self, type_tag: &str, codec: Codec, payload: &[u8]) -> Option<ReplyOutcome> {
        let decoder = *self.decoders.get(type_tag)?;
        Some(decoder(codec, payload))
    }
}
