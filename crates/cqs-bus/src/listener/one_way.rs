//! Command and event listeners.
//!
//! Both pull one-way messages and never reply. A command needs exactly one
//! handler; an event goes to every registered subscriber concurrently, and
//! zero subscribers is fine. Any failure is reported through the failure
//! notifier, recommending that the message be put back.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span};

use crate::codec::Codec;
use crate::container::{Container, HandlerKind, Scope};
use crate::domain::config::BusConfig;
use crate::domain::envelope::Delivery;
use crate::domain::error::BusError;
use crate::domain::fault::Fault;
use crate::listener::receive_loop::{Inbound, LoopHandle, OpenReceiver, Rejection};
use crate::listener::SuccessHook;
use crate::notify::FailureNotifier;
use crate::ports::outbound::Transport;
use crate::registry::OneWayInvoker;
use crate::shutdown::LoopState;

/// Selects which one-way protocol a listener serves.
pub trait OneWayKind: Send + Sync + 'static {
    const KIND: HandlerKind;
    const NAME: &'static str;
}

/// Commands: exactly one handler.
pub struct Commands;

/// Events: any number of subscribers.
pub struct Events;

impl OneWayKind for Commands {
    const KIND: HandlerKind = HandlerKind::Command;
    const NAME: &'static str = "command";
}

impl OneWayKind for Events {
    const KIND: HandlerKind = HandlerKind::Event;
    const NAME: &'static str = "event";
}

struct OneWayDispatch<K> {
    container: Arc<Container>,
    codec: Codec,
    on_success: Option<SuccessHook>,
    _kind: PhantomData<K>,
}

impl<K: OneWayKind> OneWayDispatch<K> {
    fn invoker(&self, type_tag: &str) -> Option<OneWayInvoker> {
        let dispatch = self.container.dispatch();
        match K::KIND {
            HandlerKind::Command => dispatch.command(type_tag),
            HandlerKind::Event => dispatch.event(type_tag),
            HandlerKind::Request => None,
        }
    }
}

#[async_trait]
impl<K: OneWayKind> Inbound for OneWayDispatch<K> {
    async fn process(&self, delivery: &Delivery) -> Result<(), Rejection> {
        let envelope = &delivery.envelope;
        let type_tag = envelope.require_type_tag().map_err(Rejection::put_back)?;
        let invoke = self.invoker(type_tag).ok_or_else(|| {
            Rejection::put_back(BusError::UnknownMessage(format!(
                "no {} type is registered for '{type_tag}'; have all message types been registered?",
                K::NAME
            )))
        })?;

        let codec = self.codec.for_envelope(envelope);
        let scope = self.container.new_scope();
        invoke(codec, &envelope.payload, &scope)
            .await
            .map_err(Rejection::put_back)?;

        if let Some(hook) = &self.on_success {
            hook(&scope).map_err(|fault| Rejection::put_back(BusError::Fault(fault)))?;
        }
        debug!(type_tag = type_tag, kind = K::NAME, "Handled message");
        Ok(())
    }
}

/// Listener for commands or events on one queue.
pub struct OneWayListener<K: OneWayKind> {
    transport: Arc<dyn Transport>,
    queue: String,
    container: Arc<Container>,
    codec: Codec,
    receive_wait: Duration,
    on_success: RwLock<Option<SuccessHook>>,
    handle: LoopHandle,
    _kind: PhantomData<K>,
}

pub type CommandListener = OneWayListener<Commands>;
pub type EventListener = OneWayListener<Events>;

impl<K: OneWayKind> OneWayListener<K> {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: impl Into<String>,
        container: Arc<Container>,
        config: &BusConfig,
    ) -> Self {
        Self {
            transport,
            queue: queue.into(),
            container,
            codec: config.codec,
            receive_wait: config.receive_wait,
            on_success: RwLock::new(None),
            handle: LoopHandle::new(),
            _kind: PhantomData,
        }
    }

    /// Set the hook run after each successful message. Takes effect at
    /// `start()`.
    pub fn on_success(&self, hook: impl Fn(&Scope) -> Result<(), Fault> + Send + Sync + 'static) {
        *self.on_success.write() = Some(Arc::new(hook));
    }

    /// Start the receive loop. Fails if already started or stopped.
    pub fn start(&self) -> Result<(), BusError> {
        let processor = OneWayDispatch::<K> {
            container: self.container.clone(),
            codec: self.codec,
            on_success: self.on_success.read().clone(),
            _kind: PhantomData,
        };
        let open: OpenReceiver = {
            let transport = self.transport.clone();
            let queue = self.queue.clone();
            Box::pin(async move { transport.receiver(&queue) })
        };
        let span = info_span!("one_way_listener", kind = K::NAME, queue = %self.queue);
        self.handle.start(processor, open, self.receive_wait, span)?;
        debug!(queue = %self.queue, kind = K::NAME, "Listener started");
        Ok(())
    }

    /// Stop receiving. A message in progress is handled first.
    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn failures(&self) -> &FailureNotifier {
        self.handle.notifier()
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}
