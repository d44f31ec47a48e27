//! Request dispatcher: answers requests and queries.
//!
//! For each request the dispatcher reads the caller's correlation id and
//! reply session, resolves exactly one handler in a fresh scope, runs it and
//! sends the reply (or a fault) to the caller's session on the reply queue.
//!
//! Disposition:
//! - success: complete
//! - failure after a fault reply went out: notify, recommending removal
//! - failure before any reply, or a failed reply send: notify, recommending
//!   put back

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span};

use crate::codec::Codec;
use crate::container::{Container, Scope};
use crate::domain::config::{BusConfig, QueuePair};
use crate::domain::correlation::CorrelationId;
use crate::domain::envelope::{Delivery, Envelope};
use crate::domain::error::BusError;
use crate::domain::fault::Fault;
use crate::domain::message::Message;
use crate::listener::receive_loop::{panic_message, Inbound, LoopHandle, OpenReceiver, Rejection};
use crate::listener::SuccessHook;
use crate::notify::FailureNotifier;
use crate::ports::outbound::{QueueSender, Transport};
use crate::registry::EncodedReply;
use crate::shutdown::LoopState;

struct RequestDispatch {
    container: Arc<Container>,
    replies: Arc<dyn QueueSender>,
    codec: Codec,
    time_to_live: Option<Duration>,
    on_success: Option<SuccessHook>,
}

impl RequestDispatch {
    /// Decode, run the single handler and the success hook.
    async fn execute(&self, codec: Codec, envelope: &Envelope) -> Result<EncodedReply, BusError> {
        let type_tag = envelope.require_type_tag()?;
        let invoke = self.container.dispatch().request(type_tag).ok_or_else(|| {
            BusError::UnknownMessage(format!(
                "no request type is registered for '{type_tag}'; have all message types been registered?"
            ))
        })?;

        let scope = self.container.new_scope();
        let reply = AssertUnwindSafe(invoke(codec, &envelope.payload, &scope))
            .catch_unwind()
            .await
            .map_err(|panic| BusError::HandlerPanicked(panic_message(panic.as_ref())))??;

        if let Some(hook) = &self.on_success {
            run_hook(hook, &scope)?;
        }
        Ok(reply)
    }
}

/// A panicking hook is answered like a panicking handler.
fn run_hook(hook: &SuccessHook, scope: &Scope) -> Result<(), BusError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| hook(scope)))
        .map_err(|panic| BusError::HandlerPanicked(panic_message(panic.as_ref())))?
        .map_err(BusError::Fault)
}

#[async_trait]
impl Inbound for RequestDispatch {
    async fn process(&self, delivery: &Delivery) -> Result<(), Rejection> {
        let envelope = &delivery.envelope;
        let request_id = envelope.request_id().map_err(Rejection::put_back)?;
        let reply_session = envelope.reply_to_session_id.as_deref().ok_or_else(|| {
            Rejection::put_back(BusError::UnknownMessage(format!(
                "message {envelope} has no reply session; is something other than this library using the queue?"
            )))
        })?;

        let codec = self.codec.for_envelope(envelope);
        let outcome = self.execute(codec, envelope).await;

        let reply = match &outcome {
            Ok(encoded) => codec.raw_envelope(encoded.type_tag, encoded.payload.clone()),
            Err(error) => codec
                .envelope(Fault::TYPE_TAG, &error.to_fault())
                .map_err(Rejection::put_back)?,
        };
        let reply = reply
            .with_message_id(CorrelationId::new().to_string())
            .with_reply_to(request_id)
            .with_session(reply_session)
            .with_time_to_live(self.time_to_live);
        let reply_tag = reply.type_tag.clone().unwrap_or_default();

        self.replies
            .send(reply)
            .await
            .map_err(|e| Rejection::put_back(e.into()))?;
        debug!(
            correlation_id = %request_id,
            session_id = reply_session,
            type_tag = %reply_tag,
            "Sent reply"
        );

        outcome.map(|_| ()).map_err(Rejection::remove)
    }
}

/// Listens on a request queue and answers on the matching reply queue.
pub struct RequestReplyListener {
    transport: Arc<dyn Transport>,
    queues: QueuePair,
    container: Arc<Container>,
    codec: Codec,
    time_to_live: Option<Duration>,
    receive_wait: Duration,
    on_success: RwLock<Option<SuccessHook>>,
    handle: LoopHandle,
}

/// Queries share the request/reply protocol.
pub type QueryListener = RequestReplyListener;

impl RequestReplyListener {
    pub fn new(
        transport: Arc<dyn Transport>,
        queues: QueuePair,
        container: Arc<Container>,
        config: &BusConfig,
    ) -> Self {
        Self {
            transport,
            queues,
            container,
            codec: config.codec,
            time_to_live: config.time_to_live,
            receive_wait: config.receive_wait,
            on_success: RwLock::new(None),
            handle: LoopHandle::new(),
        }
    }

    /// Set the hook run after each successful handler. Takes effect at
    /// `start()`.
    pub fn on_success(&self, hook: impl Fn(&Scope) -> Result<(), Fault> + Send + Sync + 'static) {
        *self.on_success.write() = Some(Arc::new(hook));
    }

    /// Start the receive loop. Fails if already started or stopped.
    pub fn start(&self) -> Result<(), BusError> {
        let processor = RequestDispatch {
            container: self.container.clone(),
            replies: self.transport.sender(&self.queues.reply_queue)?,
            codec: self.codec,
            time_to_live: self.time_to_live,
            on_success: self.on_success.read().clone(),
        };
        let open: OpenReceiver = {
            let transport = self.transport.clone();
            let queue = self.queues.request_queue.clone();
            Box::pin(async move { transport.receiver(&queue) })
        };
        let span = info_span!("request_listener", queue = %self.queues.request_queue);
        self.handle.start(processor, open, self.receive_wait, span)?;
        debug!(
            request_queue = %self.queues.request_queue,
            reply_queue = %self.queues.reply_queue,
            "Request listener started"
        );
        Ok(())
    }

    /// Stop receiving. A request in progress is answered first.
    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn failures(&self) -> &FailureNotifier {
        self.handle.notifier()
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    pub fn queues(&self) -> &QueuePair {
        &self.queues
    }
}
