//! Request/reply client.
//!
//! Each bus owns one reply session on the reply queue. `execute` registers a
//! pending call under a fresh correlation id, sends the request carrying that
//! id and the session, and suspends until the reply loop resolves the call.
//!
//! ```text
//! execute ──put──▶ PendingCallTable ◀──take── reply loop ◀── reply session
//!    │                                                            ▲
//!    └──send──▶ request queue ──▶ listener ──▶ reply queue ───────┘
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn};

use crate::codec::Codec;
use crate::domain::config::{BusConfig, QueuePair};
use crate::domain::correlation::{CorrelationId, SessionId};
use crate::domain::envelope::{Delivery, Envelope};
use crate::domain::error::BusError;
use crate::domain::fault::Fault;
use crate::domain::message::{Message, Query, Request};
use crate::domain::pending::{
    sweep_task, PendingCall, PendingCallTable, PendingGuard, PendingStats, ReplyOutcome,
};
use crate::listener::receive_loop::{Inbound, LoopHandle, OpenReceiver, Rejection};
use crate::notify::FailureNotifier;
use crate::ports::outbound::{QueueSender, SessionAcceptor, Transport};
use crate::registry::ReplyRegistry;
use crate::shutdown::LoopState;

/// Matches replies on the bus session to pending calls.
struct ReplyProcessor {
    pending: Arc<PendingCallTable>,
    replies: Arc<ReplyRegistry>,
    codec: Codec,
}

impl ReplyProcessor {
    fn decode(&self, expected: &'static str, type_tag: &str, envelope: &Envelope) -> ReplyOutcome {
        if !self.replies.contains(type_tag) {
            return Err(BusError::UnknownMessage(format!(
                "reply type '{type_tag}' is not registered with this bus"
            )));
        }
        if type_tag != expected && type_tag != Fault::TYPE_TAG {
            return Err(BusError::UnexpectedReply {
                expected: expected.to_string(),
                actual: type_tag.to_string(),
            });
        }
        let codec = self.codec.for_envelope(envelope);
        self.replies
            .decode(type_tag, codec, &envelope.payload)
            .unwrap_or_else(|| {
                Err(BusError::UnknownMessage(format!(
                    "reply type '{type_tag}' is not registered with this bus"
                )))
            })
    }
}

#[async_trait]
impl Inbound for ReplyProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), Rejection> {
        let envelope = &delivery.envelope;
        let correlation_id = envelope.reply_correlation().map_err(Rejection::remove)?;
        // Checked before `take` so an untagged reply leaves its caller waiting.
        let type_tag = envelope.require_type_tag().map_err(Rejection::remove)?;

        let Some(call) = self.pending.take(&correlation_id) else {
            warn!(correlation_id = %correlation_id, "Reply for unknown or expired call");
            return Err(Rejection::remove(BusError::UnknownMessage(format!(
                "no pending call with id {correlation_id} for message {envelope}; \
                 was it removed due to timeout?"
            ))));
        };

        let outcome = self.decode(call.reply_type(), type_tag, envelope);
        let failed = outcome.is_err();
        if !call.resolve(outcome) {
            debug!(correlation_id = %correlation_id, "Caller went away before its reply arrived");
        }
        debug!(correlation_id = %correlation_id, failed = failed, "Resolved pending call");
        Ok(())
    }

    fn on_fatal(&self, error: &BusError) {
        let failed = self.pending.fail_all(error);
        if failed > 0 {
            warn!(failed = failed, "Failed all pending calls after the reply loop died");
        }
    }
}

struct Inner {
    queues: QueuePair,
    session_id: SessionId,
    requests: Arc<dyn QueueSender>,
    sessions: Arc<dyn SessionAcceptor>,
    pending: Arc<PendingCallTable>,
    replies: Arc<ReplyRegistry>,
    codec: Codec,
    time_to_live: Option<Duration>,
    receive_wait: Duration,
    reply_timeout: Option<Duration>,
    sweep_interval: Duration,
    handle: LoopHandle,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Client that sends requests and awaits their replies. Clones share one
/// session and one pending call table.
#[derive(Clone)]
pub struct RequestReplyBus {
    inner: Arc<Inner>,
}

/// Queries use the request/reply protocol on their own queue pair.
pub type QueryBus = RequestReplyBus;

impl RequestReplyBus {
    /// Open the request sender and the reply session acceptor. The bus does
    /// not receive replies until [`start`](Self::start) is called.
    pub fn new(
        transport: Arc<dyn Transport>,
        queues: QueuePair,
        config: &BusConfig,
    ) -> Result<Self, BusError> {
        let requests = transport.sender(&queues.request_queue)?;
        let sessions = transport.sessions(&queues.reply_queue)?;
        Ok(Self {
            inner: Arc::new(Inner {
                queues,
                session_id: SessionId::generate(),
                requests,
                sessions,
                pending: Arc::new(PendingCallTable::new()),
                replies: Arc::new(ReplyRegistry::new()),
                codec: config.codec,
                time_to_live: config.time_to_live,
                receive_wait: config.receive_wait,
                reply_timeout: config.reply_timeout,
                sweep_interval: config.sweep_interval,
                handle: LoopHandle::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }

    /// Accept the reply session and start the reply loop, plus the timeout
    /// sweep when a reply timeout is configured.
    pub fn start(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        let processor = ReplyProcessor {
            pending: inner.pending.clone(),
            replies: inner.replies.clone(),
            codec: inner.codec,
        };
        let open: OpenReceiver = {
            let sessions = inner.sessions.clone();
            let session_id = inner.session_id.clone();
            Box::pin(async move { sessions.accept_session(&session_id).await })
        };
        let span = info_span!(
            "reply_loop",
            queue = %inner.queues.reply_queue,
            session_id = %inner.session_id
        );
        inner.handle.start(processor, open, inner.receive_wait, span)?;

        if let Some(max_age) = inner.reply_timeout {
            let task = tokio::spawn(sweep_task(
                inner.pending.clone(),
                inner.sweep_interval,
                max_age,
            ));
            *inner.sweeper.lock() = Some(task);
        }
        debug!(
            request_queue = %inner.queues.request_queue,
            reply_queue = %inner.queues.reply_queue,
            session_id = %inner.session_id,
            "Request/reply bus started"
        );
        Ok(())
    }

    /// Send a request and wait for its reply.
    ///
    /// A handler fault arrives as `BusError::Fault`; a missing or ambiguous
    /// handler as `NoHandler` / `MultipleHandlers`. With a reply timeout
    /// configured an unanswered call fails with `Timeout`; without one it
    /// waits until a reply arrives.
    pub async fn execute<R: Request>(&self, request: R) -> Result<R::Reply, BusError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.replies.register::<R::Reply>();

        let correlation_id = CorrelationId::new();
        let envelope = inner
            .codec
            .envelope(R::TYPE_TAG, &request)?
            .with_message_id(correlation_id.to_string())
            .with_reply_to_session(&inner.session_id)
            .with_time_to_live(inner.time_to_live);

        let (call, receiver) = PendingCall::new(<R::Reply as Message>::TYPE_TAG);
        inner.pending.put(correlation_id, call)?;
        let guard = PendingGuard::new(inner.pending.clone(), correlation_id);

        if let Err(e) = inner.requests.send(envelope).await {
            drop(guard);
            warn!(correlation_id = %correlation_id, error = %e, "Failed to send request");
            return Err(e.into());
        }
        debug!(
            correlation_id = %correlation_id,
            type_tag = R::TYPE_TAG,
            session_id = %inner.session_id,
            "Sent request"
        );

        let outcome = receiver.await.map_err(|_| BusError::ReplyDropped);
        drop(guard);
        let reply = outcome??;
        reply
            .downcast::<R::Reply>()
            .map(|reply| *reply)
            .map_err(|_| BusError::UnexpectedReply {
                expected: <R::Reply as Message>::TYPE_TAG.to_string(),
                actual: "a value of another type".to_string(),
            })
    }

    /// Send a query and wait for its result.
    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Reply, BusError> {
        self.execute(query).await
    }

    /// Make a reply type known before any request for it is sent.
    pub fn register_reply<T: Message>(&self) {
        self.inner.replies.register::<T>();
    }

    /// Stop the reply loop. Calls still pending are left to the timeout
    /// sweep; new calls fail with `Stopped`.
    pub async fn stop(&self) {
        self.inner.handle.stop().await;
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn queues(&self) -> &QueuePair {
        &self.inner.queues
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn pending_stats(&self) -> &PendingStats {
        self.inner.pending.stats()
    }

    pub fn failures(&self) -> &FailureNotifier {
        self.inner.handle.notifier()
    }

    pub fn state(&self) -> LoopState {
        self.inner.handle.state()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.handle.state() == LoopState::Faulted {
            return Err(BusError::FatalBus(
                "the reply loop has failed; create a new bus".to_string(),
            ));
        }
        if self.handle.shutdown().should_stop() {
            return Err(BusError::Stopped);
        }
        Ok(())
    }
}
