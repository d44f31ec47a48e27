//! In-memory queue transport.
//!
//! Named queues with peek-lock delivery, sessions, time-to-live and a
//! dead-letter list, all behind one lock. Suitable for tests and single
//! process use; a broker-backed transport implements the same ports.
//!
//! Queues are created on first use unless the transport was built with
//! [`InMemoryTransport::strict`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::correlation::SessionId;
use crate::domain::envelope::{Delivery, Envelope, LockToken};
use crate::domain::error::TransportError;
use crate::ports::outbound::{QueueReceiver, QueueSender, SessionAcceptor, Transport};

/// Deliveries after which an abandoned message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

struct Stored {
    envelope: Envelope,
    enqueued_at: Instant,
    delivery_count: u32,
}

impl Stored {
    fn expired(&self, now: Instant) -> bool {
        self.envelope
            .time_to_live
            .is_some_and(|ttl| now.duration_since(self.enqueued_at) >= ttl)
    }
}

#[derive(Default)]
struct QueueState {
    notify: Arc<Notify>,
    /// Messages without a session id
    ready: VecDeque<Stored>,
    /// Session id -> messages addressed to it
    sessions: HashMap<String, VecDeque<Stored>>,
    locked_sessions: HashSet<String>,
    /// Lock token -> (session, message)
    in_flight: HashMap<u64, (Option<String>, Stored)>,
    dead_letters: Vec<Envelope>,
    send_failure: Option<String>,
    receive_failures: u32,
}

impl QueueState {
    fn lane(&mut self, session: Option<&str>) -> &mut VecDeque<Stored> {
        match session {
            Some(id) => self.sessions.entry(id.to_string()).or_default(),
            None => &mut self.ready,
        }
    }
}

struct Broker {
    queues: Mutex<HashMap<String, QueueState>>,
    strict: bool,
    max_delivery_count: u32,
    next_lock: AtomicU64,
}

impl Broker {
    fn with_queue<T>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut QueueState) -> T,
    ) -> Result<T, TransportError> {
        let mut queues = self.queues.lock();
        if self.strict && !queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        Ok(f(queues.entry(queue.to_string()).or_default()))
    }

    fn enqueue(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.with_queue(queue, |state| {
            if let Some(reason) = &state.send_failure {
                return Err(TransportError::SendFailed(reason.clone()));
            }
            let session = envelope.session_id.clone();
            state.lane(session.as_deref()).push_back(Stored {
                envelope,
                enqueued_at: Instant::now(),
                delivery_count: 0,
            });
            state.notify.notify_waiters();
            Ok(())
        })?
    }

    fn try_take(
        &self,
        queue: &str,
        session: Option<&str>,
    ) -> Result<Option<Delivery>, TransportError> {
        self.with_queue(queue, |state| {
            if state.receive_failures > 0 {
                state.receive_failures -= 1;
                return Err(TransportError::ReceiveFailed(format!(
                    "injected receive failure on {queue}"
                )));
            }

            let now = Instant::now();
            let lane = state.lane(session);
            let mut next = None;
            while let Some(stored) = lane.pop_front() {
                if stored.expired(now) {
                    debug!(queue = queue, message = %stored.envelope, "Dropping expired message");
                    continue;
                }
                next = Some(stored);
                break;
            }

            let Some(mut stored) = next else {
                return Ok(None);
            };
            stored.delivery_count += 1;
            let lock = self.next_lock.fetch_add(1, Ordering::Relaxed);
            let delivery = Delivery {
                envelope: stored.envelope.clone(),
                lock: LockToken(lock),
                delivery_count: stored.delivery_count,
            };
            state
                .in_flight
                .insert(lock, (session.map(str::to_string), stored));
            Ok(Some(delivery))
        })?
    }

    async fn receive(
        &self,
        queue: &str,
        session: Option<&str>,
        max_wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notify = self.with_queue(queue, |state| state.notify.clone())?;
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before looking so a concurrent send cannot slip by.
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue, session)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn settle(&self, queue: &str, lock: LockToken, complete: bool) -> Result<(), TransportError> {
        let max_delivery_count = self.max_delivery_count;
        self.with_queue(queue, |state| {
            let (session, stored) = state
                .in_flight
                .remove(&lock.0)
                .ok_or(TransportError::LockLost(lock.0))?;
            if complete {
                return Ok(());
            }
            if stored.delivery_count >= max_delivery_count {
                warn!(
                    queue = queue,
                    message = %stored.envelope,
                    delivery_count = stored.delivery_count,
                    "Moving message to dead letters"
                );
                state.dead_letters.push(stored.envelope);
            } else {
                state.lane(session.as_deref()).push_front(stored);
                state.notify.notify_waiters();
            }
            Ok(())
        })?
    }

    fn lock_session(&self, queue: &str, session: &str) -> Result<(), TransportError> {
        self.with_queue(queue, |state| {
            if !state.locked_sessions.insert(session.to_string()) {
                return Err(TransportError::SessionLocked(session.to_string()));
            }
            Ok(())
        })?
    }

    fn release_session(&self, queue: &str, session: &str) {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(queue) {
            state.locked_sessions.remove(session);
        }
    }
}

/// In-memory transport. Clones share the same queues.
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Create a transport that creates queues on first use.
    pub fn new() -> Self {
        Self::build(false, &[])
    }

    /// Create a transport that only knows the given queues.
    pub fn strict(queues: &[&str]) -> Self {
        Self::build(true, queues)
    }

    fn build(strict: bool, queues: &[&str]) -> Self {
        let queues = queues
            .iter()
            .map(|name| (name.to_string(), QueueState::default()))
            .collect();
        Self {
            broker: Arc::new(Broker {
                queues: Mutex::new(queues),
                strict,
                max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
                next_lock: AtomicU64::new(1),
            }),
        }
    }

    /// Set the delivery count after which abandoned messages are dead-lettered.
    /// Call before handing the transport out.
    pub fn with_max_delivery_count(self, count: u32) -> Self {
        let broker = match Arc::try_unwrap(self.broker) {
            Ok(broker) => Broker {
                max_delivery_count: count.max(1),
                ..broker
            },
            Err(shared) => return Self { broker: shared },
        };
        Self {
            broker: Arc::new(broker),
        }
    }

    pub fn create_queue(&self, queue: &str) {
        self.broker
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
    }

    /// Messages waiting in the queue, all sessions included, in-flight excluded.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inspect(queue, |state| {
            state.ready.len() + state.sessions.values().map(VecDeque::len).sum::<usize>()
        })
    }

    /// Messages waiting for one session.
    pub fn session_len(&self, queue: &str, session: &str) -> usize {
        self.inspect(queue, |state| state.sessions.get(session).map_or(0, VecDeque::len))
    }

    /// Messages received but neither completed nor abandoned.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.inspect(queue, |state| state.in_flight.len())
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Envelope> {
        self.inspect(queue, |state| state.dead_letters.clone())
    }

    pub fn is_session_locked(&self, queue: &str, session: &str) -> bool {
        self.inspect(queue, |state| state.locked_sessions.contains(session))
    }

    /// Make every send to `queue` fail until cleared with `None`.
    pub fn fail_sends(&self, queue: &str, reason: Option<&str>) {
        self.create_queue(queue);
        self.inspect(queue, |state| state.send_failure = reason.map(str::to_string));
    }

    /// Make the next `count` receives on `queue` fail.
    pub fn fail_next_receives(&self, queue: &str, count: u32) {
        self.create_queue(queue);
        self.inspect(queue, |state| state.receive_failures = count);
    }

    fn inspect<T: Default>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.broker.queues.lock();
        queues.get_mut(queue).map(f).unwrap_or_default()
    }

    fn ensure_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.broker.with_queue(queue, |_| ())
    }
}

impl Transport for InMemoryTransport {
    fn sender(&self, queue: &str) -> Result<Arc<dyn QueueSender>, TransportError> {
        self.ensure_queue(queue)?;
        Ok(Arc::new(MemorySender {
            broker: self.broker.clone(),
            queue: queue.to_string(),
        }))
    }

    fn receiver(&self, queue: &str) -> Result<Arc<dyn QueueReceiver>, TransportError> {
        self.ensure_queue(queue)?;
        Ok(Arc::new(MemoryReceiver::new(
            self.broker.clone(),
            queue.to_string(),
            None,
        )))
    }

    fn sessions(&self, queue: &str) -> Result<Arc<dyn SessionAcceptor>, TransportError> {
        self.ensure_queue(queue)?;
        Ok(Arc::new(MemorySessions {
            broker: self.broker.clone(),
            queue: queue.to_string(),
        }))
    }
}

struct MemorySender {
    broker: Arc<Broker>,
    queue: String,
}

#[async_trait]
impl QueueSender for MemorySender {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.broker.enqueue(&self.queue, envelope)
    }
}

struct MemoryReceiver {
    broker: Arc<Broker>,
    queue: String,
    session: Option<String>,
    closed: AtomicBool,
}

impl MemoryReceiver {
    fn new(broker: Arc<Broker>, queue: String, session: Option<String>) -> Self {
        Self {
            broker,
            queue,
            session,
            closed: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = &self.session {
            self.broker.release_session(&self.queue, session);
            debug!(queue = %self.queue, session_id = %session, "Released session");
        }
    }
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.broker
            .receive(&self.queue, self.session.as_deref(), max_wait)
            .await
    }

    async fn complete(&self, lock: LockToken) -> Result<(), TransportError> {
        self.broker.settle(&self.queue, lock, true)
    }

    async fn abandon(&self, lock: LockToken) -> Result<(), TransportError> {
        self.broker.settle(&self.queue, lock, false)
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemorySessions {
    broker: Arc<Broker>,
    queue: String,
}

#[async_trait]
impl SessionAcceptor for MemorySessions {
    async fn accept_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn QueueReceiver>, TransportError> {
        self.broker.lock_session(&self.queue, session_id.as_str())?;
        debug!(queue = %self.queue, session_id = %session_id, "Accepted session");
        Ok(Arc::new(MemoryReceiver::new(
            self.broker.clone(),
            self.queue.clone(),
            Some(session_id.to_string()),
        )))
    }
}
