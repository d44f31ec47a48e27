//! Pending call table: bridges a suspended caller to the reply loop.
//!
//! Flow:
//! 1. The client generates a CorrelationId
//! 2. The client calls `put()` and keeps the oneshot receiver
//! 3. The client sends the request carrying the CorrelationId
//! 4. The reply loop calls `take()` and resolves the call
//! 5. The client awaits the receiver
//!
//! `take()` is the only path to a completion handle, so each id resolves at
//! most once no matter how many replies carry it.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::correlation::CorrelationId;
use crate::domain::error::BusError;

/// What a suspended caller eventually receives: a decoded reply or an error.
pub type ReplyOutcome = Result<Box<dyn Any + Send>, BusError>;

/// A call waiting for its reply.
pub struct PendingCall {
    sender: oneshot::Sender<ReplyOutcome>,
    created_at: Instant,
    /// Reply type name (for logging)
    reply_type: &'static str,
}

impl PendingCall {
    /// Create a pending call and the receiver the caller awaits.
    pub fn new(reply_type: &'static str) -> (Self, oneshot::Receiver<ReplyOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let call = Self {
            sender,
            created_at: Instant::now(),
            reply_type,
        };
        (call, receiver)
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Deliver the outcome. Returns false if the caller already went away.
    pub fn resolve(self, outcome: ReplyOutcome) -> bool {
        self.sender.send(outcome).is_ok()
    }
}

/// Statistics for the pending call table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total calls registered
    pub total_registered: AtomicU64,
    /// Total calls taken by the reply loop
    pub total_completed: AtomicU64,
    /// Total calls removed without a reply (send failure, caller dropped)
    pub total_cancelled: AtomicU64,
    /// Total calls failed by the timeout sweep
    pub total_timeouts: AtomicU64,
}

/// Concurrent map from correlation id to pending call.
#[derive(Default)]
pub struct PendingCallTable {
    pending: DashMap<CorrelationId, PendingCall>,
    stats: PendingStats,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending call. Fails if the id is already present.
    pub fn put(&self, correlation_id: CorrelationId, call: PendingCall) -> Result<(), BusError> {
        match self.pending.entry(correlation_id) {
            Entry::Occupied(_) => Err(BusError::DuplicateCorrelation(correlation_id)),
            Entry::Vacant(slot) => {
                debug!(
                    correlation_id = %correlation_id,
                    reply_type = call.reply_type,
                    "Registered pending call"
                );
                slot.insert(call);
                self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Atomically remove and return the pending call, if present.
    pub fn take(&self, correlation_id: &CorrelationId) -> Option<PendingCall> {
        let (_, call) = self.pending.remove(correlation_id)?;
        self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        Some(call)
    }

    /// Remove a pending call without resolving it.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Fail every call older than `max_age` with `BusError::Timeout`.
    ///
    /// Returns the number of calls evicted.
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().age() > max_age)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            // The reply loop may have taken it since the scan.
            let Some((_, call)) = self.pending.remove_if(&id, |_, call| call.age() > max_age)
            else {
                continue;
            };
            warn!(
                correlation_id = %id,
                reply_type = call.reply_type,
                elapsed_ms = call.age().as_millis() as u64,
                timeout_ms = max_age.as_millis() as u64,
                "Evicting expired pending call"
            );
            call.resolve(Err(BusError::Timeout {
                correlation_id: id,
                timeout: max_age,
            }));
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            evicted += 1;
        }
        evicted
    }

    /// Fail every pending call with the given error. Used when the reply
    /// loop dies and no reply can ever arrive.
    pub fn fail_all(&self, error: &BusError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                call.resolve(Err(error.clone()));
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Removes the table entry when the caller's future is dropped mid-wait.
pub(crate) struct PendingGuard {
    table: Arc<PendingCallTable>,
    correlation_id: CorrelationId,
}

impl PendingGuard {
    pub(crate) fn new(table: Arc<PendingCallTable>, correlation_id: CorrelationId) -> Self {
        Self {
            table,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.cancel(&self.correlation_id) {
            debug!(
                correlation_id = %self.correlation_id,
                "Caller went away, removed pending call"
            );
        }
    }
}

/// Background task that evicts expired calls
pub async fn sweep_task(table: Arc<PendingCallTable>, interval: Duration, max_age: Duration) {
    let mut sweep_interval = tokio::time::interval(interval);
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        sweep_interval.tick().await;
        let evicted = table.evict_expired(max_age);
        if evicted > 0 {
            debug!(evicted = evicted, "Swept expired pending calls");
        }
    }
}
