//! Bus-level failure notifications.
//!
//! Each bus or listener owns a [`FailureNotifier`]. Failures that cannot be
//! delivered to a caller (unknown messages, fatal transport errors, handler
//! failures on one-way messages) are logged and handed to every subscriber
//! in registration order. Subscribers may change the disposition.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::domain::notice::{FailureNotice, MessageHandling};

type Subscriber = Arc<dyn Fn(&mut FailureNotice) + Send + Sync>;

/// Per-instance subscriber list. Clones share the list.
#[derive(Clone, Default)]
pub struct FailureNotifier {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl FailureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It runs on the receive loop, so keep it short.
    pub fn subscribe(&self, subscriber: impl Fn(&mut FailureNotice) + Send + Sync + 'static) {
        self.subscribers.write().push(Arc::new(subscriber));
    }

    /// Forward a copy of every notice into a channel the caller drains.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<FailureNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |notice| {
            let _ = tx.send(notice.clone());
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Log the notice, run the subscribers and return the final disposition.
    pub fn notify(&self, mut notice: FailureNotice) -> MessageHandling {
        let message = notice
            .envelope
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        if notice.is_fatal() {
            error!(error = %notice.error, message = %message, "Fatal bus failure");
        } else {
            warn!(
                error = %notice.error,
                message = %message,
                disposition = ?notice.disposition(),
                "Bus failure"
            );
        }

        // Snapshot so a subscriber may subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber(&mut notice);
        }
        notice.disposition()
    }
}

impl std::fmt::Debug for FailureNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
