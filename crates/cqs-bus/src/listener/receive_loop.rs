//! Sequential peek-lock receive loop shared by every bus and listener.
//!
//! One message is fully processed and settled before the next receive is
//! issued. Per-message failures go to the failure notifier and never end the
//! loop; a failure to open the receiver or to receive is fatal.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument, Span};

use crate::domain::envelope::Delivery;
use crate::domain::error::{BusError, TransportError};
use crate::domain::notice::{FailureNotice, MessageHandling};
use crate::notify::FailureNotifier;
use crate::ports::outbound::QueueReceiver;
use crate::shutdown::{LoopState, ShutdownCoordinator};

/// Why a message was not processed, and what to do with it.
#[derive(Debug)]
pub(crate) struct Rejection {
    pub error: BusError,
    pub disposition: MessageHandling,
}

impl Rejection {
    pub fn put_back(error: BusError) -> Self {
        Self {
            error,
            disposition: MessageHandling::PutMessageBackInQueue,
        }
    }

    pub fn remove(error: BusError) -> Self {
        Self {
            error,
            disposition: MessageHandling::RemoveMessage,
        }
    }
}

/// Per-message processing plugged into the loop.
#[async_trait]
pub(crate) trait Inbound: Send + Sync + 'static {
    async fn process(&self, delivery: &Delivery) -> Result<(), Rejection>;

    /// Called once if the loop dies.
    fn on_fatal(&self, _error: &BusError) {}
}

pub(crate) type OpenReceiver =
    BoxFuture<'static, Result<Arc<dyn QueueReceiver>, TransportError>>;

struct ReceiveLoop<P> {
    processor: P,
    shutdown: Arc<ShutdownCoordinator>,
    notifier: FailureNotifier,
    receive_wait: Duration,
}

impl<P: Inbound> ReceiveLoop<P> {
    async fn run(self, open: OpenReceiver) {
        self.shutdown.set_state(LoopState::AwaitingSession);
        let receiver = match open.await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.fail(format!("failed to open the receiver: {e}"));
                return;
            }
        };

        loop {
            if self.shutdown.should_stop() {
                break;
            }
            self.shutdown.set_state(LoopState::Receiving);
            match receiver.receive(self.receive_wait).await {
                Ok(None) => continue,
                Ok(Some(delivery)) => {
                    self.shutdown.set_state(LoopState::Handling);
                    self.handle(receiver.as_ref(), delivery).await;
                }
                Err(e) => {
                    receiver.close().await;
                    self.fail(format!("failed to receive: {e}"));
                    return;
                }
            }
        }

        self.shutdown.set_state(LoopState::Draining);
        receiver.close().await;
        self.shutdown.finish(LoopState::Stopped);
        debug!("Receive loop stopped");
    }

    async fn handle(&self, receiver: &dyn QueueReceiver, delivery: Delivery) {
        debug!(
            message = %delivery.envelope,
            delivery_count = delivery.delivery_count,
            "Received message"
        );

        let outcome = AssertUnwindSafe(self.processor.process(&delivery))
            .catch_unwind()
            .await;

        let disposition = match outcome {
            Ok(Ok(())) => MessageHandling::RemoveMessage,
            Ok(Err(rejection)) => self.notifier.notify(FailureNotice::new(
                Some(delivery.envelope),
                rejection.error,
                rejection.disposition,
            )),
            Err(panic) => self.notifier.notify(FailureNotice::new(
                Some(delivery.envelope),
                BusError::HandlerPanicked(panic_message(panic.as_ref())),
                MessageHandling::PutMessageBackInQueue,
            )),
        };

        let settled = match disposition {
            MessageHandling::RemoveMessage => receiver.complete(delivery.lock).await,
            MessageHandling::PutMessageBackInQueue => receiver.abandon(delivery.lock).await,
        };
        if let Err(e) = settled {
            warn!(error = %e, lock = delivery.lock.0, "Failed to settle message");
        }
    }

    fn fail(&self, detail: String) {
        let error = BusError::FatalBus(detail);
        self.processor.on_fatal(&error);
        self.notifier.notify(FailureNotice::new(
            None,
            error,
            MessageHandling::PutMessageBackInQueue,
        ));
        self.shutdown.finish(LoopState::Faulted);
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Lifecycle shared by every bus and listener: start once, stop once.
pub(crate) struct LoopHandle {
    shutdown: Arc<ShutdownCoordinator>,
    notifier: FailureNotifier,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopHandle {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(ShutdownCoordinator::new()),
            notifier: FailureNotifier::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the loop. Fails if already started or stopped.
    pub fn start<P: Inbound>(
        &self,
        processor: P,
        open: OpenReceiver,
        receive_wait: Duration,
        span: Span,
    ) -> Result<(), BusError> {
        self.shutdown.begin_start()?;
        let receive_loop = ReceiveLoop {
            processor,
            shutdown: self.shutdown.clone(),
            notifier: self.notifier.clone(),
            receive_wait,
        };
        let task = tokio::spawn(receive_loop.run(open).instrument(span));
        *self.task.lock() = Some(task);
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.stop().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Receive loop task ended abnormally");
            }
        }
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn notifier(&self) -> &FailureNotifier {
        &self.notifier
    }

    pub fn state(&self) -> LoopState {
        self.shutdown.state()
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        // The detached loop exits after its current receive.
        self.shutdown.request_stop();
    }
}
