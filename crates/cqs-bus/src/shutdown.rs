//! Cooperative shutdown for receive loops.
//!
//! `stop()` raises a flag and waits for the loop to acknowledge. The loop
//! checks the flag only after a receive returns, so a message already in
//! hand is fully processed first. The acknowledgment is the loop state
//! reaching `Stopped` or `Faulted`, published through a `watch` channel.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

use crate::domain::error::BusError;

/// Where a receive loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, not started
    Idle,
    /// Waiting for the transport to hand out a receiver or session
    AwaitingSession,
    /// A receive is outstanding
    Receiving,
    /// Processing one message
    Handling,
    /// Stop observed, releasing the receiver
    Draining,
    Stopped,
    /// The receive machinery failed; the instance must be recreated
    Faulted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Faulted)
    }
}

/// Stop flag plus drain acknowledgment.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    started: AtomicBool,
    stop_requested: AtomicBool,
    state: watch::Sender<LoopState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            state,
        }
    }

    /// Claim the right to start the loop.
    pub fn begin_start(&self) -> Result<(), BusError> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted);
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Checked by the loop after every receive.
    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Raise the flag without waiting. Returns true the first time.
    pub fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::SeqCst)
    }

    /// Raise the flag and wait until the loop will not re-arm.
    ///
    /// A second call returns immediately. On a bus that never started the
    /// instance is simply marked stopped.
    pub async fn stop(&self) {
        if !self.request_stop() {
            return;
        }
        if !self.is_started() {
            self.finish(LoopState::Stopped);
            return;
        }
        debug!("Stop requested, waiting for the receive loop to drain");
        self.wait_terminal().await;
    }

    /// Wait until the loop reached `Stopped` or `Faulted`.
    pub async fn wait_terminal(&self) -> LoopState {
        let mut rx = self.state.subscribe();
        // Err: the sender lives in `self`, so this only happens mid-drop.
        rx.wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state)
            .unwrap_or(LoopState::Stopped)
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Record a non-terminal transition. Ignored once terminal.
    pub(crate) fn set_state(&self, next: LoopState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Release the acknowledgment. Only the first terminal state sticks.
    pub(crate) fn finish(&self, terminal: LoopState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = terminal;
            true
        });
    }
}
