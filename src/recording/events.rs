//! Control events delivered to the session controller

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

/// Asynchronous triggers routed into the single teardown path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The capture grant was withdrawn by the user or the host
    AuthorizationRevoked,
    /// A worker hit an unrecoverable capture or encode error
    WorkerFailed { worker: String, message: String },
    /// Teardown finished; the control watcher exits on this
    SessionEnded,
}

/// Handle given to a [`CaptureAuthorization`](crate::platform::CaptureAuthorization)
/// so it can report revocation
///
/// The revoked flag is set before the event is sent, so a start sequence
/// checking it at a checkpoint never misses a revocation that raced ahead of
/// the watcher.
#[derive(Debug, Clone)]
pub struct RevocationNotifier {
    revoked: Arc<AtomicBool>,
    events: Sender<ControlEvent>,
}

impl RevocationNotifier {
    pub(crate) fn new(revoked: Arc<AtomicBool>, events: Sender<ControlEvent>) -> Self {
        Self { revoked, events }
    }

    pub fn notify_revoked(&self) {
        if self.revoked.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Capture authorization revoked");
        if self.events.send(ControlEvent::AuthorizationRevoked).is_err() {
            log::debug!("Revocation arrived after the session ended");
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// Sender side used by workers to report failures
#[derive(Debug, Clone)]
pub(crate) struct FailureReporter {
    worker: &'static str,
    events: Sender<ControlEvent>,
}

impl FailureReporter {
    pub(crate) fn new(worker: &'static str, events: Sender<ControlEvent>) -> Self {
        Self { worker, events }
    }

    pub(crate) fn report(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{} failed: {}", self.worker, message);
        let _ = self.events.send(ControlEvent::WorkerFailed {
            worker: self.worker.to_string(),
            message,
        });
    }
}
