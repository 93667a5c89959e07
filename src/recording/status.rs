//! "Recording active" observable
//!
//! Single writer (the session controller), any number of readers. Readers
//! subscribe for changes instead of polling shared global state.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

#[derive(Debug)]
pub struct RecordingStatus {
    sender: watch::Sender<bool>,
    publishes: AtomicU64,
}

impl RecordingStatus {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
            publishes: AtomicU64::new(0),
        }
    }

    /// Receiver that observes every subsequent transition
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn is_active(&self) -> bool {
        *self.sender.borrow()
    }

    /// Number of transitions published since creation
    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, active: bool) {
        self.sender.send_replace(active);
        self.publishes.fetch_add(1, Ordering::AcqRel);
        log::debug!("Recording active = {}", active);
    }
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::new()
    }
}
