//! Notifier that records what it was asked to send.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use labrun_flow::notify::{Notifier, TeardownFailureNotice};

/// Records every notice and answers with scripted delivery results.
#[derive(Debug)]
pub struct RecordingNotifier {
    results: Mutex<VecDeque<bool>>,
    default_result: bool,
    sent: Mutex<Vec<TeardownFailureNotice>>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNotifier {
    /// A notifier that accepts every notice.
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            default_result: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A notifier whose relay is always down.
    pub fn failing() -> Self {
        Self {
            default_result: false,
            ..Self::new()
        }
    }

    /// Queues the result of the next send.
    pub fn then(self, delivered: bool) -> Self {
        self.results
            .lock()
            .expect("results lock")
            .push_back(delivered);
        self
    }

    /// Returns every notice passed to `send`, oldest first.
    pub fn notices(&self) -> Vec<TeardownFailureNotice> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Number of send attempts.
    pub fn attempts(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &TeardownFailureNotice) -> bool {
        self.sent
            .lock()
            .expect("sent lock")
            .push(notice.clone());
        self.results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or(self.default_result)
    }
}
