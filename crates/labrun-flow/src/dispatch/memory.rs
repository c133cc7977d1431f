//! In-memory task queue.
//!
//! This module provides [`InMemoryTaskQueue`], an in-memory implementation
//! of [`TaskQueue`] and [`TaskSource`] used by tests and single-process
//! deployments of the worker.
//!
//! ## Limitations
//!
//! - **NOT durable**: Pending tasks are lost when the process exits
//! - **Single-process only**: Tasks are not visible across process boundaries
//! - **Deduplication is pending-scoped**: Keys are released when tasks are dequeued

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{EnqueueResult, TaskEnvelope, TaskQueue, TaskSource};
use crate::error::{Error, Result};

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// Idempotency key for deduplication.
    pub idempotency_key: String,
    /// Task envelope.
    pub envelope: TaskEnvelope,
}

/// Internal queue state protected by a single lock.
///
/// Entries are ordered by `(eta, sequence)` so equal ETAs dequeue FIFO.
#[derive(Debug, Default)]
struct QueueState {
    queue: BTreeMap<(DateTime<Utc>, u64), QueueEntry>,
    seen_keys: HashMap<String, String>,
    sequence: u64,
}

impl QueueState {
    fn pop_first_if(&mut self, due: impl Fn(&QueueEntry) -> bool) -> Option<QueueEntry> {
        let key = *self
            .queue
            .iter()
            .next()
            .filter(|(_, entry)| due(entry))
            .map(|(key, _)| key)?;
        let entry = self.queue.remove(&key)?;
        self.seen_keys.remove(&entry.idempotency_key);
        Some(entry)
    }
}

/// In-memory task queue ordered by ETA.
///
/// ## Example
///
/// ```rust
/// use labrun_flow::dispatch::memory::InMemoryTaskQueue;
///
/// let queue = InMemoryTaskQueue::new("labrun_tasks");
/// assert_eq!(queue.pending().map(|p| p.len()).unwrap_or_default(), 0);
/// ```
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    name: String,
    state: RwLock<QueueState>,
    /// Maximum queue capacity.
    max_capacity: Option<usize>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new("labrun_tasks")
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task queue lock poisoned")
}

impl InMemoryTaskQueue {
    /// Creates a new in-memory task queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: None,
        }
    }

    /// Creates a queue with a maximum capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            max_capacity: Some(max_capacity),
            ..Self::new(name)
        }
    }

    /// Takes the earliest task regardless of its ETA.
    ///
    /// Tests use this to step through a lifecycle without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.pop_first_if(|_| true);
        drop(state);
        Ok(entry)
    }

    /// Takes the earliest task if its ETA has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.pop_first_if(|entry| entry.envelope.is_due(now));
        drop(state);
        Ok(entry)
    }

    /// Peeks at the earliest task without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn peek(&self) -> Result<Option<QueueEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.values().next().cloned())
    }

    /// Returns a snapshot of pending envelopes in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending(&self) -> Result<Vec<TaskEnvelope>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .queue
            .values()
            .map(|entry| entry.envelope.clone())
            .collect())
    }

    /// Returns pending envelopes carrying the given UUID.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending_for(&self, uuid: &str) -> Result<Vec<TaskEnvelope>> {
        Ok(self
            .pending()?
            .into_iter()
            .filter(|envelope| envelope.uuid == uuid)
            .collect())
    }

    /// Removes and returns all pending tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let drained: Vec<_> = std::mem::take(&mut state.queue).into_values().collect();
        state.seen_keys.clear();
        drop(state);
        Ok(drained)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<EnqueueResult> {
        let idempotency_key = envelope.idempotency_key();

        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.seen_keys.get(&idempotency_key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        if let Some(max) = self.max_capacity {
            if state.queue.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Ulid::new().to_string();
        state
            .seen_keys
            .insert(idempotency_key.clone(), message_id.clone());
        state.sequence += 1;
        let key = (envelope.eta, state.sequence);
        state.queue.insert(
            key,
            QueueEntry {
                message_id: message_id.clone(),
                idempotency_key,
                envelope,
            },
        );
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TaskSource for InMemoryTaskQueue {
    async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<TaskEnvelope>> {
        Ok(self.take_due(now)?.map(|entry| entry.envelope))
    }
}
