// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log aggregation
//!
//! Stage output is produced by background tasks (process pipe pumps) but
//! observers only ever run on the coordinating task. Producers push through
//! a [`LogWriter`], which enqueues and wakes the coordinator; the coordinator
//! waits on [`LogAggregator::ready`] and drains with [`LogAggregator::dispatch`].

use kiln_core::{IdSeq, LogStream, ObserverId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Maximum entries delivered per dispatch pass.
pub const DISPATCH_BATCH: usize = 20;

/// Callback receiving `(stream, line)` on the coordinating task.
pub type LogObserver = Arc<dyn Fn(LogStream, &str) + Send + Sync>;

#[derive(Default)]
struct Queue {
    entries: Mutex<VecDeque<(LogStream, String)>>,
    wake: Notify,
    armed: AtomicBool,
}

impl Queue {
    fn push(&self, stream: LogStream, message: String) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((stream, message));
        if !self.armed.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Producer handle. Cheap to clone and safe to move into any task.
#[derive(Clone)]
pub struct LogWriter {
    queue: Arc<Queue>,
}

impl LogWriter {
    /// Enqueue one line. Never blocks beyond the queue lock.
    pub fn write(&self, stream: LogStream, message: impl Into<String>) {
        self.queue.push(stream, message.into());
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

/// Multi-producer, single-consumer bridge from stage output to observers.
pub struct LogAggregator {
    queue: Arc<Queue>,
    observers: Mutex<BTreeMap<ObserverId, LogObserver>>,
    ids: IdSeq,
}

impl LogAggregator {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Queue::default()),
            observers: Mutex::new(BTreeMap::new()),
            ids: IdSeq::new(),
        }
    }

    pub fn writer(&self) -> LogWriter {
        LogWriter {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn add_observer(&self, observer: impl Fn(LogStream, &str) + Send + Sync + 'static) -> ObserverId {
        let id = self.ids.next();
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Deliver a line synchronously. Only call from the coordinating task.
    pub fn write(&self, stream: LogStream, message: &str) {
        for observer in self.snapshot() {
            observer(stream, message);
        }
    }

    /// Resolves when queued entries are waiting for dispatch.
    pub async fn ready(&self) {
        self.queue.wake.notified().await;
    }

    /// Deliver up to [`DISPATCH_BATCH`] queued entries, in enqueue order.
    /// Re-arms the wakeup when entries remain. Returns how many were delivered.
    pub fn dispatch(&self) -> usize {
        self.queue.armed.store(false, Ordering::Release);

        let batch: Vec<(LogStream, String)> = {
            let mut entries = self.queue.entries.lock().unwrap_or_else(|e| e.into_inner());
            let n = entries.len().min(DISPATCH_BATCH);
            entries.drain(..n).collect()
        };

        if self.queue.len() > 0 && !self.queue.armed.swap(true, Ordering::AcqRel) {
            self.queue.wake.notify_one();
        }

        if batch.is_empty() {
            return 0;
        }
        let observers = self.snapshot();
        for (stream, message) in &batch {
            for observer in &observers {
                observer(*stream, message);
            }
        }
        batch.len()
    }

    /// Dispatch until the queue is empty.
    pub fn flush(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.dispatch();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Number of queued, undelivered entries.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn snapshot(&self) -> Vec<LogObserver> {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
