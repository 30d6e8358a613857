//! In-memory FIFO of pending sessions.
//!
//! Producers (ingest handlers, the file watcher, the transcript watcher)
//! push entries; the worker is the only consumer. A session re-enqueued
//! after back-pressure goes to the tail — enqueue order is otherwise
//! processing order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use tracing::info;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub session_id: String,
    pub file: PathBuf,
    pub queued_at: Instant,
}

#[derive(Debug, Default)]
pub struct SessionQueue {
    inner: Mutex<VecDeque<QueueEntry>>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, session_id: impl Into<String>, file: PathBuf) {
        let entry = QueueEntry {
            session_id: session_id.into(),
            file,
            queued_at: Instant::now(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.push_back(entry);
        let depth = inner.len();
        drop(inner);
        info!("worker: queued session (queue depth: {depth})");
    }

    pub fn requeue(&self, entry: QueueEntry) {
        self.inner.lock().unwrap().push_back(entry);
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
