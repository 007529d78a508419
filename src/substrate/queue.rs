//! In-process FIFO work queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkQueue;
use crate::error::PipelineError;
use crate::event::EventId;

/// A unit of work: "process this match".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub match_id: i64,
    /// Failed processing attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Event that caused the push; `None` for scheduled work.
    pub cause: Option<EventId>,
}

impl QueueItem {
    pub fn new(match_id: i64, cause: Option<EventId>) -> Self {
        Self {
            match_id,
            attempts: 0,
            enqueued_at: Utc::now(),
            cause,
        }
    }

    /// Same item, one more failed attempt, back at the tail.
    pub fn retried(&self) -> Self {
        Self {
            match_id: self.match_id,
            attempts: self.attempts + 1,
            enqueued_at: Utc::now(),
            cause: self.cause,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<QueueItem>,
    closed: bool,
}

#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn close(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.closed = true;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, PipelineError> {
        let g = self
            .inner
            .lock()
            .map_err(|_| PipelineError::unavailable(self.name.clone()))?;
        if g.closed {
            return Err(PipelineError::unavailable(self.name.clone()));
        }
        Ok(g)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, item: QueueItem) -> Result<(), PipelineError> {
        let mut g = self.lock()?;
        g.items.push_back(item);
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<QueueItem>, PipelineError> {
        let mut g = self.lock()?;
        Ok(g.items.pop_front())
    }

    async fn len(&self) -> Result<usize, PipelineError> {
        let g = self.lock()?;
        Ok(g.items.len())
    }
    fn close(&self) {
        MemoryQueue::close(self)
    }
}
