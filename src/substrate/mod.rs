//! Shared substrate: the append-only event log, the two work queues, the
//! dedup set and the dead-letter store.
//!
//! The pipeline only talks to the [`EventLog`] and [`WorkQueue`] traits (plus
//! [`DedupStore`] and [`DeadLetterStore`]). Two backends implement them:
//! - in-process (`Memory*`): every operation atomic under a short critical
//!   section, never holding a lock across an `.await`; gone with the process.
//! - SQLite (`Sqlite*`): one database file shared by every process of a
//!   deployment; survives restarts.

pub mod log;
pub mod queue;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{PipelineConfig, SubstrateBackend};
use crate::deadletter::{DeadLetterQueue, DeadLetterStore};
use crate::error::PipelineError;
use crate::event::{Event, EventId, NewEvent};
use crate::ingest::dedup::{DedupStore, MemoryDedupStore};

pub use log::MemoryEventLog;
pub use queue::{MemoryQueue, QueueItem};
pub use sqlite::SqliteSubstrate;

/// One delivery of a logged event to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event: Event,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Durable append-only log with consumer-group, at-least-once delivery.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: NewEvent) -> Result<Event, PipelineError>;

    /// Create the group if missing. New groups start at the beginning of the log.
    async fn ensure_group(&self, group: &str) -> Result<(), PipelineError>;

    /// Deliver up to `count` entries to `consumer`: first entries whose
    /// visibility timeout expired, then entries past the group cursor. Waits at
    /// most `block` when nothing is available.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, PipelineError>;

    /// Returns `true` if the entry was pending for the group.
    async fn ack(&self, group: &str, id: EventId) -> Result<bool, PipelineError>;

    /// Delivered but not yet acknowledged entries of a group.
    async fn pending(&self, group: &str) -> Result<usize, PipelineError>;

    /// Entries still retained.
    async fn len(&self) -> Result<usize, PipelineError>;

    /// Mark the log unavailable. Every later call fails with
    /// [`PipelineError::SubstrateUnavailable`].
    fn close(&self);
}

/// FIFO work queue of match ids.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, item: QueueItem) -> Result<(), PipelineError>;

    /// Non-blocking pop from the head.
    async fn try_pop(&self) -> Result<Option<QueueItem>, PipelineError>;

    async fn len(&self) -> Result<usize, PipelineError>;

    fn close(&self);
}

/// Every shared structure of one deployment.
#[derive(Clone)]
pub struct Substrate {
    pub log: Arc<dyn EventLog>,
    pub priority: Arc<dyn WorkQueue>,
    pub normal: Arc<dyn WorkQueue>,
    pub gate: Arc<dyn DedupStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// `false` when queued items die with the process.
    pub durable: bool,
}

impl Substrate {
    /// In-process structures, whatever `substrate.backend` says.
    pub fn memory(cfg: &PipelineConfig) -> Self {
        Self {
            log: Arc::new(MemoryEventLog::new(
                cfg.visibility_timeout(),
                Duration::from_secs(cfg.log.retention_secs),
            )),
            priority: Arc::new(MemoryQueue::new(cfg.queues.priority.clone())),
            normal: Arc::new(MemoryQueue::new(cfg.queues.normal.clone())),
            gate: Arc::new(MemoryDedupStore::new()),
            dead_letters: Arc::new(DeadLetterQueue::with_capacity(
                cfg.worker.dead_letter_capacity,
            )),
            durable: false,
        }
    }

    /// The backend named by `substrate.backend`.
    pub async fn open(cfg: &PipelineConfig) -> Result<Self, PipelineError> {
        match cfg.substrate.backend {
            SubstrateBackend::Memory => Ok(Self::memory(cfg)),
            SubstrateBackend::Sqlite => {
                let db = SqliteSubstrate::open(
                    &cfg.substrate.path,
                    cfg.visibility_timeout(),
                    Duration::from_secs(cfg.log.retention_secs),
                )
                .await?;
                Ok(Self {
                    log: Arc::new(db.event_log()),
                    priority: Arc::new(db.queue(cfg.queues.priority.clone())),
                    normal: Arc::new(db.queue(cfg.queues.normal.clone())),
                    gate: Arc::new(db.dedup_store()),
                    dead_letters: Arc::new(db.dead_letters()),
                    durable: true,
                })
            }
        }
    }

    pub fn close(&self) {
        self.log.close();
        self.priority.close();
        self.normal.close();
        self.gate.close();
        self.dead_letters.close();
    }
}
