//! Priority-aware worker pool.
//!
//! Every worker checks the priority queue first and only falls back to the
//! normal queue when priority is empty. This is strict priority: a steady
//! priority flood starves the normal lane, which is what the
//! `worker_normal_starvation_seconds` gauge is for.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::deadletter::{DeadLetter, DeadLetterStore};
use crate::error::PipelineError;
use crate::health::Health;
use crate::notify::{Alert, AlertSink};
use crate::processor::MatchProcessor;
use crate::substrate::{QueueItem, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Priority,
    Normal,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Priority => "priority",
            Lane::Normal => "normal",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done,
    /// Back at the tail of its lane after `attempts` failures.
    Requeued { attempts: u32 },
    DeadLettered { attempts: u32 },
}

impl ItemOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Requeued { .. } => "requeued",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub count: usize,
    pub poll_interval: Duration,
    /// Total processing attempts per item before it is dead-lettered.
    pub max_item_retries: u32,
    pub process_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval: Duration::from_secs(1),
            max_item_retries: 3,
            process_timeout: Duration::from_secs(300),
        }
    }
}

pub struct WorkerPool {
    priority: Arc<dyn WorkQueue>,
    normal: Arc<dyn WorkQueue>,
    processor: Arc<dyn MatchProcessor>,
    dead_letters: Arc<dyn DeadLetterStore>,
    alerts: Arc<dyn AlertSink>,
    health: Health,
    cfg: WorkerPoolConfig,
    last_normal: Mutex<Instant>,
}

impl WorkerPool {
    pub fn new(
        priority: Arc<dyn WorkQueue>,
        normal: Arc<dyn WorkQueue>,
        processor: Arc<dyn MatchProcessor>,
        dead_letters: Arc<dyn DeadLetterStore>,
        alerts: Arc<dyn AlertSink>,
        health: Health,
        cfg: WorkerPoolConfig,
    ) -> Self {
        Self {
            priority,
            normal,
            processor,
            dead_letters,
            alerts,
            health,
            cfg,
            last_normal: Mutex::new(Instant::now()),
        }
    }

    fn queue(&self, lane: Lane) -> &Arc<dyn WorkQueue> {
        match lane {
            Lane::Priority => &self.priority,
            Lane::Normal => &self.normal,
        }
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    /// Priority first; normal only when priority is empty.
    pub async fn next_item(&self) -> Result<Option<(Lane, QueueItem)>, PipelineError> {
        if let Some(item) = self.priority.try_pop().await? {
            return Ok(Some((Lane::Priority, item)));
        }
        Ok(self.normal.try_pop().await?.map(|item| (Lane::Normal, item)))
    }

    /// Time since a normal item was last processed, or since the pool started.
    pub fn normal_starvation(&self) -> Duration {
        self.last_normal
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch_normal(&self) {
        if let Ok(mut t) = self.last_normal.lock() {
            *t = Instant::now();
        }
    }

    /// Run the processing routine once for `item` and settle it: done,
    /// requeued to the same lane, or dead-lettered. `Err` only when the
    /// requeue hit a substrate failure (the item is dead-lettered first).
    pub async fn process_one(&self, lane: Lane, item: QueueItem) -> Result<ItemOutcome, PipelineError> {
        let t0 = Instant::now();
        let res = match tokio::time::timeout(
            self.cfg.process_timeout,
            self.processor.process(item.match_id),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("processing timed out after {:?}", self.cfg.process_timeout)),
        };
        histogram!("worker_process_ms", "lane" => lane.as_str())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        if lane == Lane::Normal {
            self.touch_normal();
        }

        let outcome = match res {
            Ok(()) => ItemOutcome::Done,
            Err(err) => {
                let attempts = item.attempts + 1;
                tracing::warn!(
                    match_id = item.match_id,
                    lane = %lane,
                    attempts,
                    max = self.cfg.max_item_retries,
                    error = %err,
                    "processing failed"
                );
                if attempts >= self.cfg.max_item_retries {
                    self.dead_letter(lane, &item, attempts, err).await?;
                    ItemOutcome::DeadLettered { attempts }
                } else if let Err(e) = self.queue(lane).push(item.retried()).await {
                    self.dead_letter(lane, &item, attempts, format!("requeue failed: {e}"))
                        .await?;
                    counter!("worker_items_total", "lane" => lane.as_str(), "outcome" => "dead_lettered")
                        .increment(1);
                    return Err(e);
                } else {
                    ItemOutcome::Requeued { attempts }
                }
            }
        };
        counter!("worker_items_total", "lane" => lane.as_str(), "outcome" => outcome.as_str())
            .increment(1);
        if outcome == ItemOutcome::Done {
            tracing::info!(match_id = item.match_id, lane = %lane, cause = ?item.cause, "match processed");
        }
        Ok(outcome)
    }

    /// `Err` when the dead-letter store itself is unavailable; the record is
    /// then only in the error log.
    async fn dead_letter(
        &self,
        lane: Lane,
        item: &QueueItem,
        attempts: u32,
        last_error: String,
    ) -> Result<(), PipelineError> {
        let dl = DeadLetter {
            match_id: item.match_id,
            lane,
            attempts,
            last_error,
            at: Utc::now(),
        };
        tracing::error!(match_id = dl.match_id, lane = %lane, attempts, error = %dl.last_error, "match dead-lettered");
        counter!("worker_dead_letters_total", "lane" => lane.as_str()).increment(1);
        let alert = Alert::dead_letter(&dl);
        let stored = self.dead_letters.record(dl).await;
        self.alerts.raise(alert).await;
        stored
    }

    async fn report_gauges(&self) {
        gauge!("worker_normal_starvation_seconds").set(self.normal_starvation().as_secs_f64());
        for lane in [Lane::Priority, Lane::Normal] {
            if let Ok(n) = self.queue(lane).len().await {
                gauge!("queue_depth", "lane" => lane.as_str()).set(n as f64);
            }
        }
    }

    /// One worker's loop. Finishes the in-flight item before honouring
    /// shutdown.
    pub async fn run_worker(&self, idx: usize, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let component = format!("worker-{idx}");
        self.health.mark_ok(&component);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let step = match self.next_item().await {
                Ok(Some((lane, item))) => self.process_one(lane, item).await.map(|_| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            match step {
                Ok(true) => {
                    gauge!("worker_normal_starvation_seconds")
                        .set(self.normal_starvation().as_secs_f64());
                }
                Ok(false) => {
                    self.report_gauges().await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                        res = shutdown.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, worker = idx, "worker stopped: substrate failure");
                    self.health.mark_failed(&component, e.to_string());
                    self.alerts
                        .raise(Alert::substrate(&component, &e.to_string()))
                        .await;
                    return Err(e);
                }
            }
        }
        tracing::debug!(worker = idx, "worker exited");
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<Result<(), PipelineError>>> {
        let count = self.cfg.count.max(1);
        tracing::info!(count, "starting worker pool");
        (0..count)
            .map(|idx| {
                let pool = Arc::clone(&self);
                let rx = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(idx, rx).await })
            })
            .collect()
    }
}
