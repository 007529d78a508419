// tests/worker_pool.rs
//
// Strict priority between lanes, FIFO within a lane, bounded retries and the
// dead-letter path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::watch;

use matchday_pulse::deadletter::{DeadLetterQueue, DeadLetterStore};
use matchday_pulse::health::Health;
use matchday_pulse::notify::{Alert, AlertSink};
use matchday_pulse::processor::MatchProcessor;
use matchday_pulse::substrate::{MemoryQueue, QueueItem, WorkQueue};
use matchday_pulse::worker::WorkerPoolConfig;
use matchday_pulse::{EventId, ItemOutcome, Lane, WorkerPool};

/// Records every call; fails for the ids in `failing`.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<i64>>,
    failing: HashSet<i64>,
    delay: Option<Duration>,
}

impl Recorder {
    fn failing(ids: &[i64]) -> Self {
        Self {
            failing: ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<i64> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MatchProcessor for Recorder {
    async fn process(&self, match_id: i64) -> Result<()> {
        self.calls.lock().push(match_id);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.failing.contains(&match_id) {
            bail!("prediction service returned 500 for {match_id}");
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAlerts(Mutex<Vec<Alert>>);

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: Alert) {
        self.0.lock().push(alert);
    }
}

struct Harness {
    priority: Arc<MemoryQueue>,
    normal: Arc<MemoryQueue>,
    processor: Arc<Recorder>,
    alerts: Arc<RecordingAlerts>,
    health: Health,
    pool: Arc<WorkerPool>,
}

fn harness(processor: Recorder, cfg: WorkerPoolConfig) -> Harness {
    let priority = Arc::new(MemoryQueue::new("priority"));
    let normal = Arc::new(MemoryQueue::new("normal"));
    let processor = Arc::new(processor);
    let alerts = Arc::new(RecordingAlerts::default());
    let health = Health::new();
    let pool = Arc::new(WorkerPool::new(
        priority.clone(),
        normal.clone(),
        processor.clone(),
        Arc::new(DeadLetterQueue::with_capacity(100)),
        alerts.clone(),
        health.clone(),
        cfg,
    ));
    Harness {
        priority,
        normal,
        processor,
        alerts,
        health,
        pool,
    }
}

fn cfg() -> WorkerPoolConfig {
    WorkerPoolConfig {
        count: 1,
        poll_interval: Duration::from_millis(10),
        max_item_retries: 3,
        process_timeout: Duration::from_secs(5),
    }
}

async fn drain(pool: &WorkerPool) -> Vec<(Lane, i64, ItemOutcome)> {
    let mut out = Vec::new();
    while let Some((lane, item)) = pool.next_item().await.unwrap() {
        let id = item.match_id;
        let outcome = pool.process_one(lane, item).await.unwrap();
        out.push((lane, id, outcome));
    }
    out
}

#[tokio::test]
async fn priority_lane_drains_first_and_each_lane_is_fifo() {
    let h = harness(Recorder::default(), cfg());
    for id in [1, 2, 3] {
        h.normal.push(QueueItem::new(id, None)).await.unwrap();
    }
    for id in [10, 11] {
        h.priority
            .push(QueueItem::new(id, Some(EventId(id as u64))))
            .await
            .unwrap();
    }

    let done = drain(&h.pool).await;
    assert_eq!(h.processor.calls(), vec![10, 11, 1, 2, 3]);
    assert!(done.iter().all(|(_, _, o)| *o == ItemOutcome::Done));
    assert_eq!(done[0].0, Lane::Priority);
    assert_eq!(done[4].0, Lane::Normal);
}

#[tokio::test]
async fn priority_arriving_mid_drain_jumps_the_normal_backlog() {
    let h = harness(Recorder::default(), cfg());
    for id in [1, 2] {
        h.normal.push(QueueItem::new(id, None)).await.unwrap();
    }
    let (lane, item) = h.pool.next_item().await.unwrap().unwrap();
    h.pool.process_one(lane, item).await.unwrap();

    h.priority.push(QueueItem::new(99, None)).await.unwrap();
    drain(&h.pool).await;
    assert_eq!(h.processor.calls(), vec![1, 99, 2]);
}

#[tokio::test]
async fn interleaved_pushes_keep_per_lane_order() {
    let h = harness(Recorder::default(), cfg());
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let (mut prio, mut norm) = (Vec::new(), Vec::new());
    for id in 1..=40 {
        if rng.random_bool(0.4) {
            h.priority.push(QueueItem::new(id, None)).await.unwrap();
            prio.push(id);
        } else {
            h.normal.push(QueueItem::new(id, None)).await.unwrap();
            norm.push(id);
        }
    }
    drain(&h.pool).await;
    let expected: Vec<i64> = prio.into_iter().chain(norm).collect();
    assert_eq!(h.processor.calls(), expected);
}

#[tokio::test]
async fn failing_item_is_attempted_exactly_max_times_then_dead_lettered() {
    let h = harness(Recorder::failing(&[7]), cfg());
    h.normal.push(QueueItem::new(7, None)).await.unwrap();
    h.normal.push(QueueItem::new(8, None)).await.unwrap();

    let done = drain(&h.pool).await;
    let for_seven: Vec<_> = done
        .iter()
        .filter(|(_, id, _)| *id == 7)
        .map(|(_, _, o)| o.clone())
        .collect();
    assert_eq!(
        for_seven,
        vec![
            ItemOutcome::Requeued { attempts: 1 },
            ItemOutcome::Requeued { attempts: 2 },
            ItemOutcome::DeadLettered { attempts: 3 },
        ]
    );
    // Requeued items go to the tail: 8 runs after the first failure.
    assert_eq!(h.processor.calls(), vec![7, 8, 7, 7]);

    let dead = h.pool.dead_letters().snapshot_last_n(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].match_id, 7);
    assert_eq!(dead[0].lane, Lane::Normal);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].last_error.contains("500"));

    let alerts = h.alerts.0.lock();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].key, "dead-letter:7");
}

#[tokio::test]
async fn retries_stay_in_their_lane() {
    let h = harness(Recorder::failing(&[5]), cfg());
    h.priority.push(QueueItem::new(5, None)).await.unwrap();
    let (lane, item) = h.pool.next_item().await.unwrap().unwrap();
    assert_eq!(
        h.pool.process_one(lane, item).await.unwrap(),
        ItemOutcome::Requeued { attempts: 1 }
    );
    assert_eq!(h.priority.len().await.unwrap(), 1);
    assert_eq!(h.normal.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_processing_counts_as_a_failure() {
    let recorder = Recorder {
        delay: Some(Duration::from_secs(60)),
        ..Recorder::default()
    };
    let h = harness(recorder, cfg());
    h.normal.push(QueueItem::new(3, None)).await.unwrap();
    let (lane, item) = h.pool.next_item().await.unwrap().unwrap();
    assert_eq!(
        h.pool.process_one(lane, item).await.unwrap(),
        ItemOutcome::Requeued { attempts: 1 }
    );
}

#[tokio::test]
async fn requeue_failure_dead_letters_and_is_fatal() {
    let h = harness(Recorder::failing(&[4]), cfg());
    h.normal.push(QueueItem::new(4, None)).await.unwrap();
    let (lane, item) = h.pool.next_item().await.unwrap().unwrap();
    h.normal.close();

    let err = h.pool.process_one(lane, item).await.unwrap_err();
    assert!(err.is_fatal());
    let dead = h.pool.dead_letters().snapshot_last_n(1).await.unwrap();
    assert_eq!(dead[0].match_id, 4);
    assert!(dead[0].last_error.starts_with("requeue failed"));
}

#[tokio::test(start_paused = true)]
async fn starvation_grows_under_a_priority_flood_and_resets_on_normal_work() {
    let h = harness(Recorder::default(), cfg());
    h.normal.push(QueueItem::new(1, None)).await.unwrap();

    for id in 100..105 {
        tokio::time::advance(Duration::from_secs(10)).await;
        h.priority.push(QueueItem::new(id, None)).await.unwrap();
        let (lane, item) = h.pool.next_item().await.unwrap().unwrap();
        assert_eq!(lane, Lane::Priority);
        h.pool.process_one(lane, item).await.unwrap();
    }
    assert!(h.pool.normal_starvation() >= Duration::from_secs(50));

    let (lane, item) = h.pool.next_item().await.unwrap().unwrap();
    assert_eq!(lane, Lane::Normal);
    h.pool.process_one(lane, item).await.unwrap();
    assert!(h.pool.normal_starvation() < Duration::from_secs(1));
}

#[tokio::test]
async fn spawned_workers_drain_both_lanes_and_stop_on_shutdown() {
    let h = harness(
        Recorder::default(),
        WorkerPoolConfig {
            count: 3,
            ..cfg()
        },
    );
    for id in 1..=6 {
        h.normal.push(QueueItem::new(id, None)).await.unwrap();
        h.priority.push(QueueItem::new(100 + id, None)).await.unwrap();
    }
    let (tx, rx) = watch::channel(false);
    let handles = h.pool.clone().spawn(rx);
    assert_eq!(handles.len(), 3);

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.processor.calls().len() < 12 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all items processed");

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stopped")
            .unwrap()
            .unwrap();
    }
    assert!(h.health.is_healthy());
    let mut calls = h.processor.calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![1, 2, 3, 4, 5, 6, 101, 102, 103, 104, 105, 106]);
}

#[tokio::test]
async fn closed_queue_stops_the_worker_and_flips_health() {
    let h = harness(Recorder::default(), cfg());
    h.priority.close();
    let (_tx, rx) = watch::channel(false);
    let err = h.pool.run_worker(0, rx).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(!h.health.is_healthy());
    assert_eq!(h.alerts.0.lock()[0].key, "substrate:worker-0");
}
