// tests/dispatch_priority.rs
//
// Dispatcher behaviour: priority fan-out happens before the ack, classifier
// trouble degrades to routine handling, sink trouble leaves the entry
// pending, substrate loss stops the loop.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use matchday_pulse::classify::{
    ClassifierPolicy, ClassifyFuture, ClassifyRequest, FixtureIndex, KeywordClassifier,
    Thresholds, UrgencyClassifier,
};
use matchday_pulse::dispatch::{DispatcherCfg, DispatcherDeps};
use matchday_pulse::event::{ArticlePayload, FixtureInfo, OddsDelta};
use matchday_pulse::health::Health;
use matchday_pulse::knowledge::{KnowledgeSink, MemoryKnowledgeBase, Retriever, StoreOutcome};
use matchday_pulse::notify::{Alert, AlertSink};
use matchday_pulse::substrate::{EventLog, MemoryEventLog, MemoryQueue, WorkQueue};
use matchday_pulse::{
    ClassifyError, DispatchOutcome, Dispatcher, Event, NewEvent, Payload, PipelineError,
    SourceKind,
};

const GROUP: &str = "dispatchers";

#[derive(Default)]
struct RecordingAlerts(Mutex<Vec<Alert>>);

impl RecordingAlerts {
    fn keys(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|a| a.key.clone()).collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: Alert) {
        self.0.lock().unwrap().push(alert);
    }
}

/// Fails the first `failures` stores, then delegates.
struct FlakySink {
    inner: MemoryKnowledgeBase,
    failures: Mutex<u32>,
}

#[async_trait]
impl KnowledgeSink for FlakySink {
    async fn store(&self, event: &Event, related: &BTreeSet<i64>) -> Result<StoreOutcome, PipelineError> {
        {
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(PipelineError::Sink("vector store 503".into()));
            }
        }
        self.inner.store(event, related).await
    }
}

/// Records what the substrate looked like when the sink was reached.
struct ObservingSink {
    priority: Arc<MemoryQueue>,
    log: Arc<MemoryEventLog>,
    seen: Arc<Mutex<Vec<(usize, usize)>>>,
}

#[async_trait]
impl KnowledgeSink for ObservingSink {
    async fn store(&self, _event: &Event, _related: &BTreeSet<i64>) -> Result<StoreOutcome, PipelineError> {
        let queued = self.priority.len().await?;
        let pending = self.log.pending(GROUP).await?;
        self.seen.lock().unwrap().push((queued, pending));
        Ok(StoreOutcome::Inserted { chunks: 1 })
    }
}

struct Unreachable;

impl UrgencyClassifier for Unreachable {
    fn classify<'a>(&'a self, _req: &'a ClassifyRequest) -> ClassifyFuture<'a> {
        Box::pin(async { Err(ClassifyError::Upstream("connection refused".into())) })
    }

    fn provider_name(&self) -> &'static str {
        "unreachable"
    }
}

struct Harness {
    log: Arc<MemoryEventLog>,
    priority: Arc<MemoryQueue>,
    normal: Arc<MemoryQueue>,
    health: Health,
    alerts: Arc<RecordingAlerts>,
    dispatcher: Dispatcher,
}

fn index() -> Arc<FixtureIndex> {
    let idx = FixtureIndex::new();
    idx.upsert(FixtureInfo {
        fixture_id: 555,
        league_id: 39,
        home: "Arsenal".into(),
        away: "Tottenham".into(),
        kickoff: Utc::now() + chrono::Duration::hours(30),
        status: "NS".into(),
    });
    Arc::new(idx)
}

fn policy() -> ClassifierPolicy {
    ClassifierPolicy {
        timeout: Duration::from_secs(5),
        max_attempts: 3,
        backoff: Duration::from_millis(100),
        thresholds: Thresholds::default(),
    }
}

fn harness_with(
    classifier: Arc<dyn UrgencyClassifier>,
    sink: impl FnOnce(&Arc<MemoryEventLog>, &Arc<MemoryQueue>) -> Arc<dyn KnowledgeSink>,
) -> Harness {
    let log = Arc::new(MemoryEventLog::new(
        Duration::from_secs(60),
        Duration::from_secs(3600),
    ));
    let priority = Arc::new(MemoryQueue::new("priority"));
    let normal = Arc::new(MemoryQueue::new("normal"));
    let health = Health::new();
    let alerts = Arc::new(RecordingAlerts::default());
    let deps = DispatcherDeps {
        log: log.clone(),
        priority: priority.clone(),
        normal: normal.clone(),
        classifier,
        policy: policy(),
        sink: sink(&log, &priority),
        index: index(),
        health: health.clone(),
        alerts: alerts.clone(),
    };
    let cfg = DispatcherCfg {
        block: Duration::from_millis(20),
        ..DispatcherCfg::default()
    };
    Harness {
        log,
        priority,
        normal,
        health,
        alerts,
        dispatcher: Dispatcher::new(deps, cfg),
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(KeywordClassifier::default()), |_, _| {
        Arc::new(MemoryKnowledgeBase::new(400))
    })
}

fn article(title: &str) -> NewEvent {
    let url = format!("https://example.com/{}", title.len());
    NewEvent::new(
        SourceKind::Rss,
        format!("rss:{url}"),
        Payload::Article(ArticlePayload {
            title: title.into(),
            summary: None,
            url,
            body: String::new(),
            feed: "bbc-football".into(),
            published_at: None,
        }),
    )
}

fn odds_move(match_id: Option<i64>) -> NewEvent {
    NewEvent::new(
        SourceKind::Odds,
        "odds:e7b1c0:pinnacle:Arsenal:2.10",
        Payload::OddsMove(OddsDelta {
            event_key: "e7b1c0".into(),
            home: "Arsenal".into(),
            away: "Tottenham Hotspur".into(),
            bookmaker: "pinnacle".into(),
            market: "h2h".into(),
            outcome: "Arsenal".into(),
            previous: 1.8,
            current: 2.1,
            commence_time: None,
        }),
    )
    .with_match(match_id)
}

#[tokio::test]
async fn breaking_news_reaches_priority_before_the_ack() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let h = harness_with(Arc::new(KeywordClassifier::default()), move |log, priority| {
        Arc::new(ObservingSink {
            priority: priority.clone(),
            log: log.clone(),
            seen: observed,
        })
    });
    h.log.ensure_group(GROUP).await.unwrap();
    h.log
        .append(article("Saka ruled out of Arsenal's derby with a hamstring injury"))
        .await
        .unwrap();

    let outcomes = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::DispatchedPriority { match_ids: vec![555] }]
    );
    // At the sink: one priority item queued, entry still pending.
    assert_eq!(*seen.lock().unwrap(), vec![(1, 1)]);
    let item = h.priority.try_pop().await.unwrap().expect("priority item");
    assert_eq!(item.match_id, 555);
    assert!(item.cause.is_some());
    assert_eq!(h.log.pending(GROUP).await.unwrap(), 0, "acked after the push");
    assert_eq!(h.normal.len().await.unwrap(), 0);
}

#[tokio::test]
async fn breaking_news_is_retrievable_by_the_match_it_affects() {
    let kb = Arc::new(MemoryKnowledgeBase::new(400));
    let sink = kb.clone();
    let h = harness_with(Arc::new(KeywordClassifier::default()), move |_, _| sink);
    h.log.ensure_group(GROUP).await.unwrap();
    h.log
        .append(article("Saka ruled out of Arsenal's derby with a hamstring injury"))
        .await
        .unwrap();

    h.dispatcher.poll_once().await.unwrap();
    let hits = kb.search("saka hamstring", 5, Some(555));
    assert!(!hits.is_empty(), "news without its own match id is found by the affected match");
    assert!(hits.iter().all(|f| f.match_ids.contains(&555)));
    assert!(kb.search("saka hamstring", 5, Some(777)).is_empty());
}

#[tokio::test]
async fn routine_news_is_stored_and_acked_without_pushes() {
    let h = harness();
    h.log.ensure_group(GROUP).await.unwrap();
    h.log
        .append(article("Arsenal open new training ground cafe"))
        .await
        .unwrap();

    let outcomes = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(outcomes, vec![DispatchOutcome::Skipped]);
    assert_eq!(h.priority.len().await.unwrap(), 0);
    assert_eq!(h.normal.len().await.unwrap(), 0);
    assert_eq!(h.log.pending(GROUP).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn classifier_outage_still_stores_and_acks() {
    let h = harness_with(Arc::new(Unreachable), |_, _| {
        Arc::new(MemoryKnowledgeBase::new(400))
    });
    h.log.ensure_group(GROUP).await.unwrap();
    h.log
        .append(article("Saka ruled out of Arsenal's derby"))
        .await
        .unwrap();

    let outcomes = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(outcomes, vec![DispatchOutcome::Skipped]);
    assert_eq!(h.priority.len().await.unwrap(), 0);
    assert_eq!(h.log.pending(GROUP).await.unwrap(), 0);
    assert!(h.health.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn sink_failure_leaves_entry_pending_for_redelivery() {
    let h = harness_with(Arc::new(KeywordClassifier::default()), |_, _| {
        Arc::new(FlakySink {
            inner: MemoryKnowledgeBase::new(400),
            failures: Mutex::new(1),
        })
    });
    h.log.ensure_group(GROUP).await.unwrap();
    h.log
        .append(article("Arsenal confirm stadium expansion plans"))
        .await
        .unwrap();

    let first = h.dispatcher.poll_once().await.unwrap();
    assert!(matches!(&first[..], [DispatchOutcome::SinkFailed { .. }]));
    assert!(!first[0].acked());
    assert_eq!(h.log.pending(GROUP).await.unwrap(), 1);

    // Nothing to read until the visibility timeout passes.
    assert!(h.dispatcher.poll_once().await.unwrap().is_empty());
    tokio::time::advance(Duration::from_secs(61)).await;

    let second = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(second, vec![DispatchOutcome::Skipped]);
    assert_eq!(h.log.pending(GROUP).await.unwrap(), 0);
}

#[tokio::test]
async fn structural_event_with_match_goes_to_normal() {
    let h = harness();
    h.log.ensure_group(GROUP).await.unwrap();
    h.log.append(odds_move(Some(555))).await.unwrap();
    h.log.append(odds_move(None)).await.unwrap();

    let outcomes = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![
            DispatchOutcome::QueuedNormal { match_id: 555 },
            DispatchOutcome::Skipped
        ]
    );
    assert_eq!(h.normal.len().await.unwrap(), 1);
    assert_eq!(h.priority.len().await.unwrap(), 0);
}

#[tokio::test]
async fn closed_priority_queue_is_fatal_and_flips_health() {
    let h = harness();
    h.log
        .append(article("Saka ruled out of Arsenal's derby"))
        .await
        .unwrap();
    h.priority.close();

    let (_tx, rx) = watch::channel(false);
    let err = h.dispatcher.run(rx).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(!h.health.is_healthy());
    assert_eq!(h.alerts.keys(), vec!["substrate:dispatcher".to_string()]);
    assert_eq!(h.log.pending(GROUP).await.unwrap(), 1, "not acked");
}

#[tokio::test]
async fn run_returns_after_shutdown() {
    let h = harness();
    let (tx, rx) = watch::channel(false);
    let dispatcher = Arc::new(h.dispatcher);
    let handle = dispatcher.clone().spawn(rx);
    h.log
        .append(article("Tottenham manager sacked"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.priority.len().await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatched");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("stopped")
        .unwrap()
        .unwrap();
    assert!(h.health.is_healthy());
}
