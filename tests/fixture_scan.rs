// tests/fixture_scan.rs
//
// Fixture scan: open fixtures go to the normal queue once per dedup window
// and fill the index the classifier and the odds adapter rely on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use matchday_pulse::classify::FixtureIndex;
use matchday_pulse::fixtures::{
    scan_fixtures_once, spawn_fixture_scan_loop, ApiFootballFixtures, FixtureScanDeps,
};
use matchday_pulse::health::Health;
use matchday_pulse::ingest::dedup::MemoryDedupStore;
use matchday_pulse::notify::NotifierMux;
use matchday_pulse::substrate::{MemoryQueue, WorkQueue};

const TTL: Duration = Duration::from_secs(24 * 3600);

/// The recorded response, shifted so kickoffs fall tomorrow and the day after.
fn fixtures_doc() -> String {
    let raw = std::fs::read_to_string("tests/fixtures/api_football_fixtures.json").expect("fixture");
    let today = Utc::now().date_naive();
    let d1 = (today + chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
    let d2 = (today + chrono::Duration::days(2)).format("%Y-%m-%d").to_string();
    raw.replace("2025-10-18", &d1).replace("2025-10-19", &d2)
}

#[tokio::test]
async fn open_fixtures_are_queued_once_and_indexed() {
    let source = ApiFootballFixtures::from_fixtures(vec![fixtures_doc()]);
    let gate = MemoryDedupStore::new();
    let normal = MemoryQueue::new("normal");
    let index = FixtureIndex::new();

    let first = scan_fixtures_once(&source, &gate, &normal, &index, TTL, 7)
        .await
        .unwrap();
    assert_eq!(first.fetched, 3);
    assert_eq!(first.queued, 2);
    assert_eq!(first.closed, 1);
    assert!(first.source_error.is_none());

    let mut queued = Vec::new();
    while let Some(item) = normal.try_pop().await.unwrap() {
        assert!(item.cause.is_none());
        queued.push(item.match_id);
    }
    assert_eq!(queued, vec![555, 557]);

    assert_eq!(index.len(), 3);
    assert_eq!(index.match_for_teams("Arsenal", "Tottenham Hotspur"), Some(555));
    assert_eq!(
        index.match_for_teams("Manchester City", "Brighton"),
        None,
        "finished fixtures are indexed but never matched"
    );

    let second = scan_fixtures_once(&source, &gate, &normal, &index, TTL, 7)
        .await
        .unwrap();
    assert_eq!(second.queued, 0);
    assert_eq!(second.duplicates, 2);
    assert_eq!(normal.len().await.unwrap(), 0);
}

#[tokio::test]
async fn fixtures_outside_the_window_are_ignored() {
    let source = ApiFootballFixtures::from_fixtures(vec![fixtures_doc()]);
    let gate = MemoryDedupStore::new();
    let normal = MemoryQueue::new("normal");
    let index = FixtureIndex::new();

    let report = scan_fixtures_once(&source, &gate, &normal, &index, TTL, 1)
        .await
        .unwrap();
    assert_eq!(report.fetched, 2, "only tomorrow's fixtures");
    assert_eq!(report.queued, 1);
}

#[tokio::test]
async fn source_failure_is_reported_not_raised() {
    let source = ApiFootballFixtures::from_fixtures(vec!["{ not json".into()]);
    let gate = MemoryDedupStore::new();
    let normal = MemoryQueue::new("normal");
    let index = FixtureIndex::new();

    let report = scan_fixtures_once(&source, &gate, &normal, &index, TTL, 7)
        .await
        .unwrap();
    assert!(report.source_error.is_some());
    assert_eq!(report.queued, 0);
}

#[tokio::test]
async fn failed_push_releases_the_mark() {
    let source = ApiFootballFixtures::from_fixtures(vec![fixtures_doc()]);
    let gate = MemoryDedupStore::new();
    let index = FixtureIndex::new();

    let broken = MemoryQueue::new("normal");
    broken.close();
    let err = scan_fixtures_once(&source, &gate, &broken, &index, TTL, 7)
        .await
        .unwrap_err();
    assert!(err.is_fatal());

    let healthy = MemoryQueue::new("normal");
    let report = scan_fixtures_once(&source, &gate, &healthy, &index, TTL, 7)
        .await
        .unwrap();
    assert_eq!(report.queued, 2);
}

#[tokio::test]
async fn scan_loop_runs_immediately_and_stops_on_shutdown() {
    let normal = Arc::new(MemoryQueue::new("normal"));
    let index = Arc::new(FixtureIndex::new());
    let health = Health::new();
    let deps = FixtureScanDeps {
        gate: Arc::new(MemoryDedupStore::new()),
        normal: normal.clone(),
        index: index.clone(),
        health: health.clone(),
        alerts: Arc::new(NotifierMux::new(vec![], 0)),
    };
    let (tx, rx) = watch::channel(false);
    let handle = spawn_fixture_scan_loop(
        Arc::new(ApiFootballFixtures::from_fixtures(vec![fixtures_doc()])),
        deps,
        Duration::from_secs(3600),
        TTL,
        7,
        rx,
    );

    tokio::time::timeout(Duration::from_secs(2), async {
        while normal.len().await.unwrap() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first scan ran");
    assert_eq!(index.len(), 3);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop stopped")
        .unwrap();
    assert!(health.is_healthy());
}
