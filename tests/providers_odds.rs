// tests/providers_odds.rs
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use matchday_pulse::classify::FixtureIndex;
use matchday_pulse::event::FixtureInfo;
use matchday_pulse::ingest::providers::odds::OddsAdapter;
use matchday_pulse::ingest::types::SourceAdapter;
use matchday_pulse::Payload;

fn load(name: &str) -> String {
    std::fs::read_to_string(format!("tests/fixtures/{name}")).expect("fixture")
}

fn index_with_nld() -> Arc<FixtureIndex> {
    let idx = Arc::new(FixtureIndex::new());
    idx.upsert(FixtureInfo {
        fixture_id: 555,
        league_id: 39,
        home: "Arsenal".into(),
        away: "Tottenham".into(),
        kickoff: Utc.with_ymd_and_hms(2025, 10, 18, 16, 30, 0).unwrap(),
        status: "NS".into(),
    });
    idx
}

#[tokio::test]
async fn first_poll_is_a_baseline_second_emits_moves() {
    let adapter = OddsAdapter::from_fixtures(vec![load("odds_t0.json"), load("odds_t1.json")])
        .with_min_move(0.05)
        .with_index(index_with_nld());

    let baseline = adapter.poll().await.unwrap();
    assert!(baseline.events.is_empty());
    assert!(baseline.item_errors.is_empty());

    let moved = adapter.poll().await.unwrap();
    // Arsenal 1.8 -> 2.1 (+16.7%) moves; Spurs 4.2 -> 4.3 (+2.4%) and the draw do not.
    assert_eq!(moved.events.len(), 1);
    let ev = &moved.events[0];
    assert_eq!(ev.fingerprint, "odds:e7b1c0:pinnacle:Arsenal:2.10");
    assert_eq!(ev.match_id, Some(555), "attributed through the fixture index");
    let Payload::OddsMove(d) = &ev.payload else {
        panic!("expected an odds move");
    };
    assert_eq!(d.previous, 1.8);
    assert_eq!(d.current, 2.1);
}

#[tokio::test]
async fn unknown_fixture_leaves_match_unset() {
    let adapter = OddsAdapter::from_fixtures(vec![load("odds_t0.json"), load("odds_t1.json")]);
    adapter.poll().await.unwrap();
    let moved = adapter.poll().await.unwrap();
    assert_eq!(moved.events[0].match_id, None);
}

#[tokio::test]
async fn repeated_document_emits_nothing_new() {
    let adapter = OddsAdapter::from_fixtures(vec![load("odds_t0.json"), load("odds_t1.json")]);
    adapter.poll().await.unwrap();
    assert_eq!(adapter.poll().await.unwrap().events.len(), 1);
    // Last document repeats: prices unchanged since the previous poll.
    assert!(adapter.poll().await.unwrap().events.is_empty());
}
