// src/ingest/providers/odds.rs
//! Odds API adapter. Emits an event only when a price moves far enough from
//! the last one seen for the same (event, bookmaker, market, outcome).
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::Deserialize;

use crate::classify::FixtureIndex;
use crate::config::OddsSourceConfig;
use crate::event::{NewEvent, OddsDelta, Payload, SourceKind};
use crate::ingest::types::{PollBatch, SourceAdapter};

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    commence_time: Option<String>,
    home_team: String,
    away_team: String,
    #[serde(default)]
    bookmakers: Vec<RawBookmaker>,
}

#[derive(Debug, Deserialize)]
struct RawBookmaker {
    key: String,
    #[serde(default)]
    markets: Vec<RawMarket>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    key: String,
    #[serde(default)]
    outcomes: Vec<RawOutcome>,
}

#[derive(Debug, Deserialize)]
struct RawOutcome {
    name: String,
    price: f64,
}

enum Mode {
    /// Each poll reads the next document; the last one repeats.
    Fixture {
        docs: Vec<String>,
        cursor: AtomicUsize,
    },
    Http {
        base_url: String,
        api_key: String,
        sports: Vec<String>,
        regions: String,
        markets: String,
        client: reqwest::Client,
    },
}

pub struct OddsAdapter {
    mode: Mode,
    min_move: f64,
    previous: Mutex<HashMap<String, f64>>,
    index: Option<Arc<FixtureIndex>>,
}

impl OddsAdapter {
    pub fn from_fixtures(docs: Vec<String>) -> Self {
        Self {
            mode: Mode::Fixture {
                docs,
                cursor: AtomicUsize::new(0),
            },
            min_move: OddsSourceConfig::default().min_move,
            previous: Mutex::new(HashMap::new()),
            index: None,
        }
    }

    /// Requires `ODDS_API_KEY`.
    pub fn from_config(cfg: &OddsSourceConfig) -> Result<Self> {
        let api_key = std::env::var("ODDS_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("missing ODDS_API_KEY env var"))?;
        Ok(Self {
            mode: Mode::Http {
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                api_key,
                sports: cfg.sports.clone(),
                regions: cfg.regions.clone(),
                markets: cfg.markets.clone(),
                client: super::http_client(std::time::Duration::from_secs(30))?,
            },
            min_move: cfg.min_move,
            previous: Mutex::new(HashMap::new()),
            index: None,
        })
    }

    pub fn with_min_move(mut self, min_move: f64) -> Self {
        self.min_move = min_move;
        self
    }

    /// Attribute moves to fixtures known to the index.
    pub fn with_index(mut self, index: Arc<FixtureIndex>) -> Self {
        self.index = Some(index);
        self
    }

    fn ingest_doc(&self, doc: &str, batch: &mut PollBatch) -> Result<()> {
        let t0 = std::time::Instant::now();
        let events: Vec<serde_json::Value> =
            serde_json::from_str(doc).context("parsing odds response")?;
        for v in events {
            match serde_json::from_value::<RawEvent>(v) {
                Ok(ev) => self.diff_event(ev, batch),
                Err(e) => batch.push_error(format!("odds event: {e}")),
            }
        }
        histogram!("ingest_parse_ms", "source" => "odds").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(())
    }

    fn diff_event(&self, ev: RawEvent, batch: &mut PollBatch) {
        let commence_time = ev
            .commence_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let match_id = self
            .index
            .as_ref()
            .and_then(|idx| idx.match_for_teams(&ev.home_team, &ev.away_team));

        let Ok(mut prev) = self.previous.lock() else {
            batch.push_error(format!("odds event {}: price cache poisoned", ev.id));
            return;
        };
        for bm in &ev.bookmakers {
            for market in &bm.markets {
                for outcome in &market.outcomes {
                    if !(outcome.price.is_finite() && outcome.price > 1.0) {
                        batch.push_error(format!(
                            "odds event {}: bad price {} for {}",
                            ev.id, outcome.price, outcome.name
                        ));
                        continue;
                    }
                    let key = format!("{}|{}|{}|{}", ev.id, bm.key, market.key, outcome.name);
                    let Some(previous) = prev.insert(key, outcome.price) else {
                        continue; // baseline
                    };
                    let delta = OddsDelta {
                        event_key: ev.id.clone(),
                        home: ev.home_team.clone(),
                        away: ev.away_team.clone(),
                        bookmaker: bm.key.clone(),
                        market: market.key.clone(),
                        outcome: outcome.name.clone(),
                        previous,
                        current: outcome.price,
                        commence_time,
                    };
                    if delta.relative_move() < self.min_move {
                        continue;
                    }
                    let fp = format!(
                        "odds:{}:{}:{}:{:.2}",
                        ev.id, bm.key, outcome.name, outcome.price
                    );
                    batch.events.push(
                        NewEvent::new(SourceKind::Odds, fp, Payload::OddsMove(delta))
                            .with_match(match_id),
                    );
                }
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for OddsAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Odds
    }

    fn name(&self) -> &str {
        "odds"
    }

    async fn poll(&self) -> Result<PollBatch> {
        let mut batch = PollBatch::default();
        match &self.mode {
            Mode::Fixture { docs, cursor } => {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(doc) = docs.get(i.min(docs.len().saturating_sub(1))) else {
                    return Ok(batch);
                };
                self.ingest_doc(doc, &mut batch)?;
            }
            Mode::Http {
                base_url,
                api_key,
                sports,
                regions,
                markets,
                client,
            } => {
                let mut failed = 0usize;
                for sport in sports {
                    let res = client
                        .get(format!("{base_url}/sports/{sport}/odds"))
                        .query(&[
                            ("apiKey", api_key.as_str()),
                            ("regions", regions.as_str()),
                            ("markets", markets.as_str()),
                            ("oddsFormat", "decimal"),
                            ("dateFormat", "iso"),
                        ])
                        .send()
                        .await
                        .and_then(|r| r.error_for_status());
                    let doc = match res {
                        Ok(resp) => resp.text().await.context("odds http .text()"),
                        Err(e) => Err(e).context("odds http get()"),
                    };
                    if let Err(e) = doc.and_then(|d| self.ingest_doc(&d, &mut batch)) {
                        tracing::warn!(error = ?e, sport = %sport, "odds fetch failed");
                        batch.push_error(format!("{sport}: {e:#}"));
                        failed += 1;
                    }
                }
                if !sports.is_empty() && failed == sports.len() {
                    return Err(anyhow!("all {failed} odds requests failed"));
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(price: f64) -> String {
        format!(
            r#"[{{"id":"e1","commence_time":"2025-10-19T15:00:00Z","home_team":"Arsenal","away_team":"Chelsea",
                "bookmakers":[{{"key":"pinnacle","markets":[{{"key":"h2h","outcomes":[
                    {{"name":"Arsenal","price":{price}}},{{"name":"Chelsea","price":3.4}}]}}]}}]}}]"#
        )
    }

    #[tokio::test]
    async fn first_sighting_is_a_baseline() {
        let a = OddsAdapter::from_fixtures(vec![doc(2.0)]);
        assert!(a.poll().await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn small_moves_are_ignored_large_ones_emitted() {
        let a = OddsAdapter::from_fixtures(vec![doc(2.0), doc(2.04), doc(2.5)]).with_min_move(0.05);
        a.poll().await.unwrap();
        assert!(a.poll().await.unwrap().events.is_empty());
        let batch = a.poll().await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].fingerprint, "odds:e1:pinnacle:Arsenal:2.50");
    }
}
