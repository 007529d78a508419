//! Fixture scan: scheduled producer for the normal queue.
//!
//! Fetches upcoming fixtures, keeps the fixture index current and queues
//! every open fixture at most once per dedup window. Fixtures never go
//! through the event log or the classifier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::classify::FixtureIndex;
use crate::config::FixtureScanConfig;
use crate::error::PipelineError;
use crate::event::FixtureInfo;
use crate::health::Health;
use crate::ingest::dedup::DedupStore;
use crate::notify::{Alert, AlertSink};
use crate::substrate::{QueueItem, WorkQueue};

#[async_trait]
pub trait FixtureSource: Send + Sync {
    /// Fixtures kicking off between `from` and `to`, inclusive.
    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<FixtureInfo>>;
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    response: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawFixture {
    fixture: RawFixtureCore,
    league: RawId,
    teams: RawTeams,
}

#[derive(Debug, Deserialize)]
struct RawFixtureCore {
    id: i64,
    date: String,
    status: RawStatus,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    short: String,
}

#[derive(Debug, Deserialize)]
struct RawId {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RawTeams {
    home: RawTeam,
    away: RawTeam,
}

#[derive(Debug, Deserialize)]
struct RawTeam {
    name: String,
}

/// Parse an API-Football `/fixtures` response. Malformed entries are skipped
/// and returned as item errors.
pub fn parse_fixtures(doc: &str) -> Result<(Vec<FixtureInfo>, Vec<String>)> {
    let raw: RawResponse = serde_json::from_str(doc).context("parsing fixtures response")?;
    let mut out = Vec::with_capacity(raw.response.len());
    let mut errors = Vec::new();
    for v in raw.response {
        let f = match serde_json::from_value::<RawFixture>(v) {
            Ok(f) => f,
            Err(e) => {
                errors.push(format!("fixture entry: {e}"));
                continue;
            }
        };
        let kickoff = match DateTime::parse_from_rfc3339(&f.fixture.date) {
            Ok(d) => d.with_timezone(&Utc),
            Err(e) => {
                errors.push(format!("fixture {} date '{}': {e}", f.fixture.id, f.fixture.date));
                continue;
            }
        };
        out.push(FixtureInfo {
            fixture_id: f.fixture.id,
            league_id: f.league.id,
            home: f.teams.home.name,
            away: f.teams.away.name,
            kickoff,
            status: f.fixture.status.short,
        });
    }
    Ok((out, errors))
}

/// European seasons are named after the year they start in.
fn season_for(date: NaiveDate) -> i32 {
    if date.month() >= 7 {
        date.year()
    } else {
        date.year() - 1
    }
}

enum Mode {
    Fixture {
        docs: Vec<String>,
        cursor: AtomicUsize,
    },
    Http {
        base_url: String,
        api_key: String,
        leagues: Vec<i64>,
        client: reqwest::Client,
    },
}

/// API-Football client (`v3.football.api-sports.io`).
pub struct ApiFootballFixtures {
    mode: Mode,
}

impl ApiFootballFixtures {
    /// Each fetch reads the next document; the last one repeats.
    pub fn from_fixtures(docs: Vec<String>) -> Self {
        Self {
            mode: Mode::Fixture {
                docs,
                cursor: AtomicUsize::new(0),
            },
        }
    }

    /// Requires `FOOTBALL_API_KEY`.
    pub fn from_config(cfg: &FixtureScanConfig) -> Result<Self> {
        let api_key = std::env::var("FOOTBALL_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("missing FOOTBALL_API_KEY env var"))?;
        Ok(Self {
            mode: Mode::Http {
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                api_key,
                leagues: cfg.leagues.clone(),
                client: crate::ingest::providers::http_client(Duration::from_secs(30))?,
            },
        })
    }

    async fn fetch_league(
        client: &reqwest::Client,
        base_url: &str,
        api_key: &str,
        league: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FixtureInfo>> {
        let url = format!("{base_url}/fixtures");
        let body = client
            .get(&url)
            .header("x-apisports-key", api_key)
            .query(&[
                ("league", league.to_string()),
                ("season", season_for(from).to_string()),
                ("from", from.format("%Y-%m-%d").to_string()),
                ("to", to.format("%Y-%m-%d").to_string()),
                ("timezone", "UTC".to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("GET {url} league={league}"))?
            .error_for_status()
            .with_context(|| format!("fixtures status for league {league}"))?
            .text()
            .await
            .context("reading fixtures body")?;
        let (fixtures, errors) = parse_fixtures(&body)?;
        for e in errors {
            tracing::warn!(league, error = %e, "fixture entry skipped");
        }
        Ok(fixtures)
    }
}

#[async_trait]
impl FixtureSource for ApiFootballFixtures {
    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<FixtureInfo>> {
        match &self.mode {
            Mode::Fixture { docs, cursor } => {
                if docs.is_empty() {
                    return Ok(Vec::new());
                }
                let i = cursor.fetch_add(1, Ordering::Relaxed).min(docs.len() - 1);
                let (fixtures, errors) = parse_fixtures(&docs[i])?;
                for e in errors {
                    tracing::warn!(error = %e, "fixture entry skipped");
                }
                Ok(fixtures
                    .into_iter()
                    .filter(|f| {
                        let d = f.kickoff.date_naive();
                        d >= from && d <= to
                    })
                    .collect())
            }
            Mode::Http {
                base_url,
                api_key,
                leagues,
                client,
            } => {
                let mut all = Vec::new();
                let mut failed = 0usize;
                let mut last_err = None;
                for &league in leagues {
                    match Self::fetch_league(client, base_url, api_key, league, from, to).await {
                        Ok(mut v) => all.append(&mut v),
                        Err(e) => {
                            tracing::warn!(league, error = ?e, "league fetch failed");
                            failed += 1;
                            last_err = Some(e);
                        }
                    }
                }
                match last_err {
                    Some(e) if failed == leagues.len() => Err(e.context("every league fetch failed")),
                    _ => Ok(all),
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub fetched: usize,
    pub queued: usize,
    pub duplicates: usize,
    pub closed: usize,
    pub source_error: Option<String>,
}

/// One scan over `today ..= today + days_ahead`. Only a substrate failure
/// returns `Err`.
pub async fn scan_fixtures_once(
    source: &dyn FixtureSource,
    gate: &dyn DedupStore,
    normal: &dyn WorkQueue,
    index: &FixtureIndex,
    ttl: Duration,
    days_ahead: u32,
) -> Result<ScanReport, PipelineError> {
    let today = Utc::now().date_naive();
    let to = today + chrono::Duration::days(i64::from(days_ahead));
    let mut report = ScanReport::default();

    let fixtures = match source.fetch(today, to).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = ?e, "fixture fetch failed");
            counter!("ingest_source_errors_total", "source" => "fixture").increment(1);
            report.source_error = Some(format!("{e:#}"));
            return Ok(report);
        }
    };
    report.fetched = fixtures.len();

    for fixture in fixtures {
        let id = fixture.fixture_id;
        let open = fixture.is_open();
        index.upsert(fixture);
        if !open {
            report.closed += 1;
            continue;
        }
        let fingerprint = format!("fixture:{id}");
        if !gate.check_and_mark(&fingerprint, ttl).await? {
            report.duplicates += 1;
            continue;
        }
        if let Err(e) = normal.push(QueueItem::new(id, None)).await {
            if let Err(re) = gate.release(&fingerprint).await {
                tracing::warn!(error = %re, fingerprint = %fingerprint, "dedup release failed");
            }
            return Err(e);
        }
        report.queued += 1;
    }
    index.prune_before(Utc::now() - chrono::Duration::days(1));

    counter!("fixture_scan_queued_total").increment(report.queued as u64);
    tracing::info!(
        fetched = report.fetched,
        queued = report.queued,
        duplicates = report.duplicates,
        closed = report.closed,
        known = index.len(),
        "fixture scan"
    );
    Ok(report)
}

pub struct FixtureScanDeps {
    pub gate: Arc<dyn DedupStore>,
    pub normal: Arc<dyn WorkQueue>,
    pub index: Arc<FixtureIndex>,
    pub health: Health,
    pub alerts: Arc<dyn AlertSink>,
}

/// Scan every `interval` until shutdown; the first scan runs immediately.
pub fn spawn_fixture_scan_loop(
    source: Arc<dyn FixtureSource>,
    deps: FixtureScanDeps,
    interval: Duration,
    ttl: Duration,
    days_ahead: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    const COMPONENT: &str = "fixture-scan";
    deps.health.mark_ok(COMPONENT);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let res = scan_fixtures_once(
                source.as_ref(),
                deps.gate.as_ref(),
                deps.normal.as_ref(),
                &deps.index,
                ttl,
                days_ahead,
            )
            .await;
            if let Err(e) = res {
                tracing::error!(error = %e, "fixture scan stopped: substrate failure");
                deps.health.mark_failed(COMPONENT, e.to_string());
                deps.alerts.raise(Alert::substrate(COMPONENT, &e.to_string())).await;
                break;
            }
        }
    })
}
