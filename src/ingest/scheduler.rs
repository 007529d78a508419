// src/ingest/scheduler.rs
//! Per-source polling loops and their bookkeeping.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::event::SourceKind;
use crate::health::Health;
use crate::ingest::dedup::DedupStore;
use crate::ingest::publish_cycle;
use crate::ingest::types::SourceAdapter;
use crate::notify::{Alert, AlertSink};
use crate::substrate::EventLog;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SourceStats {
    pub interval_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub runs: u64,
    pub errors: u64,
    pub published: u64,
}

/// Shared run history of every fetcher.
#[derive(Debug, Default)]
pub struct FetcherStats {
    inner: Mutex<BTreeMap<SourceKind, SourceStats>>,
}

impl FetcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: SourceKind, interval: Duration) {
        if let Ok(mut g) = self.inner.lock() {
            g.entry(source).or_default().interval_secs = interval.as_secs();
        }
    }

    pub fn record_run(&self, source: SourceKind, at: DateTime<Utc>, ok: bool, published: usize) {
        if let Ok(mut g) = self.inner.lock() {
            let s = g.entry(source).or_default();
            s.runs += 1;
            s.last_run = Some(at);
            s.published += published as u64;
            if ok {
                s.last_success = Some(at);
            } else {
                s.errors += 1;
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<SourceKind, SourceStats> {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Sources whose last run is older than twice their interval (or that
    /// never ran after that long since `started`).
    pub fn stale_sources(&self, now: DateTime<Utc>, started: DateTime<Utc>) -> Vec<SourceKind> {
        self.snapshot()
            .into_iter()
            .filter(|(_, s)| {
                let limit = chrono::Duration::seconds((s.interval_secs * 2) as i64);
                let since = s.last_run.unwrap_or(started);
                now - since > limit
            })
            .map(|(k, _)| k)
            .collect()
    }
}

#[derive(Clone)]
pub struct AdapterLoopCfg {
    pub interval: Duration,
    pub ttl: Duration,
}

/// What every fetcher loop shares.
#[derive(Clone)]
pub struct FetcherDeps {
    pub gate: Arc<dyn DedupStore>,
    pub log: Arc<dyn EventLog>,
    pub stats: Arc<FetcherStats>,
    pub health: Health,
    pub alerts: Arc<dyn AlertSink>,
}

/// Run `publish_cycle` for one adapter every `interval` until shutdown.
/// Missed ticks are skipped. A substrate failure stops the loop and marks
/// the fetcher failed.
pub fn spawn_adapter_loop(
    adapter: Arc<dyn SourceAdapter>,
    deps: FetcherDeps,
    cfg: AdapterLoopCfg,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let source = adapter.source();
    let component = format!("fetcher:{source}");
    let FetcherDeps {
        gate,
        log,
        stats,
        health,
        alerts,
    } = deps;
    stats.register(source, cfg.interval);
    health.mark_ok(&component);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            match publish_cycle(adapter.as_ref(), gate.as_ref(), log.as_ref(), cfg.ttl).await {
                Ok(report) => {
                    stats.record_run(source, now, report.source_error.is_none(), report.published);
                    counter!("ingest_runs_total", "source" => source.as_str()).increment(1);
                }
                Err(e) => {
                    stats.record_run(source, now, false, 0);
                    tracing::error!(error = %e, source = %source, "fetcher stopped: substrate failure");
                    health.mark_failed(&component, e.to_string());
                    alerts
                        .raise(Alert::substrate(&component, &e.to_string()))
                        .await;
                    break;
                }
            }
        }
        tracing::info!(source = %source, "fetcher loop exited");
    })
}

/// Log fetcher stats periodically and flag stale fetchers.
pub fn spawn_health_report(
    stats: Arc<FetcherStats>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let started = Utc::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now = Utc::now();
            let stale = stats.stale_sources(now, started);
            for (source, s) in stats.snapshot() {
                let is_stale = stale.contains(&source);
                gauge!("fetcher_stale", "source" => source.as_str()).set(if is_stale { 1.0 } else { 0.0 });
                tracing::info!(
                    target: "ingest",
                    source = %source,
                    runs = s.runs,
                    errors = s.errors,
                    published = s.published,
                    last_run = ?s.last_run,
                    stale = is_stale,
                    "fetcher health"
                );
            }
            if !stale.is_empty() {
                tracing::warn!(stale = ?stale, "stale fetchers detected");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_is_stale_after_twice_its_interval() {
        let stats = FetcherStats::new();
        stats.register(SourceKind::Rss, Duration::from_secs(60));
        stats.register(SourceKind::Odds, Duration::from_secs(600));
        let t0 = Utc::now();
        stats.record_run(SourceKind::Rss, t0, true, 3);
        stats.record_run(SourceKind::Odds, t0, false, 0);

        let later = t0 + chrono::Duration::seconds(121);
        assert_eq!(stats.stale_sources(later, t0), vec![SourceKind::Rss]);
        assert_eq!(stats.snapshot()[&SourceKind::Odds].errors, 1);
    }

    #[test]
    fn never_run_source_counts_from_start() {
        let stats = FetcherStats::new();
        stats.register(SourceKind::Social, Duration::from_secs(10));
        let t0 = Utc::now();
        assert!(stats.stale_sources(t0 + chrono::Duration::seconds(5), t0).is_empty());
        assert_eq!(
            stats.stale_sources(t0 + chrono::Duration::seconds(25), t0),
            vec![SourceKind::Social]
        );
    }
}
